//! The runtime orchestrator.
//!
//! [`AgentRuntime`] is a queue pair: hosts send [`InputEvent`]s and
//! receive [`OutputEvent`]s. Internally one event-loop task owns the
//! inbound queue; each prompt runs as its own task guarded by the work
//! mutex, looping plan-request -> schedule -> observe until the plan is
//! empty, the model asks for input, the pass limit trips, or a fatal
//! error ends the prompt.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_channel::Receiver;
use async_channel::Sender;
use goagent_protocol::ChatMessage;
use goagent_protocol::EventLevel;
use goagent_protocol::InputEvent;
use goagent_protocol::OutputEvent;
use goagent_protocol::PlanObservationPayload;
use goagent_protocol::PlanStep;
use goagent_protocol::StepObservation;
use goagent_protocol::StepStatus;
use goagent_protocol::ToolCall;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::apply_patch::ApplyPatchCommand;
use crate::client::ModelClient;
use crate::client::ResponsesClient;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::PLAN_TOOL_NAME;
use crate::config::Config;
use crate::context_budget::ContextBudget;
use crate::error::AgentErr;
use crate::error::Result;
use crate::exec;
use crate::exec::cap_observation_buffer;
use crate::exec::CommandOutcome;
use crate::exec::ExecContext;
use crate::history;
use crate::history::HistoryStore;
use crate::input_reader;
use crate::internal_commands::CommandRegistry;
use crate::plan_manager::PlanManager;
use crate::plan_schema::PlanValidator;
use crate::plan_schema::ValidationFailure;
use crate::research::RunResearchCommand;
use crate::util::truncate_chars;
use crate::util::validation_backoff;
use crate::util::wait_for_cancel;

const INPUT_CHANNEL_CAPACITY: usize = 4;
const OUTPUT_CHANNEL_CAPACITY: usize = 16;
const STEP_RESULT_CAPACITY: usize = 16;
/// Validation details are clipped to this many characters in feedback.
const FEEDBACK_DETAIL_MAX_CHARS: usize = 512;

/// Handle to a running agent runtime.
pub struct AgentRuntime {
    tx_input: Sender<InputEvent>,
    rx_event: Receiver<OutputEvent>,
    session: Arc<Session>,
}

impl AgentRuntime {
    /// Spawn a runtime backed by the real Responses client.
    pub fn spawn(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let client: Arc<dyn ModelClient> = Arc::new(ResponsesClient::new(config.clone())?);
        Self::spawn_inner(config, client)
    }

    /// Spawn a runtime with an injected model client (tests, embedders).
    pub fn spawn_with_client(config: Config, client: Arc<dyn ModelClient>) -> Result<Self> {
        Self::spawn_inner(Arc::new(config), client)
    }

    fn spawn_inner(config: Arc<Config>, client: Arc<dyn ModelClient>) -> Result<Self> {
        // A schema that does not compile is a programming error, not
        // something to feed back to the model.
        let validator = PlanValidator::new()?;

        let (tx_input, rx_input) = async_channel::bounded(INPUT_CHANNEL_CAPACITY);
        let (tx_event, rx_event) = async_channel::bounded(OUTPUT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(ApplyPatchCommand));
        registry.register(Arc::new(RunResearchCommand::new(
            config.clone(),
            client.clone(),
        )));

        let budget = config
            .context_budget
            .map(ContextBudget::new)
            .unwrap_or_else(|| ContextBudget::for_model(&config.model));
        let session = Arc::new(Session {
            budget,
            history: HistoryStore::new(&config.system_prompt, config.amnesia_after_passes),
            plan: PlanManager::new(),
            registry: Arc::new(registry),
            validator,
            client,
            tx_event,
            tx_input: tx_input.clone(),
            cancel_tx,
            cancel_rx,
            pass: StdMutex::new(0),
            working: Arc::new(TokioMutex::new(())),
            commands: TokioMutex::new(()),
            closed: AtomicBool::new(false),
            human_cancel: AtomicBool::new(false),
            metrics: MetricCounters::default(),
            config,
        });

        if !session.config.disable_input_reader {
            input_reader::spawn(tx_input.clone(), session.config.exit_words.clone());
        }
        tokio::spawn(event_loop(session.clone(), rx_input));

        Ok(Self {
            tx_input,
            rx_event,
            session,
        })
    }

    pub async fn submit(&self, event: InputEvent) -> Result<()> {
        self.tx_input
            .send(event)
            .await
            .map_err(|_| AgentErr::ChannelClosed)
    }

    /// Next outbound event; errors once the runtime has closed and the
    /// queue drained.
    pub async fn next_event(&self) -> Result<OutputEvent> {
        self.rx_event
            .recv()
            .await
            .map_err(|_| AgentErr::ChannelClosed)
    }

    pub async fn shutdown(&self, reason: &str) -> Result<()> {
        self.submit(InputEvent::Shutdown {
            reason: reason.to_string(),
        })
        .await
    }

    /// Outbound events dropped because the queue stayed full past the
    /// emit timeout.
    pub fn dropped_events(&self) -> u64 {
        self.session.metrics.dropped_events.load(Ordering::Relaxed)
    }

    /// Snapshot of the runtime's counters.
    pub fn metrics(&self) -> RuntimeMetrics {
        self.session.metrics.snapshot()
    }

    /// Copy of the conversation history, for hosts that render or persist
    /// transcripts.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.session.history.snapshot()
    }
}

/// Counters accumulated over the life of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeMetrics {
    /// Model requests issued, including validation retries.
    pub plan_requests: u64,
    /// Plan-execution passes started.
    pub passes: u64,
    pub steps_executed: u64,
    pub steps_failed: u64,
    pub dropped_events: u64,
}

#[derive(Default)]
struct MetricCounters {
    plan_requests: AtomicU64,
    passes: AtomicU64,
    steps_executed: AtomicU64,
    steps_failed: AtomicU64,
    dropped_events: AtomicU64,
}

impl MetricCounters {
    fn snapshot(&self) -> RuntimeMetrics {
        RuntimeMetrics {
            plan_requests: self.plan_requests.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

/// How one prompt session ended, from the prompt task's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopOutcome {
    /// The loop stopped and nobody asked the operator for anything yet.
    Idle,
    /// A RequestInput event was already emitted.
    InputRequested,
    /// The runtime closed (hands-free completion or fatal hands-free stop).
    Closed,
}

struct Session {
    config: Arc<Config>,
    client: Arc<dyn ModelClient>,
    validator: PlanValidator,
    registry: Arc<CommandRegistry>,
    history: HistoryStore,
    plan: PlanManager,
    budget: ContextBudget,

    tx_event: Sender<OutputEvent>,
    /// Used for hands-free self-prompts; never blocks the event loop.
    tx_input: Sender<InputEvent>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,

    pass: StdMutex<u64>,
    /// At most one prompt is processed end to end.
    working: Arc<TokioMutex<()>>,
    /// At most one pass executes commands at a time.
    commands: TokioMutex<()>,
    closed: AtomicBool,
    /// Set when a Cancel/Shutdown input event arrived, so a cancellation
    /// that interrupts running steps is reported as operator-initiated.
    human_cancel: AtomicBool,
    metrics: MetricCounters,
}

async fn event_loop(sess: Arc<Session>, rx_input: Receiver<InputEvent>) {
    sess.emit(OutputEvent::status("Agent runtime started")).await;
    if sess.config.hands_free {
        let topic = sess.config.hands_free_topic.clone();
        if sess.tx_input.try_send(InputEvent::Prompt { prompt: topic }).is_err() {
            warn!("failed to queue hands-free topic prompt");
        }
    } else {
        sess.request_input("Enter a prompt to begin.").await;
    }

    let mut cancel = sess.cancel_rx.clone();
    loop {
        let event = tokio::select! {
            _ = wait_for_cancel(&mut cancel) => break,
            received = rx_input.recv() => match received {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        match event {
            InputEvent::Prompt { prompt } => sess.handle_prompt(prompt).await,
            InputEvent::Cancel { reason } => {
                sess.human_cancel.store(true, Ordering::SeqCst);
                sess.emit(OutputEvent::warn_status(format!(
                    "Cancel requested ({reason}); the in-flight pass will finish first."
                )))
                .await;
                sess.request_input("Enter a prompt to continue.").await;
            }
            InputEvent::Shutdown { reason } => {
                sess.human_cancel.store(true, Ordering::SeqCst);
                sess.emit(OutputEvent::status(format!("Shutting down: {reason}")))
                    .await;
                break;
            }
        }
        if sess.is_closed() {
            break;
        }
    }
    sess.close();
}

/// Runs one prompt session, then returns the work guard.
async fn run_prompt(sess: Arc<Session>, guard: OwnedMutexGuard<()>) {
    let outcome = sess.plan_execution_loop().await;
    drop(guard);
    match outcome {
        LoopOutcome::InputRequested | LoopOutcome::Closed => {}
        LoopOutcome::Idle => {
            if sess.config.hands_free {
                // A hands-free runtime with nothing left to do is done;
                // without this it would prompt itself forever.
                sess.close();
            } else if !sess.is_closed() {
                sess.request_input("Enter a prompt to continue.").await;
            }
        }
    }
}

impl Session {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_canceled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Idempotent: the first close cancels derived work and closes both
    /// queues; later calls are no-ops.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        self.tx_event.close();
        self.tx_input.close();
        info!("agent runtime closed");
    }

    fn current_pass(&self) -> u64 {
        match self.pass.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn increment_pass(&self) -> u64 {
        let mut guard = match self.pass.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard += 1;
        *guard
    }

    fn reset_pass(&self) {
        let mut guard = match self.pass.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = 0;
    }

    /// Emit an outbound event, stamping pass and agent. When an emit
    /// timeout is configured, a send that stays blocked past it drops the
    /// event and bumps the dropped-event counter.
    async fn emit(&self, mut event: OutputEvent) {
        event.pass = self.current_pass();
        event.agent = self.config.agent_label.clone();
        if self.config.emit_timeout > Duration::ZERO {
            match tokio::time::timeout(self.config.emit_timeout, self.tx_event.send(event)).await {
                Ok(_) => {}
                Err(_) => {
                    let total = self.metrics.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("outbound queue blocked; dropped event ({total} dropped so far)");
                }
            }
        } else {
            let _ = self.tx_event.send(event).await;
        }
    }

    /// Emit RequestInput; in hands-free mode also queue the auto-reply so
    /// the runtime answers itself.
    async fn request_input(&self, message: &str) {
        self.emit(OutputEvent::request_input(message)).await;
        if self.config.hands_free && !self.is_closed() {
            let reply = InputEvent::Prompt {
                prompt: self.config.hands_free_auto_reply.clone(),
            };
            if self.tx_input.try_send(reply).is_err() {
                debug!("inbound queue full; skipping hands-free auto-reply");
            }
        }
    }

    async fn handle_prompt(self: &Arc<Self>, prompt: String) {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            self.emit(OutputEvent::warn_status("Ignoring empty prompt.")).await;
            self.request_input("Enter a prompt to begin.").await;
            return;
        }
        let guard = match Arc::clone(&self.working).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.emit(OutputEvent::warn_status(
                    "Already processing a prompt; ignoring the new one.",
                ))
                .await;
                return;
            }
        };
        self.reset_pass();
        self.human_cancel.store(false, Ordering::SeqCst);
        self.history.append(ChatMessage::user(prompt), 0);
        tokio::spawn(run_prompt(self.clone(), guard));
    }

    async fn plan_execution_loop(self: &Arc<Self>) -> LoopOutcome {
        loop {
            if self.is_canceled() || self.is_closed() {
                return LoopOutcome::Idle;
            }
            let pass = self.increment_pass();
            self.metrics.passes.fetch_add(1, Ordering::Relaxed);
            if self.config.max_passes > 0 && pass > self.config.max_passes {
                self.emit(OutputEvent::error(format!(
                    "Reached the maximum of {} pass(es) without finishing.",
                    self.config.max_passes
                )))
                .await;
                if self.config.hands_free {
                    self.close();
                    return LoopOutcome::Closed;
                }
                return LoopOutcome::Idle;
            }

            let (tool_call, response) = match self.request_plan(pass).await {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    self.emit(OutputEvent::error("Received nil plan response")).await;
                    return LoopOutcome::Idle;
                }
                Err(AgentErr::Interrupted) => return LoopOutcome::Idle,
                Err(err) => {
                    self.emit(OutputEvent::error(format!("Plan request failed: {err}")))
                        .await;
                    return LoopOutcome::Idle;
                }
            };

            // Prune steps the model already marked completed, and drop
            // their ids from the dependency lists of what remains.
            let completed_ids: HashSet<String> = response
                .plan
                .iter()
                .filter(|step| step.status == StepStatus::Completed)
                .map(|step| step.id.clone())
                .collect();
            let mut pruned: Vec<PlanStep> = response
                .plan
                .iter()
                .filter(|step| step.status != StepStatus::Completed)
                .cloned()
                .collect();
            for step in &mut pruned {
                if let Some(deps) = &mut step.waiting_for_id {
                    deps.retain(|dep| !completed_ids.contains(dep));
                    if deps.is_empty() {
                        step.waiting_for_id = None;
                    }
                }
            }

            self.history.append(
                ChatMessage::assistant_with_tool_call(response.message.clone(), tool_call.clone()),
                pass,
            );
            self.plan.replace(pruned.clone());

            self.emit(OutputEvent::status(format!(
                "Received plan with {} step(s).",
                pruned.len()
            )))
            .await;
            let reasoning: Vec<String> = response
                .reasoning
                .iter()
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect();
            let mut message_event = OutputEvent::assistant_message(response.message.clone())
                .with_metadata(
                    "plan",
                    serde_json::to_value(&pruned).unwrap_or_default(),
                )
                .with_metadata("tool_call_id", tool_call.id.clone().into())
                .with_metadata("tool_name", tool_call.name.clone().into())
                .with_metadata(
                    "require_human_input",
                    response.require_human_input.into(),
                );
            if !reasoning.is_empty() {
                message_event = message_event
                    .with_metadata("reasoning", serde_json::to_value(&reasoning).unwrap_or_default());
            }
            self.emit(message_event).await;

            if response.require_human_input {
                let payload = PlanObservationPayload {
                    summary: "Assistant requested additional input before continuing the plan."
                        .to_string(),
                    ..Default::default()
                };
                self.append_observation(&tool_call.id, payload, pass);
                self.request_input("Assistant requested additional input.").await;
                return LoopOutcome::InputRequested;
            }

            if self.plan.executable_count() == 0 {
                let payload = PlanObservationPayload {
                    summary: "Assistant returned a plan without executable steps".to_string(),
                    ..Default::default()
                };
                self.append_observation(&tool_call.id, payload, pass);
                self.emit(OutputEvent::status("Plan has no executable steps.")).await;
                if self.config.hands_free {
                    self.emit(OutputEvent::status(format!(
                        "Hands-free session complete after {pass} pass(es): {}",
                        response.message.trim()
                    )))
                    .await;
                    self.close();
                    return LoopOutcome::Closed;
                }
                return LoopOutcome::Idle;
            }

            self.execute_pending(pass, &tool_call).await;
        }
    }

    /// Request a plan, running the validation feedback protocol until the
    /// model produces arguments that parse and validate.
    async fn request_plan(
        self: &Arc<Self>,
        pass: u64,
    ) -> Result<Option<(ToolCall, goagent_protocol::PlanResponse)>> {
        let mut attempt: u32 = 0;
        loop {
            if self.is_canceled() || self.is_closed() {
                return Err(AgentErr::Interrupted);
            }
            attempt += 1;
            self.metrics.plan_requests.fetch_add(1, Ordering::Relaxed);
            let snapshot = self.history.planning_snapshot(&self.budget);
            if let Some(path) = &self.config.history_log_path {
                history::persist_snapshot(path, &snapshot);
            }
            let prompt = Prompt { messages: snapshot };

            let (tx_delta, mut rx_delta) = mpsc::channel::<ResponseEvent>(64);
            let forwarder = tokio::spawn({
                let sess = Arc::clone(self);
                async move {
                    while let Some(ResponseEvent::OutputTextDelta(delta)) = rx_delta.recv().await {
                        sess.emit(OutputEvent::assistant_delta(delta)).await;
                    }
                }
            });
            let result = self.client.stream_plan(&prompt, tx_delta).await;
            let _ = forwarder.await;

            let tool_call = match result? {
                Some(tool_call) => tool_call,
                None => return Ok(None),
            };
            match self.validator.validate(&tool_call) {
                Ok(response) => return Ok(Some((tool_call, response))),
                Err(failure) => {
                    self.run_validation_feedback(&tool_call, &failure, pass, attempt)
                        .await;
                }
            }
        }
    }

    /// Feedback protocol for a rejected plan: warn the host, append the
    /// offending assistant turn plus its observation, ask the model to try
    /// again, and back off.
    async fn run_validation_feedback(
        &self,
        tool_call: &ToolCall,
        failure: &ValidationFailure,
        pass: u64,
        attempt: u32,
    ) {
        self.emit(
            OutputEvent::warn_status(failure.summary.clone())
                .with_metadata("details", failure.details.clone().into()),
        )
        .await;

        self.history.append(
            ChatMessage::assistant_with_tool_call("", tool_call.clone()),
            pass,
        );
        if !tool_call.id.is_empty() {
            self.append_observation(&tool_call.id, failure.payload.clone(), pass);
        }
        let feedback = format!(
            "{} {} Please call {PLAN_TOOL_NAME} again with JSON that strictly matches the provided schema.",
            failure.summary,
            truncate_chars(&failure.details, FEEDBACK_DETAIL_MAX_CHARS),
        );
        self.history.append(ChatMessage::user(feedback), pass);

        let delay = validation_backoff(attempt);
        debug!(attempt, ?delay, "plan validation failed; backing off");
        tokio::time::sleep(delay).await;
    }

    /// Encode an observation payload and append it as the pass's tool
    /// message.
    fn append_observation(&self, tool_call_id: &str, mut payload: PlanObservationPayload, pass: u64) {
        cap_observation_buffer(&mut payload.stdout, &mut payload.truncated);
        cap_observation_buffer(&mut payload.stderr, &mut payload.truncated);
        if let Some(observations) = &mut payload.plan_observation {
            for obs in observations.iter_mut() {
                cap_observation_buffer(&mut obs.stdout, &mut obs.truncated);
                cap_observation_buffer(&mut obs.stderr, &mut obs.truncated);
            }
        }
        let content = match serde_json::to_string_pretty(&payload) {
            Ok(content) => content,
            Err(err) => {
                warn!("failed to encode observation payload: {err}");
                "{}".to_string()
            }
        };
        self.history
            .append(ChatMessage::tool(tool_call_id, PLAN_TOOL_NAME, content), pass);
    }

    /// Run every ready step of the current plan, workers in parallel, and
    /// append the consolidated observation.
    async fn execute_pending(self: &Arc<Self>, pass: u64, tool_call: &ToolCall) {
        let _commands_guard = self.commands.lock().await;
        let exec_ctx = Arc::new(ExecContext {
            registry: self.registry.clone(),
            root_cwd: self.config.cwd.clone(),
            cancel: self.cancel_rx.clone(),
        });

        let (tx_done, mut rx_done) =
            mpsc::channel::<(PlanStep, CommandOutcome, Option<AgentErr>)>(STEP_RESULT_CAPACITY);
        let mut cancel = self.cancel_rx.clone();

        let mut executing = 0usize;
        let mut halt_scheduling = false;
        let mut canceled = false;
        let mut final_err: Option<String> = None;
        let mut results: Vec<StepObservation> = Vec::new();
        let mut last_outcome: Option<CommandOutcome> = None;
        let mut last_step_id = String::new();

        loop {
            if !halt_scheduling {
                while let Some(step) = self.plan.ready() {
                    self.emit(
                        OutputEvent::status(format!("Executing step {}: {}", step.id, step.title))
                            .with_metadata("step_id", step.id.clone().into())
                            .with_metadata("title", step.title.clone().into())
                            .with_metadata("shell", step.command.shell.clone().into()),
                    )
                    .await;
                    executing += 1;
                    let tx = tx_done.clone();
                    let ctx = exec_ctx.clone();
                    tokio::spawn(async move {
                        let (outcome, error) = exec::execute_step(&ctx, &step).await;
                        let _ = tx.send((step, outcome, error)).await;
                    });
                }
            }

            if executing == 0 {
                // Nothing running and nothing ready: either the rest of
                // the plan is blocked (next pass will see why) or we are
                // done.
                if !self.plan.has_pending() {
                    self.emit(OutputEvent::status("Plan execution completed.")).await;
                }
                break;
            }

            let completion = tokio::select! {
                done = rx_done.recv() => done,
                _ = wait_for_cancel(&mut cancel), if !canceled => {
                    canceled = true;
                    halt_scheduling = true;
                    if final_err.is_none() {
                        final_err = Some("operation canceled".to_string());
                    }
                    continue;
                }
            };
            let Some((step, mut outcome, error)) = completion else {
                break;
            };
            executing -= 1;

            let status = if error.is_some() {
                StepStatus::Failed
            } else {
                StepStatus::Completed
            };
            self.metrics.steps_executed.fetch_add(1, Ordering::Relaxed);
            if error.is_some() {
                self.metrics.steps_failed.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(err) = &error {
                halt_scheduling = true;
                if matches!(err, AgentErr::Interrupted) {
                    canceled = true;
                }
                if final_err.is_none() {
                    final_err = Some(err.to_string());
                }
                if outcome.details.is_empty() {
                    outcome.details = err.to_string();
                }
            }

            let observation = if outcome.details.is_empty() {
                None
            } else {
                Some(outcome.details.clone())
            };
            if let Err(update_err) = self.plan.update_status(&step.id, status, observation) {
                self.emit(OutputEvent::error(format!(
                    "Failed to record outcome of step {}: {update_err}",
                    step.id
                )))
                .await;
                halt_scheduling = true;
                if final_err.is_none() {
                    final_err = Some(update_err.to_string());
                }
            }

            results.push(StepObservation {
                id: step.id.clone(),
                status,
                stdout: outcome.stdout.clone(),
                stderr: outcome.stderr.clone(),
                exit_code: outcome.exit_code,
                details: outcome.details.clone(),
                truncated: outcome.truncated,
            });
            last_step_id = step.id.clone();

            let mut step_event = match &error {
                None => OutputEvent::status(format!("Step {} completed.", step.id)),
                Some(err) => {
                    let mut event =
                        OutputEvent::status(format!("Step {} failed: {err}", step.id));
                    event.level = EventLevel::Error;
                    event
                }
            };
            if let Some(code) = outcome.exit_code {
                step_event = step_event.with_metadata("exit_code", code.into());
            }
            step_event = step_event
                .with_metadata("duration_ms", (outcome.duration.as_millis() as u64).into());
            self.emit(step_event).await;

            last_outcome = Some(outcome);
        }
        drop(tx_done);

        let mut payload = PlanObservationPayload {
            plan_observation: if results.is_empty() {
                None
            } else {
                Some(results.clone())
            },
            operation_canceled: canceled,
            canceled_by_human: canceled && self.human_cancel.load(Ordering::SeqCst),
            ..Default::default()
        };
        if let Some(last) = last_outcome {
            payload.stdout = last.stdout;
            payload.stderr = last.stderr;
            payload.truncated = last.truncated;
            payload.exit_code = last.exit_code;
            payload.details = last.details;
        }
        payload.summary = match (results.is_empty(), &final_err) {
            (true, Some(_)) => "Failed before executing plan steps.".to_string(),
            (true, None) => "No plan steps were executed.".to_string(),
            (false, Some(_)) => format!("Execution halted during step {last_step_id}."),
            (false, None) => format!("Executed {} plan step(s).", results.len()),
        };
        if payload.details.is_empty() {
            if let Some(err) = &final_err {
                payload.details = err.clone();
            }
        }
        self.append_observation(&tool_call.id, payload, pass);
    }
}
