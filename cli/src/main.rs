//! `goagent` terminal front-end.
//!
//! Wires the runtime's event queues to stdin/stdout: assistant deltas
//! stream to stdout, status and errors go to stderr, and the stdin reader
//! inside the runtime turns lines into prompts. Exit codes: 0 on success,
//! 1 on runtime failure, 2 on argument errors (clap's default).

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use goagent_core::AgentRuntime;
use goagent_core::Config;
use goagent_protocol::EventLevel;
use goagent_protocol::InputEvent;
use goagent_protocol::OutputEventKind;
use goagent_protocol::PlanStep;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "goagent", about = "Autonomous agent runtime for OpenAI-compatible endpoints")]
struct Cli {
    /// Run a single prompt and exit when the agent is done.
    #[arg(long)]
    prompt: Option<String>,

    /// Run autonomously toward this goal, synthesizing continue prompts.
    #[arg(long, value_name = "TOPIC")]
    hands_free: Option<String>,

    /// Hard cap on plan-execution passes per prompt (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_passes: u64,

    /// Model id; overrides OPENAI_MODEL.
    #[arg(long)]
    model: Option<String>,

    /// API base URL; overrides OPENAI_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Reasoning effort hint; overrides OPENAI_REASONING_EFFORT.
    #[arg(long)]
    reasoning_effort: Option<String>,

    /// Working directory plan steps resolve against.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// History snapshot path ("" disables).
    #[arg(long)]
    history_log: Option<String>,

    /// Truncate assistant/tool content after this many passes (0 = never).
    #[arg(long, default_value_t = 0)]
    amnesia_after: u64,

    /// Explicit .env file to load before reading the environment.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            if let Err(err) = dotenvy::from_path(path) {
                eprintln!("error: failed to load {}: {err}", path.display());
                return ExitCode::from(2);
            }
        }
        None => {
            // Best-effort: a missing .env is fine.
            let _ = dotenvy::dotenv();
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };
    apply_overrides(&mut config, &cli);

    match run(config, &cli).await {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.trim_end_matches('/').to_string();
    }
    if let Some(effort) = &cli.reasoning_effort {
        config.reasoning_effort = effort.clone();
    }
    if let Some(cwd) = &cli.cwd {
        config.cwd = cwd.clone();
    }
    if let Some(history_log) = &cli.history_log {
        config.history_log_path = if history_log.is_empty() {
            None
        } else {
            Some(PathBuf::from(history_log))
        };
    }
    config.max_passes = cli.max_passes;
    config.amnesia_after_passes = cli.amnesia_after;
    if let Some(topic) = &cli.hands_free {
        config.hands_free = true;
        config.hands_free_topic = topic.clone();
        config.disable_input_reader = true;
    }
    if cli.prompt.is_some() {
        // One-shot: the prompt comes from the flag, not the terminal.
        config.disable_input_reader = true;
    }
}

/// Drive the runtime until it closes. Returns whether the session ended
/// cleanly (no fatal error in a non-interactive run).
async fn run(config: Config, cli: &Cli) -> anyhow::Result<bool> {
    let one_shot = cli.prompt.clone();
    let interactive = one_shot.is_none() && cli.hands_free.is_none();
    let runtime = AgentRuntime::spawn(config)?;

    let mut submitted = false;
    let mut requests_seen = 0u32;
    let mut clean = true;
    let mut streaming = false;

    while let Ok(event) = runtime.next_event().await {
        match event.kind {
            OutputEventKind::AssistantDelta => {
                print!("{}", event.message);
                let _ = std::io::stdout().flush();
                streaming = true;
            }
            OutputEventKind::AssistantMessage => {
                if streaming {
                    println!();
                    streaming = false;
                }
                if let Some(rendered) = render_plan(&event.metadata) {
                    eprintln!("{rendered}");
                }
            }
            OutputEventKind::Status => match event.level {
                EventLevel::Error => eprintln!("[error] {}", event.message),
                EventLevel::Warn => eprintln!("[warn] {}", event.message),
                EventLevel::Info => eprintln!("[agent] {}", event.message),
            },
            OutputEventKind::Error => {
                eprintln!("[error] {}", event.message);
                if !interactive {
                    clean = false;
                }
            }
            OutputEventKind::RequestInput => {
                requests_seen += 1;
                if let Some(prompt) = &one_shot {
                    if !submitted {
                        submitted = true;
                        runtime
                            .submit(InputEvent::Prompt {
                                prompt: prompt.clone(),
                            })
                            .await?;
                    } else if requests_seen > 1 {
                        // The agent is idle again: the one-shot is done.
                        let _ = runtime.shutdown("prompt complete").await;
                    }
                } else if interactive {
                    eprint!("> ");
                    let _ = std::io::stderr().flush();
                }
            }
        }
    }
    Ok(clean)
}

/// Render the plan attached to an assistant message as a short step list.
fn render_plan(metadata: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    let steps: Vec<PlanStep> =
        serde_json::from_value(metadata.get("plan")?.clone()).ok()?;
    if steps.is_empty() {
        return None;
    }
    let mut lines = vec![format!("[plan] {} step(s):", steps.len())];
    for step in &steps {
        let mut line = format!("  - {}: {}", step.id, step.title);
        if let Some(deps) = &step.waiting_for_id {
            if !deps.is_empty() {
                line.push_str(&format!(" (after {})", deps.join(", ")));
            }
        }
        lines.push(line);
    }
    Some(lines.join("\n"))
}
