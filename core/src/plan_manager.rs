//! Single owner of the current plan.
//!
//! The manager keeps the model's steps in submission order and hands the
//! scheduler one ready step at a time. External code only ever sees deep
//! copies; the `executing` flag is internal scheduling state.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use goagent_protocol::PlanStep;
use goagent_protocol::StepStatus;

use crate::error::AgentErr;
use crate::error::Result;

#[derive(Default)]
struct PlanState {
    order: Vec<String>,
    steps: HashMap<String, PlanStep>,
}

impl PlanState {
    /// A step is ready when it is pending, not already claimed, and every
    /// dependency that exists in this plan has completed. Dependencies on
    /// unknown ids never block; the orchestrator prunes completed-step ids
    /// before replacement, so a dangling reference means "already done or
    /// never planned".
    fn is_ready(&self, step: &PlanStep) -> bool {
        if step.status != StepStatus::Pending || step.executing {
            return false;
        }
        let Some(deps) = &step.waiting_for_id else {
            return true;
        };
        deps.iter().all(|dep| match self.steps.get(dep) {
            Some(dep_step) => dep_step.status == StepStatus::Completed,
            None => true,
        })
    }
}

/// Thread-safe registry of plan steps with a dependency-aware scheduler.
#[derive(Default)]
pub struct PlanManager {
    state: RwLock<PlanState>,
}

impl PlanManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, PlanState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, PlanState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Atomically swap in a new plan, preserving input order. Duplicate ids
    /// keep the first occurrence. Every step starts not-executing.
    pub fn replace(&self, steps: Vec<PlanStep>) {
        let mut state = self.write();
        state.order.clear();
        state.steps.clear();
        for mut step in steps {
            if state.steps.contains_key(&step.id) {
                continue;
            }
            step.executing = false;
            state.order.push(step.id.clone());
            state.steps.insert(step.id.clone(), step);
        }
    }

    /// Deep copy of every step in plan order.
    pub fn snapshot(&self) -> Vec<PlanStep> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.steps.get(id).cloned())
            .collect()
    }

    /// Claim the first ready step, marking it executing. Ties are broken by
    /// plan order.
    pub fn ready(&self) -> Option<PlanStep> {
        let mut state = self.write();
        let ready_id = state
            .order
            .iter()
            .find(|id| {
                state
                    .steps
                    .get(*id)
                    .map(|step| state.is_ready(step))
                    .unwrap_or(false)
            })
            .cloned()?;
        let step = state.steps.get_mut(&ready_id)?;
        step.executing = true;
        Some(step.clone())
    }

    /// How many steps the scheduler could claim right now. Read-only.
    pub fn executable_count(&self) -> usize {
        let state = self.read();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .steps
                    .get(*id)
                    .map(|step| state.is_ready(step))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Record a step outcome: set status, clear the executing claim, and
    /// overwrite the observation when one is provided.
    pub fn update_status(
        &self,
        id: &str,
        status: StepStatus,
        observation: Option<String>,
    ) -> Result<()> {
        let mut state = self.write();
        let step = state
            .steps
            .get_mut(id)
            .ok_or_else(|| AgentErr::UnknownStep(id.to_string()))?;
        step.status = status;
        step.executing = false;
        if observation.is_some() {
            step.observation = observation;
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        let state = self.read();
        state
            .steps
            .values()
            .any(|step| step.status == StepStatus::Pending)
    }

    /// Non-empty plan with every step completed.
    pub fn completed(&self) -> bool {
        let state = self.read();
        !state.steps.is_empty()
            && state
                .steps
                .values()
                .all(|step| step.status == StepStatus::Completed)
    }
}
