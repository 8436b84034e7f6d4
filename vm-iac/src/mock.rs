//! Scripted executor for tests that must not spawn real tools.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::executor::{IacExecutor, Stage, StageOutcome, TerraformExecutor};
use crate::workdir::WorkDir;

/// One recorded stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStage {
    pub stage: Stage,
    pub wrapper: bool,
    pub has_home: bool,
}

/// Executor that succeeds (or fails at a chosen stage) without spawning anything.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    fail_at: Option<Stage>,
    failure_message: String,
    outputs: BTreeMap<String, String>,
    state: Option<String>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<RecordedStage>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, stage: Stage, message: impl Into<String>) -> Self {
        self.fail_at = Some(stage);
        self.failure_message = message.into();
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    /// Leave this local state file behind at apply, whether or not it fails.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Sleep this long in every stage.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedStage> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.calls().into_iter().map(|c| c.stage).collect()
    }
}

impl IacExecutor for ScriptedExecutor {
    fn run_stage(&self, workdir: &WorkDir, stage: Stage) -> Result<StageOutcome> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedStage {
                stage,
                wrapper: TerraformExecutor::uses_wrapper(workdir.path()),
                has_home: workdir.env().contains_key("HOME"),
            });
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        if stage == Stage::Apply {
            if let Some(state) = &self.state {
                workdir.restore_state(state)?;
            }
        }

        if self.fail_at == Some(stage) {
            return Ok(StageOutcome {
                stage,
                success: false,
                stdout: String::new(),
                stderr: self.failure_message.clone(),
                duration: Duration::ZERO,
                outputs: BTreeMap::new(),
            });
        }

        Ok(StageOutcome {
            stage,
            success: true,
            stdout: format!("{stage} complete"),
            stderr: String::new(),
            duration: Duration::ZERO,
            outputs: if stage == Stage::Apply {
                self.outputs.clone()
            } else {
                BTreeMap::new()
            },
        })
    }
}
