//! Interface boundary to the orchestration layer.
//!
//! The real orchestrator (parallelism across instances, CLI, reporting) is
//! out of scope; the engine consumes only this narrow surface: seed data
//! for the global scope, the shared persistent map, and output/pause
//! policy. One `Runner` may back several instances, which is why
//! `persistent` is handed around by `Rc`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::config::RunConfig;
use crate::error::StepError;
use crate::value::Val;

/// Variable names are case-insensitive; maps are keyed by this form.
pub(crate) fn canonical_var_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Shared configuration and storage owned by the orchestration layer.
#[derive(Debug, Clone)]
pub struct Runner {
    /// Seed for each branch's global scope.
    pub global_init: HashMap<String, Val>,
    /// Run-wide storage, shared across branches (and across instances).
    pub persistent: Rc<RefCell<HashMap<String, Val>>>,

    pub output_errors: bool,
    pub console_output: bool,
    pub pause_on_fail: bool,
    /// Per-step wall-clock budget; code blocks may raise it at runtime.
    pub step_timeout: Duration,

    /// Mirrors of the owning instance's pause/stop signals.
    pub is_paused: bool,
    pub is_stopped: bool,
}

impl Default for Runner {
    fn default() -> Runner {
        Runner::from_config(&RunConfig::default())
    }
}

impl Runner {
    pub fn new() -> Runner {
        Runner::default()
    }

    pub fn from_config(config: &RunConfig) -> Runner {
        Runner {
            global_init: HashMap::new(),
            persistent: Rc::new(RefCell::new(HashMap::new())),
            output_errors: config.output_errors,
            console_output: config.console_output,
            pause_on_fail: config.pause_on_fail,
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            is_paused: false,
            is_stopped: false,
        }
    }

    /// Seed a global variable for every branch of the run.
    pub fn init_global(&mut self, name: &str, value: Val) {
        self.global_init.insert(canonical_var_name(name), value);
    }

    pub fn get_persistent(&self, name: &str) -> Option<Val> {
        self.persistent
            .borrow()
            .get(&canonical_var_name(name))
            .cloned()
    }

    pub fn set_persistent(&self, name: &str, value: Val) {
        self.persistent
            .borrow_mut()
            .insert(canonical_var_name(name), value);
    }

    /// Render a captured error for console output: message, attributed
    /// location, and any stack-trace text the code block recorded.
    pub fn format_stack_trace(&self, error: &StepError) -> String {
        let mut out = error.message.clone();
        if let Some(filename) = &error.filename {
            out.push_str("\n    at ");
            out.push_str(filename);
            if let Some(line) = error.line_number {
                out.push_str(&format!(":{line}"));
            }
        }
        if let Some(trace) = &error.stack_trace {
            out.push('\n');
            out.push_str(trace);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_carries_the_step_timeout() {
        let config = RunConfig {
            step_timeout_secs: 5,
            ..RunConfig::default()
        };
        let runner = Runner::from_config(&config);
        assert_eq!(runner.step_timeout, Duration::from_secs(5));
    }

    #[test]
    fn persistent_names_are_case_insensitive() {
        let runner = Runner::new();
        runner.set_persistent("Driver", Val::from("geckodriver"));
        assert_eq!(runner.get_persistent("dRiVeR"), Some(Val::from("geckodriver")));
    }

    #[test]
    fn persistent_is_shared_between_clones() {
        let runner = Runner::new();
        let view = runner.clone();
        runner.set_persistent("count", Val::from(1));
        assert_eq!(view.get_persistent("count"), Some(Val::from(1)));
    }

    #[test]
    fn format_stack_trace_includes_location() {
        let runner = Runner::new();
        let mut err = StepError::new("boom");
        err.locate(Some("login.smash"), Some(12));
        let out = runner.format_stack_trace(&err);
        assert!(out.contains("boom"));
        assert!(out.contains("at login.smash:12"));
    }
}
