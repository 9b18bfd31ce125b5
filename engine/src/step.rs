//! Run-time record of one step execution within a branch.
//!
//! A `Step` carries only execution state. The step's text, modifiers, and
//! code block live on the [`StepNode`](crate::tree::StepNode) it references
//! by id; one node can back many steps across branches.

use std::time::SystemTime;

use serde_json::json;

use crate::error::StepError;

/// Pass/fail/skip state applied to a step or branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pass,
    Fail,
    Skip,
}

/// One execution of a step-definition node within one branch.
#[derive(Debug, Clone, Default)]
pub struct Step {
    /// Id of the step-definition node. Immutable after construction.
    pub id: usize,
    /// Id of the matching function-declaration node, if this step is a
    /// function call.
    pub fid: Option<usize>,
    /// Function-call nesting depth.
    pub level: u32,

    // At most one of the three is true at a time.
    pub is_passed: bool,
    pub is_failed: bool,
    pub is_skipped: bool,
    /// Transient; cleared when execution stops.
    pub is_running: bool,

    pub error: Option<StepError>,
    pub log: Vec<String>,
    /// Milliseconds. `-1` at branch level marks a paused, unmeasured run.
    pub elapsed: Option<i64>,
    pub time_started: Option<SystemTime>,
    pub time_ended: Option<SystemTime>,
    /// UI-highlight hint set by browser-facing code blocks.
    pub target_coords: Option<(f64, f64)>,
}

impl Step {
    pub fn new(id: usize) -> Step {
        Step {
            id,
            ..Step::default()
        }
    }

    /// True once the step has a pass/fail/skip result.
    pub fn is_complete(&self) -> bool {
        self.is_passed || self.is_failed || self.is_skipped
    }

    /// Clear any prior result so the step can run (or re-run).
    pub fn reset_result(&mut self) {
        self.is_passed = false;
        self.is_failed = false;
        self.is_skipped = false;
        self.error = None;
    }

    /// Set exactly one of the pass/fail/skip flags. The step is no longer
    /// running once it has a result.
    pub fn mark(&mut self, state: RunState) {
        self.reset_result();
        self.is_running = false;
        match state {
            RunState::Pass => self.is_passed = true,
            RunState::Fail => self.is_failed = true,
            RunState::Skip => self.is_skipped = true,
        }
    }

    pub fn append_log(&mut self, text: impl Into<String>) {
        self.log.push(text.into());
    }

    /// Compact representation for reports. Absent fields are omitted, not
    /// emitted as null.
    pub fn serialize(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("id".to_string(), json!(self.id));
        if let Some(fid) = self.fid {
            out.insert("fid".to_string(), json!(fid));
        }
        if self.level > 0 {
            out.insert("level".to_string(), json!(self.level));
        }
        if self.is_passed {
            out.insert("isPassed".to_string(), json!(true));
        }
        if self.is_failed {
            out.insert("isFailed".to_string(), json!(true));
        }
        if self.is_skipped {
            out.insert("isSkipped".to_string(), json!(true));
        }
        if self.is_running {
            out.insert("isRunning".to_string(), json!(true));
        }
        if let Some(error) = &self.error {
            out.insert("error".to_string(), json!(error));
        }
        if !self.log.is_empty() {
            out.insert("log".to_string(), json!(self.log));
        }
        if let Some(elapsed) = self.elapsed {
            out.insert("elapsed".to_string(), json!(elapsed));
        }
        if let Some((x, y)) = self.target_coords {
            out.insert("targetCoords".to_string(), json!({ "x": x, "y": y }));
        }
        serde_json::Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_keeps_result_flags_mutually_exclusive() {
        let mut step = Step::new(1);
        assert!(!step.is_complete());

        step.mark(RunState::Pass);
        assert!(step.is_passed && !step.is_failed && !step.is_skipped);
        assert!(step.is_complete());

        step.mark(RunState::Fail);
        assert!(!step.is_passed && step.is_failed && !step.is_skipped);

        step.mark(RunState::Skip);
        assert!(!step.is_passed && !step.is_failed && step.is_skipped);
    }

    #[test]
    fn mark_clears_the_running_flag() {
        let mut step = Step::new(1);
        step.is_running = true;
        step.mark(RunState::Pass);
        assert!(!step.is_running);
        assert!(step.serialize().get("isRunning").is_none());
    }

    #[test]
    fn serialize_omits_absent_fields() {
        let step = Step::new(3);
        assert_eq!(step.serialize(), serde_json::json!({"id": 3}));

        let mut step = Step::new(4);
        step.fid = Some(9);
        step.level = 2;
        step.mark(RunState::Fail);
        step.error = Some(StepError::new("boom"));
        let json = step.serialize();
        assert_eq!(json["fid"], serde_json::json!(9));
        assert_eq!(json["isFailed"], serde_json::json!(true));
        assert_eq!(json["error"]["message"], serde_json::json!("boom"));
        assert!(json.get("isPassed").is_none());
        assert!(json.get("elapsed").is_none());
    }
}
