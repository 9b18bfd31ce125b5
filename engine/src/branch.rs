//! An ordered, executable sequence of steps plus its surrounding hooks.
//!
//! Branches are built by the external tree-expansion algorithm and handed
//! to the engine one at a time. The branch owns its run-time state; step
//! text and modifiers stay on the shared step nodes, so folding operations
//! here take the [`StepNodeIndex`] to look them up.

use std::time::SystemTime;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::StepError;
use crate::step::{RunState, Step};
use crate::tree::StepNodeIndex;

/// Branch priority taken from frequency-valued group tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Low,
    Med,
    High,
}

impl Frequency {
    /// Parse a group tag as a frequency token, if it is one.
    pub fn from_group(group: &str) -> Option<Frequency> {
        match group {
            "low" => Some(Frequency::Low),
            "med" => Some(Frequency::Med),
            "high" => Some(Frequency::High),
            _ => None,
        }
    }
}

/// How much per-step data `mark_branch` retains for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepDataMode {
    /// Keep everything.
    #[default]
    All,
    /// Keep step data only for failed branches.
    Fail,
    /// Always strip step data down to ids and result flags.
    None,
}

/// One complete path through the test tree, the unit of pass/fail
/// reporting.
#[derive(Debug, Clone, Default)]
pub struct Branch {
    pub steps: Vec<Step>,

    /// Branches sharing a token may not run concurrently (enforced by the
    /// external orchestrator).
    pub non_parallel_ids: Vec<String>,
    pub frequency: Option<Frequency>,
    pub groups: Vec<String>,

    // Aggregated OR of the contained steps' modifiers.
    pub is_skip_branch: bool,
    pub is_only: bool,
    pub is_debug: bool,

    pub before_every_branch: Vec<Step>,
    pub after_every_branch: Vec<Step>,
    pub before_every_step: Vec<Step>,
    pub after_every_step: Vec<Step>,

    pub is_passed: bool,
    pub is_failed: bool,
    pub is_skipped: bool,
    /// Carried over from a previous run; do not re-run.
    pub passed_last_time: bool,
    pub is_running: bool,

    /// Branch-level failure not attributable to one step.
    pub error: Option<StepError>,
    pub log: Vec<String>,
    /// Milliseconds; `-1` when the branch was paused and not measured.
    pub elapsed: Option<i64>,
    pub time_started: Option<SystemTime>,
    pub time_ended: Option<SystemTime>,

    /// Content fingerprint over canonical step text + code blocks.
    pub hash: Option<String>,
}

impl Branch {
    pub fn new() -> Branch {
        Branch::default()
    }

    /// True once the branch has a result (or was carried over as passed).
    pub fn is_complete(&self) -> bool {
        self.is_passed || self.is_failed || self.is_skipped || self.passed_last_time
    }

    /// Append a step, folding its modifiers and groups into the branch.
    pub fn push(&mut self, step: Step, index: &StepNodeIndex) {
        self.fold_step(&step, index, false);
        self.steps.push(step);
    }

    /// Prepend a step. Front insertion only sets `frequency` when unset, so
    /// an inner (later-pushed) frequency keeps priority over outer defaults.
    pub fn unshift(&mut self, step: Step, index: &StepNodeIndex) {
        self.fold_step(&step, index, true);
        self.steps.insert(0, step);
    }

    fn fold_step(&mut self, step: &Step, index: &StepNodeIndex, front: bool) {
        for id in [Some(step.id), step.fid].into_iter().flatten() {
            let Some(node) = index.get(id) else {
                continue;
            };
            self.is_skip_branch |= node.is_skip_branch;
            self.is_only |= node.is_only;
            self.is_debug |= node.is_debug();
            for group in &node.groups {
                if let Some(frequency) = Frequency::from_group(group) {
                    if !front || self.frequency.is_none() {
                        self.frequency = Some(frequency);
                    }
                } else if !self.groups.contains(group) {
                    self.groups.push(group.clone());
                }
            }
        }
    }

    /// Concatenate `other`'s steps after this branch's and combine
    /// metadata. Hook ordering realizes "outer scope brackets inner scope":
    /// `other`'s before-hooks run first (prepended), its after-hooks run
    /// last (appended).
    pub fn merge_to_end(&mut self, other: &Branch) {
        self.steps.extend(other.steps.iter().cloned());
        self.non_parallel_ids
            .extend(other.non_parallel_ids.iter().cloned());
        if other.frequency.is_some() {
            self.frequency = other.frequency;
        }
        for group in &other.groups {
            if !self.groups.contains(group) {
                self.groups.push(group.clone());
            }
        }
        self.is_skip_branch |= other.is_skip_branch;
        self.is_only |= other.is_only;
        self.is_debug |= other.is_debug;

        self.before_every_branch
            .splice(0..0, other.before_every_branch.iter().cloned());
        self.before_every_step
            .splice(0..0, other.before_every_step.iter().cloned());
        self.after_every_branch
            .extend(other.after_every_branch.iter().cloned());
        self.after_every_step
            .extend(other.after_every_step.iter().cloned());
    }

    /// Step-for-step equality on canonical text plus body identity: same
    /// function declaration for declaration-backed steps, byte-identical
    /// code block text for steps with their own block. `n` limits the
    /// comparison to the first `n` steps.
    pub fn equals(&self, other: &Branch, index: &StepNodeIndex, n: Option<usize>) -> bool {
        let limit = n.unwrap_or(usize::MAX);
        let mine = &self.steps[..self.steps.len().min(limit)];
        let theirs = &other.steps[..other.steps.len().min(limit)];
        if mine.len() != theirs.len() {
            return false;
        }
        mine.iter().zip(theirs.iter()).all(|(a, b)| {
            let (Some(node_a), Some(node_b)) = (index.get(a.id), index.get(b.id)) else {
                return false;
            };
            if node_a.canonical_text() != node_b.canonical_text() {
                return false;
            }
            match (&node_a.code_block, &node_b.code_block) {
                (Some(block_a), Some(block_b)) => block_a.source == block_b.source,
                (None, None) => a.fid == b.fid,
                _ => false,
            }
        })
    }

    /// Recompute `hash`: a 128-bit digest over each step's canonical text
    /// plus its (or its function declaration's) code block text,
    /// newline-joined. Stable across pure-whitespace edits, changed by any
    /// code block edit.
    pub fn update_hash(&mut self, index: &StepNodeIndex) {
        let mut lines = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let mut line = index
                .get(step.id)
                .map(|node| node.canonical_text())
                .unwrap_or_default();
            if let Some(block) = index.effective_code_block(step) {
                line.push_str(&block.source);
            }
            lines.push(line);
        }
        let digest = Sha256::digest(lines.join("\n").as_bytes());
        self.hash = Some(hex::encode(&digest[..16]));
    }

    /// Reset then set exactly one completion flag; record the error when
    /// failing; compact per-step data according to `mode`.
    ///
    /// Compaction is irreversible: stripped steps keep only their ids,
    /// levels, and result flags (and `is_passed` only if the branch did not
    /// pass as a whole).
    pub fn mark_branch(&mut self, state: RunState, error: Option<StepError>, mode: StepDataMode) {
        self.is_passed = false;
        self.is_failed = false;
        self.is_skipped = false;
        self.passed_last_time = false;
        match state {
            RunState::Pass => self.is_passed = true,
            RunState::Fail => self.is_failed = true,
            RunState::Skip => self.is_skipped = true,
        }
        if let Some(error) = error {
            if self.is_failed {
                self.error = Some(error);
            }
        }
        match mode {
            StepDataMode::All => {}
            StepDataMode::Fail => {
                if !self.is_failed {
                    self.strip_step_data();
                }
            }
            StepDataMode::None => self.strip_step_data(),
        }
    }

    fn strip_step_data(&mut self) {
        let branch_passed = self.is_passed;
        for step in &mut self.steps {
            step.error = None;
            step.log.clear();
            step.elapsed = None;
            step.time_started = None;
            step.time_ended = None;
            step.target_coords = None;
            if branch_passed {
                step.is_passed = false;
            }
        }
    }

    /// Mark one step's result; if it is the branch's last step or the
    /// caller wants the branch finished now, derive the branch result.
    pub fn mark_step(
        &mut self,
        state: RunState,
        idx: usize,
        error: Option<StepError>,
        finish_branch_now: bool,
        mode: StepDataMode,
    ) {
        let step = &mut self.steps[idx];
        step.mark(state);
        if let Some(error) = error {
            step.error = Some(error);
        }
        if finish_branch_now || idx + 1 == self.steps.len() {
            self.finish_off_branch(mode);
        }
    }

    /// Branch fails if any step failed, else passes.
    pub fn finish_off_branch(&mut self, mode: StepDataMode) {
        if self.steps.iter().any(|s| s.is_failed) {
            self.mark_branch(RunState::Fail, None, mode);
        } else {
            self.mark_branch(RunState::Pass, None, mode);
        }
    }

    pub fn append_log(&mut self, text: impl Into<String>) {
        self.log.push(text.into());
    }

    /// Compact report representation; absent fields are omitted.
    pub fn serialize(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert(
            "steps".to_string(),
            json!(self.steps.iter().map(Step::serialize).collect::<Vec<_>>()),
        );
        if self.is_passed || self.passed_last_time {
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
        if let Some(hash) = &self.hash {
            out.insert("hash".to_string(), json!(hash));
        }
        serde_json::Value::Object(out)
    }
}
