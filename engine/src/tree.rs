//! Interface boundary to the step-tree parser and branchifier.
//!
//! The engine never parses test text itself. It consumes an already-built
//! tree through the [`Tree`] trait: branches come from `next_branch`, and
//! step text, modifiers, and code blocks are looked up in the
//! [`StepNodeIndex`]. Tests drive the engine with fake trees.

use std::fmt;
use std::rc::Rc;

use anyhow::Result;
use std::collections::HashMap;

use crate::branch::{Branch, StepDataMode};
use crate::error::StepError;
use crate::run_instance::StepContext;
use crate::step::{RunState, Step};
use crate::value::Val;

/// One variable assignment declared on a step (`{global} = 'x'` or
/// `{{local}} = 'x'`). `value` is the literal text, quotes included.
#[derive(Debug, Clone)]
pub struct VarBeingSet {
    pub name: String,
    pub value: String,
    pub is_local: bool,
}

/// Body of a code-block-bearing step: the literal source text (participates
/// in hashing and branch equality) plus the host closure that executes it.
///
/// The closure receives a capability-scoped [`StepContext`]; it signals
/// failure by returning a [`StepError`].
#[derive(Clone)]
pub struct CodeBlock {
    pub source: String,
    pub func: Rc<CodeBlockFn>,
}

pub type CodeBlockFn = dyn Fn(&mut StepContext<'_>) -> Result<Val, StepError>;

impl CodeBlock {
    pub fn new(
        source: impl Into<String>,
        func: impl Fn(&mut StepContext<'_>) -> Result<Val, StepError> + 'static,
    ) -> CodeBlock {
        CodeBlock {
            source: source.into(),
            func: Rc::new(func),
        }
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// A step-definition node: the parsed, shared description of a step.
#[derive(Debug, Clone, Default)]
pub struct StepNode {
    pub id: usize,
    pub text: String,
    pub filename: Option<String>,
    pub line_number: Option<u32>,
    pub is_function_call: bool,
    pub is_function_declaration: bool,
    /// Set for hook/package-provided nodes; their errors are attributed to
    /// the call site, not the package source.
    pub is_package: bool,

    pub is_skip: bool,
    pub is_skip_branch: bool,
    pub is_only: bool,
    /// `~` before the step: pause before running it.
    pub is_before_debug: bool,
    /// `~` after the step: pause after completing it.
    pub is_after_debug: bool,

    /// Group tags; frequency tokens (`low`/`med`/`high`) live here too.
    pub groups: Vec<String>,
    pub vars_being_set: Vec<VarBeingSet>,
    /// For function calls: the declaration's parameters paired with the
    /// call-site argument literals, in declaration order. Filled in by the
    /// branchifier.
    pub function_args: Vec<VarBeingSet>,
    pub code_block: Option<CodeBlock>,
}

impl StepNode {
    pub fn new(id: usize, text: impl Into<String>) -> StepNode {
        StepNode {
            id,
            text: text.into(),
            ..StepNode::default()
        }
    }

    pub fn is_debug(&self) -> bool {
        self.is_before_debug || self.is_after_debug
    }

    pub fn has_code_block(&self) -> bool {
        self.code_block.is_some()
    }

    /// Step text reduced to its behavioral tokens: whitespace runs collapse
    /// to one space and the standalone modifier tokens `~`, `~~`, `$`, `$s`
    /// are dropped. Used for branch equality and hashing.
    pub fn canonical_text(&self) -> String {
        self.text
            .split_whitespace()
            .filter(|token| !matches!(*token, "~" | "~~" | "$" | "$s"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Map from step-node id to node.
#[derive(Debug, Clone, Default)]
pub struct StepNodeIndex {
    nodes: HashMap<usize, StepNode>,
}

impl StepNodeIndex {
    pub fn new() -> StepNodeIndex {
        StepNodeIndex::default()
    }

    pub fn insert(&mut self, node: StepNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: usize) -> Option<&StepNode> {
        self.nodes.get(&id)
    }

    /// The code block a step executes: its own node's, or its function
    /// declaration's when the step is a call into a code-block function.
    pub fn effective_code_block(&self, step: &Step) -> Option<&CodeBlock> {
        if let Some(block) = self.get(step.id).and_then(|n| n.code_block.as_ref()) {
            return Some(block);
        }
        step.fid
            .and_then(|fid| self.get(fid))
            .and_then(|n| n.code_block.as_ref())
    }

    pub fn has_code_block(&self, step: &Step) -> bool {
        self.effective_code_block(step).is_some()
    }
}

/// The step tree, as seen by the execution engine.
///
/// `next_branch` hands over branches one at a time; `branchify_inject`
/// parses a standalone line against the live tree for the paused-mode
/// `inject` command. The remaining methods expose run-wide modes owned by
/// the tree.
pub trait Tree {
    fn next_branch(&mut self) -> Option<Branch>;

    fn step_node_index(&self) -> &StepNodeIndex;

    /// Expand one line of step syntax into a branch rooted at everything
    /// already run (`branch_above`), so injected code sees in-scope
    /// variables.
    fn branchify_inject(&mut self, text: &str, branch_above: &Branch) -> Result<Branch>;

    /// Whole-run debug mode (some branch carries a `~`).
    fn is_debug(&self) -> bool {
        false
    }

    /// Express debug (`~~`): debug modifiers don't pause.
    fn is_express_debug(&self) -> bool {
        false
    }

    fn step_data_mode(&self) -> StepDataMode {
        StepDataMode::All
    }

    fn step_node(&self, id: usize) -> Option<&StepNode> {
        self.step_node_index().get(id)
    }

    /// Index of the next not-yet-complete step of `branch`, or `None` when
    /// the branch has no step left to run. With `advance`, moves the
    /// `is_running` marker onto the returned step.
    fn next_step(&self, branch: &mut Branch, advance: bool) -> Option<usize> {
        if branch.is_complete() {
            return None;
        }
        let next = branch.steps.iter().position(|s| !s.is_complete());
        if advance {
            for step in &mut branch.steps {
                step.is_running = false;
            }
            if let Some(idx) = next {
                branch.steps[idx].is_running = true;
            }
        }
        next
    }

    /// Record a hook step's outcome. Hook steps live outside the branch's
    /// main step list, so completion never propagates to the branch here.
    fn mark_hook_step(&self, state: RunState, step: &mut Step, error: Option<StepError>) {
        step.mark(state);
        if let Some(error) = error {
            step.error = Some(error);
        }
    }
}
