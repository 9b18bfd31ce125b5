//! Test-only helpers for constructing step nodes, branches, and fake trees.

use std::collections::HashMap;

use anyhow::{Result, anyhow};

use crate::branch::{Branch, StepDataMode};
use crate::error::StepError;
use crate::run_instance::StepContext;
use crate::step::Step;
use crate::tree::{CodeBlock, StepNode, StepNodeIndex, Tree, VarBeingSet};
use crate::value::Val;

/// Create a plain step node with default fields.
pub fn node(id: usize, text: &str) -> StepNode {
    StepNode::new(id, text)
}

/// Create a step node carrying a code block.
pub fn code_node(
    id: usize,
    text: &str,
    source: &str,
    func: impl Fn(&mut StepContext<'_>) -> Result<Val, StepError> + 'static,
) -> StepNode {
    let mut node = node(id, text);
    node.code_block = Some(CodeBlock::new(source, func));
    node
}

/// Create a step node that assigns one variable from a literal.
pub fn assign_node(id: usize, name: &str, value: &str, is_local: bool) -> StepNode {
    let text = if is_local {
        format!("{{{{{name}}}}} = {value}")
    } else {
        format!("{{{name}}} = {value}")
    };
    let mut node = node(id, &text);
    node.vars_being_set = vec![VarBeingSet {
        name: name.to_string(),
        value: value.to_string(),
        is_local,
    }];
    node
}

/// Create a branch over steps referencing the given node ids, in order.
pub fn branch_of(ids: &[usize], index: &StepNodeIndex) -> Branch {
    let mut branch = Branch::new();
    for id in ids {
        branch.push(Step::new(*id), index);
    }
    branch
}

/// A [`Tree`] over a fixed node index and a queue of prebuilt branches.
///
/// `branchify_inject` only understands step text registered in
/// `injectable` (text to node id); everything else is an error, like an
/// unparseable line would be.
#[derive(Debug, Default)]
pub struct FakeTree {
    pub index: StepNodeIndex,
    pub branches: Vec<Branch>,
    pub injectable: HashMap<String, usize>,
    pub data_mode: StepDataMode,
    pub express_debug: bool,
}

impl FakeTree {
    pub fn new() -> FakeTree {
        FakeTree::default()
    }

    pub fn add_node(&mut self, node: StepNode) {
        self.index.insert(node);
    }

    pub fn add_branch(&mut self, branch: Branch) {
        self.branches.push(branch);
    }
}

impl Tree for FakeTree {
    fn next_branch(&mut self) -> Option<Branch> {
        if self.branches.is_empty() {
            None
        } else {
            Some(self.branches.remove(0))
        }
    }

    fn step_node_index(&self) -> &StepNodeIndex {
        &self.index
    }

    fn branchify_inject(&mut self, text: &str, _branch_above: &Branch) -> Result<Branch> {
        let id = self
            .injectable
            .get(text.trim())
            .copied()
            .ok_or_else(|| anyhow!("cannot parse injected step: {text}"))?;
        let mut branch = Branch::new();
        branch.push(Step::new(id), &self.index);
        Ok(branch)
    }

    fn is_express_debug(&self) -> bool {
        self.express_debug
    }

    fn step_data_mode(&self) -> StepDataMode {
        self.data_mode
    }
}
