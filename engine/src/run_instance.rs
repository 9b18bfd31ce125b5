//! Sequential execution of branches: one instance runs branches from its
//! tree one at a time, owns the variable scopes, and captures step errors.
//!
//! The instance is a state machine over `current_branch`: `run` executes
//! until the tree has no branch left, a debug modifier or failure pauses
//! execution, or `stop` is called. While paused, the single-step and
//! `inject` operations drive the same per-step protocol as `run`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::branch::Branch;
use crate::error::StepError;
use crate::runner::{Runner, canonical_var_name};
use crate::step::{RunState, Step};
use crate::tree::{StepNode, Tree};
use crate::value::Val;

/// Variable references may chain at most this deep before resolution gives
/// up and reports a reference cycle.
const MAX_RESOLVE_DEPTH: u32 = 100;

/// Executes branches sequentially against a [`Tree`].
#[derive(Debug)]
pub struct RunInstance<T: Tree> {
    tree: T,
    runner: Runner,
    vars: VarScopes,

    /// The branch being executed, present while mid-branch (paused or
    /// between steps).
    current_branch: Option<Branch>,
    /// Every step executed this session, in order. Injection roots its
    /// parse here so injected steps see in-scope variables.
    steps_ran: Branch,
    completed: Vec<Branch>,

    is_paused: bool,
    is_stopped: bool,
    /// Set once the current branch pauses; its elapsed time is then
    /// reported as `-1` (unmeasured).
    branch_ever_paused: bool,

    step_timeout: Duration,
    resolve_depth: u32,
}

impl<T: Tree> RunInstance<T> {
    pub fn new(tree: T, runner: Runner) -> RunInstance<T> {
        let vars = VarScopes::new(&runner);
        let step_timeout = runner.step_timeout;
        RunInstance {
            tree,
            runner,
            vars,
            current_branch: None,
            steps_ran: Branch::new(),
            completed: Vec::new(),
            is_paused: false,
            is_stopped: false,
            branch_ever_paused: false,
            step_timeout,
            resolve_depth: 0,
        }
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut Runner {
        &mut self.runner
    }

    /// Branches finished so far, in completion order.
    pub fn completed(&self) -> &[Branch] {
        &self.completed
    }

    pub fn current_branch(&self) -> Option<&Branch> {
        self.current_branch.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    /// Per-step wall-clock budget, taken from the runner's configuration
    /// (60s by default).
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn set_step_timeout(&mut self, timeout: Duration) {
        self.step_timeout = timeout;
    }

    /// Current value of a global variable, for inspection while paused.
    pub fn global(&self, name: &str) -> Option<Val> {
        self.vars.get_global(name)
    }

    /// Current value of a local variable in the innermost scope.
    pub fn local(&self, name: &str) -> Option<Val> {
        self.vars.get_local(name)
    }

    /// Pause or unpause; the flag is mirrored onto the runner so sibling
    /// instances and the orchestrator can observe it.
    pub fn set_pause(&mut self, paused: bool) {
        self.is_paused = paused;
        self.runner.is_paused = paused;
    }

    /// Permanently halt this instance. Transient `is_running` markers are
    /// cleared; already-recorded results stay as they are.
    pub fn stop(&mut self) {
        self.is_stopped = true;
        self.runner.is_stopped = true;
        if let Some(branch) = &mut self.current_branch {
            branch.is_running = false;
            for step in &mut branch.steps {
                step.is_running = false;
            }
        }
    }

    /// Execute branches until the tree runs out, something pauses the
    /// instance, or `stop` is called. Resumes the paused branch if there is
    /// one, forcing through the debug modifier that paused it.
    ///
    /// Only fatal errors propagate; ordinary step failures are captured on
    /// their step and branch.
    pub fn run(&mut self) -> Result<()> {
        let resuming = self.current_branch.is_some() && self.is_paused;
        self.set_pause(false);
        let mut override_debug = resuming;
        let mut mid_branch = self.current_branch.is_some();

        loop {
            if self.is_stopped {
                break;
            }
            let mut branch = match self.current_branch.take() {
                Some(branch) => branch,
                None => match self.tree.next_branch() {
                    Some(branch) => branch,
                    None => break,
                },
            };
            let fresh = !std::mem::take(&mut mid_branch);

            if fresh {
                self.branch_ever_paused = false;
                self.vars.reset(&self.runner.global_init);
                if branch.passed_last_time {
                    self.completed.push(branch);
                    continue;
                }
                branch.is_running = true;
                branch.time_started = Some(SystemTime::now());
                // A before-hook failure fails the branch outright; the
                // steps never run but the after-hooks still do.
                match self.run_branch_hooks(&mut branch, true) {
                    Ok(true) => {
                        let mode = self.tree.step_data_mode();
                        branch.mark_branch(RunState::Fail, None, mode);
                    }
                    Ok(false) => {}
                    Err(fatal) => {
                        self.current_branch = Some(branch);
                        return Err(fatal);
                    }
                }
            }

            while !branch.is_complete() {
                let Some(idx) = self.tree.next_step(&mut branch, true) else {
                    break;
                };
                let result = self.run_step(&mut branch, idx, override_debug);
                override_debug = false;
                if let Err(fatal) = result {
                    self.current_branch = Some(branch);
                    return Err(fatal);
                }
                if self.is_stopped {
                    self.current_branch = Some(branch);
                    return Ok(());
                }
                if self.is_paused {
                    self.branch_ever_paused = true;
                    self.current_branch = Some(branch);
                    return Ok(());
                }
            }

            self.finish_branch(branch)?;
        }
        Ok(())
    }

    /// While paused: run the next step of the current branch, then re-pause.
    /// Returns true when the branch has no step left after this one.
    pub fn run_one_step(&mut self) -> Result<bool> {
        let mut branch = self.take_current_branch()?;
        let mut complete = true;
        if let Some(idx) = self.tree.next_step(&mut branch, true) {
            let result = self.run_step(&mut branch, idx, true);
            if let Err(fatal) = result {
                self.restore_paused(branch);
                return Err(fatal);
            }
            complete = branch.is_complete() || self.tree.next_step(&mut branch, false).is_none();
        }
        self.restore_paused(branch);
        Ok(complete)
    }

    /// While paused: mark the next step skipped without running it, then
    /// re-pause. Returns true when the branch has no step left afterwards.
    pub fn skip_one_step(&mut self) -> Result<bool> {
        let mut branch = self.take_current_branch()?;
        let mut complete = true;
        if let Some(idx) = self.tree.next_step(&mut branch, false) {
            let mode = self.tree.step_data_mode();
            branch.mark_step(RunState::Skip, idx, None, false, mode);
            complete = branch.is_complete() || self.tree.next_step(&mut branch, false).is_none();
        }
        self.restore_paused(branch);
        Ok(complete)
    }

    /// While paused: re-run the step that ran last (its result is reset
    /// first), then re-pause.
    pub fn run_last_step(&mut self) -> Result<()> {
        let mut branch = self.take_current_branch()?;
        let pos = self
            .tree
            .next_step(&mut branch, false)
            .unwrap_or(branch.steps.len());
        if pos > 0 {
            let idx = pos - 1;
            branch.steps[idx].reset_result();
            let result = self.run_step(&mut branch, idx, true);
            if let Err(fatal) = result {
                self.restore_paused(branch);
                return Err(fatal);
            }
        }
        self.restore_paused(branch);
        Ok(())
    }

    /// While paused: parse one line of step syntax against the live tree
    /// and execute it immediately in the current scopes. Returns the
    /// executed branch so the caller can inspect logs and errors.
    pub fn inject(&mut self, text: &str) -> Result<Branch> {
        if !self.is_paused {
            return Err(anyhow!("can only inject a step while paused"));
        }
        let mut injected = self.tree.branchify_inject(text, &self.steps_ran)?;
        for idx in 0..injected.steps.len() {
            let result = self.run_step(&mut injected, idx, true);
            if let Err(fatal) = result {
                self.set_pause(true);
                return Err(fatal);
            }
            if injected.steps[idx].is_failed {
                break;
            }
        }
        self.set_pause(true);
        Ok(injected)
    }

    fn take_current_branch(&mut self) -> Result<Branch> {
        self.current_branch
            .take()
            .ok_or_else(|| anyhow!("no branch is currently in progress"))
    }

    fn restore_paused(&mut self, branch: Branch) {
        self.set_pause(true);
        self.branch_ever_paused = true;
        self.current_branch = Some(branch);
    }

    /// After-hooks, final result derivation, and timing for a finished
    /// branch.
    fn finish_branch(&mut self, mut branch: Branch) -> Result<()> {
        let mode = self.tree.step_data_mode();
        match self.run_branch_hooks(&mut branch, false) {
            Ok(failed) => {
                if failed && !branch.is_failed {
                    branch.mark_branch(RunState::Fail, None, mode);
                }
            }
            Err(fatal) => {
                self.completed.push(branch);
                return Err(fatal);
            }
        }
        if !branch.is_complete() {
            branch.finish_off_branch(mode);
        }
        branch.is_running = false;
        branch.time_ended = Some(SystemTime::now());
        branch.elapsed = if self.branch_ever_paused {
            Some(-1)
        } else {
            branch
                .time_started
                .and_then(|t| t.elapsed().ok())
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        };
        self.completed.push(branch);
        Ok(())
    }

    /// Run all of one kind of branch hook. Every hook runs even if an
    /// earlier one failed; the first error is attached to the branch.
    /// Returns whether any hook failed.
    fn run_branch_hooks(&mut self, branch: &mut Branch, before: bool) -> Result<bool> {
        let source = if before {
            &mut branch.before_every_branch
        } else {
            &mut branch.after_every_branch
        };
        let mut hooks = std::mem::take(source);
        let mut first_error = None;
        let mut failed = false;
        for hook in &mut hooks {
            if self.is_stopped {
                break;
            }
            match self.run_hook(hook) {
                Ok(None) => {}
                Ok(Some(error)) => {
                    failed = true;
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(fatal) => {
                    self.put_back_hooks(branch, before, hooks);
                    return Err(fatal);
                }
            }
        }
        self.put_back_hooks(branch, before, hooks);
        if failed && branch.error.is_none() {
            branch.error = first_error;
        }
        Ok(failed)
    }

    fn put_back_hooks(&self, branch: &mut Branch, before: bool, hooks: Vec<Step>) {
        if before {
            branch.before_every_branch = hooks;
        } else {
            branch.after_every_branch = hooks;
        }
    }

    /// Execute one hook step. The hook step itself is marked passed or
    /// failed; a captured error is returned for the caller to attach to its
    /// sink (the branch, or the step the hook wraps). Fatal errors
    /// propagate.
    fn run_hook(&mut self, hook: &mut Step) -> Result<Option<StepError>> {
        let Some(node) = self.tree.step_node(hook.id).cloned() else {
            let error = StepError::new(format!("hook step node {} not found", hook.id));
            self.tree
                .mark_hook_step(RunState::Fail, hook, Some(error.clone()));
            return Ok(Some(error));
        };
        let Some(block) = node.code_block.clone() else {
            self.tree.mark_hook_step(RunState::Pass, hook, None);
            return Ok(None);
        };
        let mut coords = None;
        match self.eval_code_block(&block, &node, &mut hook.log, &mut coords) {
            Ok(_) => {
                self.tree.mark_hook_step(RunState::Pass, hook, None);
                if coords.is_some() {
                    hook.target_coords = coords;
                }
                Ok(None)
            }
            Err(mut error) => {
                if error.fatal {
                    return Err(anyhow::Error::new(error));
                }
                // Hook errors point at the hook's own source, call site
                // semantics do not apply.
                error.locate(node.filename.as_deref(), node.line_number);
                self.output_error(&error, &node);
                self.tree
                    .mark_hook_step(RunState::Fail, hook, Some(error.clone()));
                Ok(Some(error))
            }
        }
    }

    /// Execute one step of `branch`: debug gates, before-hooks, the body
    /// (variable work and code block), result marking, after-hooks, and
    /// the pause policy. Only fatal errors propagate.
    fn run_step(&mut self, branch: &mut Branch, idx: usize, override_debug: bool) -> Result<()> {
        if branch.steps[idx].is_skipped {
            return Ok(());
        }
        let step_id = branch.steps[idx].id;
        let Some(node) = self.tree.step_node(step_id).cloned() else {
            return Err(anyhow!("step node {step_id} not found"));
        };

        if node.is_before_debug && !override_debug && !self.tree.is_express_debug() {
            self.set_pause(true);
            return Ok(());
        }
        let mode = self.tree.step_data_mode();
        if node.is_skip {
            branch.mark_step(RunState::Skip, idx, None, false, mode);
            return Ok(());
        }

        branch.steps[idx].reset_result();
        branch.steps[idx].time_started = Some(SystemTime::now());
        let started = Instant::now();

        // Before-hooks: all of them run; a failure charges this step and
        // suppresses the body.
        let mut error = None;
        let mut hooks = std::mem::take(&mut branch.before_every_step);
        for hook in &mut hooks {
            if self.is_stopped {
                break;
            }
            match self.run_hook(hook) {
                Ok(None) => {}
                Ok(Some(hook_error)) => {
                    if error.is_none() {
                        error = Some(hook_error);
                    }
                }
                Err(fatal) => {
                    branch.before_every_step = hooks;
                    return Err(fatal);
                }
            }
        }
        branch.before_every_step = hooks;

        if error.is_none()
            && !self.is_stopped
            && let Err(body_error) = self.run_step_body(branch, idx, &node)
        {
            if body_error.fatal {
                return Err(anyhow::Error::new(body_error));
            }
            error = Some(body_error);
        }

        branch.steps[idx].elapsed =
            Some(i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX));
        branch.steps[idx].time_ended = Some(SystemTime::now());

        match &mut error {
            Some(error) => {
                error.locate(node.filename.as_deref(), node.line_number);
                self.output_error(error, &node);
                let finish_now = !error.continues && !self.runner.pause_on_fail;
                branch.mark_step(RunState::Fail, idx, Some(error.clone()), finish_now, mode);
            }
            None => {
                if !self.is_stopped {
                    branch.mark_step(RunState::Pass, idx, None, false, mode);
                }
            }
        }

        // After-hooks run regardless of the body's outcome.
        let mut hooks = std::mem::take(&mut branch.after_every_step);
        for hook in &mut hooks {
            if self.is_stopped {
                break;
            }
            match self.run_hook(hook) {
                Ok(None) => {}
                Ok(Some(hook_error)) => {
                    if !branch.steps[idx].is_failed {
                        let finish_now = !hook_error.continues && !self.runner.pause_on_fail;
                        branch.mark_step(RunState::Fail, idx, Some(hook_error), finish_now, mode);
                    } else if branch.steps[idx].error.is_none() {
                        branch.steps[idx].error = Some(hook_error);
                    }
                }
                Err(fatal) => {
                    branch.after_every_step = hooks;
                    return Err(fatal);
                }
            }
        }
        branch.after_every_step = hooks;

        self.steps_ran.steps.push(branch.steps[idx].clone());

        if branch.steps[idx].is_failed && self.runner.pause_on_fail {
            self.set_pause(true);
        }
        if node.is_after_debug && !override_debug && !self.tree.is_express_debug() {
            self.set_pause(true);
        }
        Ok(())
    }

    /// The step body: scope transitions, variable binding, and the code
    /// block. Errors come back for `run_step` to record.
    fn run_step_body(
        &mut self,
        branch: &mut Branch,
        idx: usize,
        node: &StepNode,
    ) -> Result<(), StepError> {
        let step = branch.steps[idx].clone();

        // The number of pushed scopes always equals the current step's
        // nesting level; leaving a function (or its code block) unwinds the
        // difference.
        while self.vars.depth() > step.level as usize {
            self.vars.pop_local_stack();
        }

        let block = self
            .tree
            .step_node_index()
            .effective_code_block(&step)
            .cloned();

        if node.is_function_call {
            // Arguments resolve in the caller's scope, then the call gets a
            // fresh scope seeded with them.
            let mut bindings = Vec::with_capacity(node.function_args.len());
            for arg in &node.function_args {
                let value = self.resolve_literal(branch, idx, &arg.value)?;
                branch.steps[idx].append_log(format!(
                    "Setting {} to {value}",
                    display_var(&arg.name, arg.is_local)
                ));
                bindings.push((arg.name.clone(), arg.is_local, value));
            }
            self.vars.push_local_stack();
            for (name, is_local, value) in bindings {
                if is_local {
                    self.vars.set_local(&name, value);
                } else {
                    self.vars.set_global(&name, value);
                }
            }
        } else if block.is_none() {
            for vb in &node.vars_being_set {
                let value = self.resolve_literal(branch, idx, &vb.value)?;
                branch.steps[idx].append_log(format!(
                    "Setting {} to {value}",
                    display_var(&vb.name, vb.is_local)
                ));
                if vb.is_local {
                    self.vars.set_local(&vb.name, value);
                } else {
                    self.vars.set_global(&vb.name, value);
                }
            }
        }

        if let Some(block) = block {
            let step_ref = &mut branch.steps[idx];
            let result =
                self.eval_code_block(&block, node, &mut step_ref.log, &mut step_ref.target_coords);
            match result {
                Ok(value) => {
                    // A function call's scope pop is pending; its outputs
                    // belong to the caller's scope.
                    let into_parent = node.is_function_call;
                    for vb in &node.vars_being_set {
                        step_ref.log.push(format!(
                            "Setting {} to {value}",
                            display_var(&vb.name, vb.is_local)
                        ));
                        if !vb.is_local {
                            self.vars.set_global(&vb.name, value.clone());
                        } else if into_parent {
                            self.vars.set_local_in_parent(&vb.name, value.clone());
                        } else {
                            self.vars.set_local(&vb.name, value.clone());
                        }
                    }
                    if into_parent {
                        self.vars.set_local_in_parent("prev", value);
                    } else {
                        self.vars.set_local("prev", value);
                    }
                }
                Err(mut error) => {
                    // A failure inside a called function points at the
                    // declaration, unless the function came from a package.
                    let declaration = step.fid.and_then(|fid| self.tree.step_node(fid));
                    match declaration {
                        Some(decl) if node.code_block.is_none() && !decl.is_package => {
                            error.locate(decl.filename.as_deref(), decl.line_number);
                        }
                        _ => error.locate(node.filename.as_deref(), node.line_number),
                    }
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Run a code block with a capability-scoped context and enforce the
    /// step timeout (cooperatively during the block, and once after it).
    fn eval_code_block(
        &mut self,
        block: &crate::tree::CodeBlock,
        node: &StepNode,
        log: &mut Vec<String>,
        target_coords: &mut Option<(f64, f64)>,
    ) -> Result<Val, StepError> {
        let started = Instant::now();
        let mut timeout = self.step_timeout;
        let console_output = self.runner.console_output;
        let prev = self.vars.get_local("prev").unwrap_or(Val::Undef);
        let mut ctx = StepContext {
            vars: &mut self.vars,
            node,
            log,
            target_coords,
            timeout: &mut timeout,
            started,
            prev,
            console_output,
        };
        let value = (block.func)(&mut ctx)?;
        if started.elapsed() > timeout {
            return Err(timeout_error(timeout));
        }
        Ok(value)
    }

    /// A literal from step text: a bare `{var}` reference adopts the
    /// referenced value as-is; anything else is a string with quotes
    /// stripped, embedded references substituted, and escapes applied.
    fn resolve_literal(
        &mut self,
        branch: &Branch,
        idx: usize,
        literal: &str,
    ) -> Result<Val, StepError> {
        let trimmed = literal.trim();
        if let Some(reference) = parse_var_ref(trimmed) {
            return self.find_var_value(branch, idx, &reference);
        }
        let unquoted = strip_quotes(trimmed);
        let replaced = self.replace_vars(branch, idx, unquoted)?;
        Ok(Val::from(unescape(&replaced)))
    }

    /// Substitute every `{var}` / `{{var}}` reference inside `text`.
    fn replace_vars(&mut self, branch: &Branch, idx: usize, text: &str) -> Result<String, StepError> {
        static VAR_REF: OnceLock<Regex> = OnceLock::new();
        let re = VAR_REF.get_or_init(|| {
            Regex::new(r"\{\{[^{}]*\}\}|\{[^{}]*\}").expect("variable reference regex")
        });
        let ranges: Vec<(usize, usize)> = re.find_iter(text).map(|m| (m.start(), m.end())).collect();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (start, end) in ranges {
            out.push_str(&text[last..start]);
            let token = &text[start..end];
            match parse_var_ref(token) {
                Some(reference) => {
                    let value = self.find_var_value(branch, idx, &reference)?;
                    out.push_str(&value.to_text());
                }
                None => out.push_str(token),
            }
            last = end;
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// Resolve one variable reference: the current scope first, then (for
    /// lookahead references) a forward scan of the branch for the step
    /// that will set it, evaluated on the spot.
    fn find_var_value(
        &mut self,
        branch: &Branch,
        idx: usize,
        reference: &VarRef,
    ) -> Result<Val, StepError> {
        self.resolve_depth += 1;
        let result = if self.resolve_depth > MAX_RESOLVE_DEPTH {
            Err(StepError::new(
                "infinite loop detected amongst variable references",
            ))
        } else {
            self.find_var_value_inner(branch, idx, reference)
        };
        self.resolve_depth -= 1;
        result
    }

    fn find_var_value_inner(
        &mut self,
        branch: &Branch,
        idx: usize,
        reference: &VarRef,
    ) -> Result<Val, StepError> {
        let current = if reference.is_local {
            self.vars.get_local(&reference.name)
        } else {
            self.vars.get_global(&reference.name)
        };
        if let Some(value) = current {
            return Ok(value);
        }

        let shown = display_var(&reference.name, reference.is_local);
        if !reference.lookahead {
            let hint = display_var(&format!("{}:", reference.name), reference.is_local);
            return Err(StepError::new(format!(
                "The variable {shown} wasn't set, but is needed for this step. If it's set later in the branch, try using {hint}."
            )));
        }

        // Local lookups may not escape the current function's scope.
        let cur_level = branch.steps.get(idx).map_or(0, |s| s.level);
        let mut found = None;
        for j in idx..branch.steps.len() {
            let step = &branch.steps[j];
            if reference.is_local && step.level < cur_level {
                break;
            }
            let Some(node) = self.tree.step_node(step.id) else {
                continue;
            };
            let hit = node.vars_being_set.iter().find(|vb| {
                vb.is_local == reference.is_local
                    && canonical_var_name(&vb.name) == canonical_var_name(&reference.name)
            });
            if let Some(vb) = hit {
                found = Some((j, vb.clone()));
                break;
            }
        }
        let Some((j, vb)) = found else {
            return Err(StepError::new(format!(
                "The variable {shown} is never set, but is needed for this step"
            )));
        };

        let step_j = branch.steps[j].clone();
        let block = self
            .tree
            .step_node_index()
            .effective_code_block(&step_j)
            .cloned();
        match block {
            Some(block) => {
                let node_j = self
                    .tree
                    .step_node(step_j.id)
                    .cloned()
                    .unwrap_or_default();
                let mut scratch_log = Vec::new();
                let mut coords = None;
                self.eval_code_block(&block, &node_j, &mut scratch_log, &mut coords)
            }
            None => self.resolve_literal(branch, j, &vb.value),
        }
    }

    fn output_error(&self, error: &StepError, node: &StepNode) {
        if self.runner.output_errors {
            tracing::error!(step = %node.text, "{}", self.runner.format_stack_trace(error));
        }
    }
}

fn timeout_error(timeout: Duration) -> StepError {
    StepError::new(format!("step timed out after {}s", timeout.as_secs()))
}

fn display_var(name: &str, is_local: bool) -> String {
    if is_local {
        format!("{{{{{name}}}}}")
    } else {
        format!("{{{name}}}")
    }
}

#[derive(Debug, Clone)]
struct VarRef {
    name: String,
    is_local: bool,
    lookahead: bool,
}

/// `{name}`, `{{name}}`, `{name:}`, `{{name:}}`. Anything else is not a
/// reference.
fn parse_var_ref(token: &str) -> Option<VarRef> {
    let (inner, is_local) = if let Some(inner) = token
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        (inner, true)
    } else if let Some(inner) = token.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) {
        (inner, false)
    } else {
        return None;
    };
    if inner.contains('{') || inner.contains('}') {
        return None;
    }
    let inner = inner.trim();
    let (name, lookahead) = match inner.strip_suffix(':') {
        Some(name) => (name.trim_end(), true),
        None => (inner, false),
    };
    if name.is_empty() {
        return None;
    }
    Some(VarRef {
        name: name.to_string(),
        is_local,
        lookahead,
    })
}

fn strip_quotes(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'\'' || first == b'"') {
            return &text[1..text.len() - 1];
        }
    }
    text
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// The engine's variable storage: one global map per branch, a current
/// local scope with a stack of suspended outer scopes, and the run-wide
/// persistent map shared through the runner.
///
/// All names are case-insensitive.
#[derive(Debug)]
pub(crate) struct VarScopes {
    global: HashMap<String, Val>,
    local: HashMap<String, Val>,
    local_stack: Vec<HashMap<String, Val>>,
    runner_persistent: std::rc::Rc<std::cell::RefCell<HashMap<String, Val>>>,
}

impl VarScopes {
    fn new(runner: &Runner) -> VarScopes {
        VarScopes {
            global: HashMap::new(),
            local: HashMap::new(),
            local_stack: Vec::new(),
            runner_persistent: runner.persistent.clone(),
        }
    }

    /// Fresh scopes for a new branch; persistent storage is untouched.
    fn reset(&mut self, global_init: &HashMap<String, Val>) {
        self.global = global_init
            .iter()
            .map(|(name, value)| (canonical_var_name(name), value.clone()))
            .collect();
        self.local.clear();
        self.local_stack.clear();
    }

    fn depth(&self) -> usize {
        self.local_stack.len()
    }

    /// Suspend the current local scope and start a fresh one. Inner scopes
    /// do not see outer locals.
    fn push_local_stack(&mut self) {
        let outer = std::mem::take(&mut self.local);
        self.local_stack.push(outer);
    }

    fn pop_local_stack(&mut self) {
        if let Some(outer) = self.local_stack.pop() {
            self.local = outer;
        } else {
            self.local.clear();
        }
    }

    fn get_global(&self, name: &str) -> Option<Val> {
        self.global.get(&canonical_var_name(name)).cloned()
    }

    fn set_global(&mut self, name: &str, value: Val) {
        self.global.insert(canonical_var_name(name), value);
    }

    fn get_local(&self, name: &str) -> Option<Val> {
        self.local.get(&canonical_var_name(name)).cloned()
    }

    fn set_local(&mut self, name: &str, value: Val) {
        self.local.insert(canonical_var_name(name), value);
    }

    /// Write into the scope that will become current once the pending pop
    /// happens (a function call's outputs belong to its caller).
    fn set_local_in_parent(&mut self, name: &str, value: Val) {
        match self.local_stack.last_mut() {
            Some(parent) => {
                parent.insert(canonical_var_name(name), value);
            }
            None => {
                self.local.insert(canonical_var_name(name), value);
            }
        }
    }

    fn get_persistent(&self, name: &str) -> Option<Val> {
        self.runner_persistent
            .borrow()
            .get(&canonical_var_name(name))
            .cloned()
    }

    fn set_persistent(&self, name: &str, value: Val) {
        self.runner_persistent
            .borrow_mut()
            .insert(canonical_var_name(name), value);
    }
}

/// The capability surface handed to a code block while it runs. Everything
/// a block may touch goes through here; it has no access to the engine or
/// the tree.
pub struct StepContext<'a> {
    vars: &'a mut VarScopes,
    node: &'a StepNode,
    log: &'a mut Vec<String>,
    target_coords: &'a mut Option<(f64, f64)>,
    timeout: &'a mut Duration,
    started: Instant,
    prev: Val,
    console_output: bool,
}

impl StepContext<'_> {
    /// Missing variables read as undefined, never as an error.
    pub fn get_global(&self, name: &str) -> Val {
        self.vars.get_global(name).unwrap_or(Val::Undef)
    }

    pub fn set_global(&mut self, name: &str, value: Val) {
        self.vars.set_global(name, value);
    }

    pub fn get_local(&self, name: &str) -> Val {
        self.vars.get_local(name).unwrap_or(Val::Undef)
    }

    pub fn set_local(&mut self, name: &str, value: Val) {
        self.vars.set_local(name, value);
    }

    pub fn get_persistent(&self, name: &str) -> Val {
        self.vars.get_persistent(name).unwrap_or(Val::Undef)
    }

    pub fn set_persistent(&mut self, name: &str, value: Val) {
        self.vars.set_persistent(name, value);
    }

    /// Get-or-initialize a persistent value: `init` runs only when the
    /// name is unset, so expensive shared resources are built once per run.
    pub fn persist_once(
        &mut self,
        name: &str,
        init: impl FnOnce() -> Result<Val, StepError>,
    ) -> Result<Val, StepError> {
        if let Some(value) = self.vars.get_persistent(name) {
            return Ok(value);
        }
        let value = init()?;
        self.vars.set_persistent(name, value.clone());
        Ok(value)
    }

    /// The previous code block's return value (undefined at scope start).
    pub fn prev(&self) -> &Val {
        &self.prev
    }

    /// The step-definition node being executed.
    pub fn step_node(&self) -> &StepNode {
        self.node
    }

    /// Directory of the source file this step was defined in, for code
    /// blocks that load fixtures relative to their own file. `None` when
    /// the node has no filename or the file sits at the path root.
    pub fn current_dir(&self) -> Option<&Path> {
        self.node
            .filename
            .as_deref()
            .and_then(|f| Path::new(f).parent())
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Append to the running step's log.
    pub fn log(&mut self, text: impl Into<String>) {
        self.log.push(text.into());
    }

    /// Console output from test code; suppressed when the run disables it.
    pub fn console(&self, text: &str) {
        if self.console_output {
            tracing::info!(step = %self.node.text, "{text}");
        }
    }

    /// UI-highlight hint recorded on the step.
    pub fn set_target_coords(&mut self, x: f64, y: f64) {
        *self.target_coords = Some((x, y));
    }

    /// Raise this step's wall-clock budget (the default is 60s).
    pub fn set_step_timeout(&mut self, timeout: Duration) {
        *self.timeout = timeout;
    }

    /// Cooperative timeout check for long-running blocks; call it inside
    /// loops to fail fast instead of at block exit.
    pub fn check_timeout(&self) -> Result<(), StepError> {
        if self.started.elapsed() > *self.timeout {
            return Err(timeout_error(*self.timeout));
        }
        Ok(())
    }
}
