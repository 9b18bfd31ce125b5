//! End-to-end runs through the public API: branches in, results out.

use std::time::Duration;

use engine::branch::StepDataMode;
use engine::compare;
use engine::config::RunConfig;
use engine::error::StepError;
use engine::run_instance::RunInstance;
use engine::runner::Runner;
use engine::step::Step;
use engine::test_support::{FakeTree, assign_node, branch_of, code_node};
use engine::value::Val;

fn instance(tree: FakeTree) -> RunInstance<FakeTree> {
    RunInstance::new(tree, Runner::new())
}

/// Three-step branch where the middle step throws: the failure is recorded
/// on that step, the branch fails, and the third step never runs.
#[test]
fn failing_step_ends_the_branch() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Open the page", "open", |ctx| {
        ctx.log("opened");
        Ok(Val::Null)
    }));
    let mut throws = code_node(2, "Click the button", "click", |_| {
        Err(StepError::new("element not found"))
    });
    throws.filename = Some("checkout.smash".to_string());
    throws.line_number = Some(18);
    tree.add_node(throws);
    tree.add_node(code_node(3, "Verify the cart", "verify", |_| {
        panic!("must not run after the branch failed")
    }));
    tree.add_branch(branch_of(&[1, 2, 3], &tree.index));

    let mut inst = instance(tree);
    inst.run().expect("run");

    assert_eq!(inst.completed().len(), 1);
    let branch = &inst.completed()[0];
    assert!(branch.is_failed);
    assert!(branch.steps[0].is_passed);
    assert_eq!(branch.steps[0].log, vec!["opened"]);
    assert!(branch.steps[1].is_failed);
    assert!(!branch.steps[2].is_complete());

    let error = branch.steps[1].error.as_ref().expect("captured error");
    assert_eq!(error.message, "element not found");
    assert_eq!(error.filename.as_deref(), Some("checkout.smash"));
    assert_eq!(error.line_number, Some(18));

    // later branches still run after a failed one
    assert!(!inst.is_stopped());
}

/// One failing branch does not poison the next: each branch starts with
/// fresh globals and its own result.
#[test]
fn branches_are_isolated() {
    let mut tree = FakeTree::new();
    tree.add_node(assign_node(1, "user", "'alice'", false));
    tree.add_node(code_node(2, "Fail", "fail", |_| Err(StepError::new("nope"))));
    tree.add_node(code_node(3, "Fresh scope", "fresh", |ctx| {
        if ctx.get_global("user") == Val::Undef {
            Ok(Val::Null)
        } else {
            Err(StepError::new("saw the previous branch's global"))
        }
    }));
    tree.add_branch(branch_of(&[1, 2], &tree.index));
    tree.add_branch(branch_of(&[3], &tree.index));

    let mut inst = instance(tree);
    inst.run().expect("run");
    let completed = inst.completed();
    assert_eq!(completed.len(), 2);
    assert!(completed[0].is_failed);
    assert!(completed[1].is_passed, "error: {:?}", completed[1].steps[0].error);
    assert!(completed.iter().all(|b| b.elapsed.unwrap_or(-1) >= 0));
}

/// A verification step built on the structural matcher: the comparison
/// failure surfaces as a step error carrying the rendered diff.
#[test]
fn comparison_failure_is_a_step_error() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Fetch the user", "fetch", |ctx| {
        let user = Val::map([("name", Val::from("bob")), ("age", Val::from(17.0))]);
        ctx.set_global("user", user);
        Ok(Val::Null)
    }));
    tree.add_node(code_node(2, "Verify the user", "verify", |ctx| {
        let expected = Val::map([
            ("name", Val::from("bob")),
            ("age", Val::map([("$min", Val::from(18.0))])),
        ]);
        compare::check(&ctx.get_global("user"), &expected).map_err(StepError::from)?;
        Ok(Val::Null)
    }));
    tree.add_branch(branch_of(&[1, 2], &tree.index));

    let mut inst = instance(tree);
    inst.run().expect("run");
    let branch = &inst.completed()[0];
    assert!(branch.is_failed);
    let message = &branch.steps[1].error.as_ref().expect("error").message;
    assert!(message.contains("$min"), "{message}");
}

/// StepDataMode::Fail keeps logs and errors only on failed branches.
#[test]
fn fail_mode_compacts_passed_branches() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Chatty pass", "pass", |ctx| {
        ctx.log("noise");
        Ok(Val::Null)
    }));
    tree.add_node(code_node(2, "Chatty fail", "fail", |ctx| {
        ctx.log("evidence");
        Err(StepError::new("broken"))
    }));
    tree.add_branch(branch_of(&[1], &tree.index));
    tree.add_branch(branch_of(&[2], &tree.index));
    tree.data_mode = StepDataMode::Fail;

    let mut inst = instance(tree);
    inst.run().expect("run");
    let completed = inst.completed();
    assert!(completed[0].is_passed);
    assert!(completed[0].steps[0].log.is_empty());
    assert!(completed[0].steps[0].elapsed.is_none());
    assert!(completed[1].is_failed);
    assert_eq!(completed[1].steps[0].log, vec!["evidence"]);
    assert!(completed[1].steps[0].error.is_some());
}

/// Hooks merged from an enclosing scope bracket the inner ones, and every
/// kind fires the expected number of times across a two-step branch.
#[test]
fn merged_hooks_bracket_and_fire_per_scope() {
    let mut tree = FakeTree::new();
    for (id, tag) in [(100, "outer<"), (101, "inner<"), (102, "inner>"), (103, "outer>")] {
        let marker = tag.to_string();
        tree.add_node(code_node(id, tag, "hook", move |ctx| {
            let so_far = ctx.get_persistent("order").to_text();
            ctx.set_persistent("order", Val::from(format!("{so_far}{marker} ")));
            Ok(Val::Null)
        }));
    }
    tree.add_node(code_node(1, "Step", "s", |_| Ok(Val::Null)));

    let mut inner = branch_of(&[1], &tree.index);
    inner.before_every_branch = vec![Step::new(101)];
    inner.after_every_branch = vec![Step::new(102)];
    let mut outer_scope = engine::branch::Branch::new();
    outer_scope.before_every_branch = vec![Step::new(100)];
    outer_scope.after_every_branch = vec![Step::new(103)];
    inner.merge_to_end(&outer_scope);
    tree.add_branch(inner);

    let mut inst = instance(tree);
    inst.runner().set_persistent("order", Val::from(""));
    inst.run().expect("run");
    assert!(inst.completed()[0].is_passed);
    assert_eq!(
        inst.runner().get_persistent("order"),
        Some(Val::from("outer< inner< inner> outer> "))
    );
}

/// Pause, poke at the world with `inject`, then resume to completion.
#[test]
fn paused_session_supports_injection_and_resume() {
    let mut tree = FakeTree::new();
    tree.add_node(assign_node(1, "token", "'abc123'", false));
    let mut breakpoint = code_node(2, "Submit the form", "submit", |ctx| {
        if ctx.get_global("token") == Val::from("abc123") {
            Ok(Val::Null)
        } else {
            Err(StepError::new("token was clobbered"))
        }
    });
    breakpoint.is_before_debug = true;
    tree.add_node(breakpoint);
    tree.add_node(code_node(50, "Show token", "show", |ctx| {
        let token = ctx.get_global("token").to_text();
        ctx.log(format!("token={token}"));
        Ok(Val::Null)
    }));
    tree.add_branch(branch_of(&[1, 2], &tree.index));
    tree.injectable.insert("Show token".to_string(), 50);

    let mut inst = instance(tree);
    inst.run().expect("run");
    assert!(inst.is_paused());

    let injected = inst.inject("Show token").expect("inject");
    assert_eq!(injected.steps[0].log, vec!["token=abc123"]);

    inst.run().expect("resume");
    assert!(!inst.is_paused());
    let branch = &inst.completed()[0];
    assert!(branch.is_passed, "error: {:?}", branch.steps[1].error);
    // paused branches report unmeasured elapsed time
    assert_eq!(branch.elapsed, Some(-1));
}

/// Timeouts are cooperative: a block that checks its budget inside a loop
/// fails with a timeout error instead of running forever.
#[test]
fn cooperative_timeout_interrupts_a_loop() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Poll forever", "poll", |ctx| {
        ctx.set_step_timeout(Duration::from_millis(10));
        loop {
            ctx.check_timeout()?;
            std::thread::sleep(Duration::from_millis(2));
        }
    }));
    tree.add_branch(branch_of(&[1], &tree.index));

    let mut inst = instance(tree);
    inst.run().expect("run");
    let branch = &inst.completed()[0];
    assert!(branch.is_failed);
    let message = &branch.steps[0].error.as_ref().expect("error").message;
    assert!(message.contains("timed out"), "{message}");
}

/// The configured step budget applies without any per-step override: a
/// block that never raises its timeout is cut off at the configured value.
#[test]
fn configured_step_budget_limits_a_block() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Poll forever", "poll", |ctx| loop {
        ctx.check_timeout()?;
        std::thread::sleep(Duration::from_millis(20));
    }));
    tree.add_branch(branch_of(&[1], &tree.index));

    let config = RunConfig {
        step_timeout_secs: 1,
        ..RunConfig::default()
    };
    let mut inst = RunInstance::new(tree, Runner::from_config(&config));
    inst.run().expect("run");
    let branch = &inst.completed()[0];
    assert!(branch.is_failed);
    let message = &branch.steps[0].error.as_ref().expect("error").message;
    assert!(message.contains("timed out after 1s"), "{message}");
}

/// Once a branch finishes, none of its steps still reads as running; the
/// report never shows a step as both passed and in flight.
#[test]
fn finished_steps_are_not_running() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Pass", "pass", |_| Ok(Val::Null)));
    tree.add_branch(branch_of(&[1], &tree.index));

    let mut inst = instance(tree);
    inst.run().expect("run");
    let branch = &inst.completed()[0];
    assert!(!branch.is_running);
    let step = &branch.steps[0];
    assert!(step.is_passed && !step.is_running);
    assert!(step.serialize().get("isRunning").is_none());
}

/// Serialized results use the report shape: camelCase keys, absent fields
/// omitted, `passedLastTime` folded into `isPassed`.
#[test]
fn serialized_report_shape() {
    let mut tree = FakeTree::new();
    tree.add_node(code_node(1, "Pass", "pass", |_| Ok(Val::Null)));
    let mut branch = branch_of(&[1], &tree.index);
    branch.update_hash(&tree.index);
    tree.add_branch(branch);

    let mut inst = instance(tree);
    inst.run().expect("run");
    let json = inst.completed()[0].serialize();
    assert_eq!(json["isPassed"], serde_json::json!(true));
    assert!(json.get("isFailed").is_none());
    assert!(json["hash"].is_string());
    assert!(json["elapsed"].is_number());
    assert_eq!(json["steps"][0]["id"], serde_json::json!(1));
}
