//! Deep structural matcher between an actual value and an expected value
//! that may carry operator keys (`$typeof`, `$regex`, `$subset`, ...).
//!
//! The comparison never mutates its inputs: it builds a separate annotated
//! result tree ([`CompareNode`]) mirroring the actual value, with error
//! entries attached where the match failed. Traversal is cycle-safe; a
//! container revisited within the current recursion branch is treated as
//! matching rather than recursed into again.
//!
//! Malformed operator operands (e.g. a numeric `$typeof`) are programmer
//! errors and fail the whole comparison with `Err`, never a diagnostic.

use anyhow::{Result, anyhow, bail};
use regex::Regex;

use crate::value::{Val, fmt_num};

/// Reserved operator keys recognized inside expected objects, plus the two
/// array-level tokens (`$subset`, `$anyOrder`) recognized as literal string
/// elements of expected arrays.
pub const RESERVED_KEYS: &[&str] = &[
    "$typeof",
    "$regex",
    "$contains",
    "$max",
    "$min",
    "$code",
    "$length",
    "$maxLength",
    "$minLength",
    "$subset",
    "$anyOrder",
    "$exact",
    "$every",
];

/// One diagnostic attached to a comparison node.
#[derive(Clone, Debug)]
pub enum CompareError {
    /// Rendered inline after the value: `  -->  msg`.
    Inline(String),
    /// Rendered as an indented trailing section (used for missing keys and
    /// missing array items, where there is no actual value to annotate).
    Block {
        label: String,
        key: Option<String>,
        expected: Val,
    },
}

/// Annotated mirror of one actual sub-value.
#[derive(Clone, Debug)]
pub struct CompareNode {
    pub errors: Vec<CompareError>,
    pub value: Val,
    pub children: Children,
}

/// Compared children of a node. `None` means the value is rendered as-is
/// (scalars, unclaimed items, cycle cut-offs).
#[derive(Clone, Debug)]
pub enum Children {
    None,
    List(Vec<CompareNode>),
    Map(Vec<(String, CompareNode)>),
}

impl CompareNode {
    fn plain(value: &Val) -> CompareNode {
        CompareNode {
            errors: Vec::new(),
            value: value.clone(),
            children: Children::None,
        }
    }

    fn inline(value: &Val, msg: impl Into<String>) -> CompareNode {
        CompareNode {
            errors: vec![CompareError::Inline(msg.into())],
            value: value.clone(),
            children: Children::None,
        }
    }
}

/// Compare `actual` against `expected`, returning the annotated tree.
///
/// `subset_matching` forces every object below this point to be matched as
/// a subset (extra actual keys and array items are never flagged), the same
/// mode that a `'$subset'` token enables for one array level.
pub fn comparison(actual: &Val, expected: &Val, subset_matching: bool) -> Result<CompareNode> {
    compare_value(actual, expected, subset_matching, &mut Vec::new())
}

/// Throwing form: `Err` carries the rendered diff when the match fails.
pub fn check(actual: &Val, expected: &Val) -> Result<()> {
    let node = comparison(actual, expected, false)?;
    if has_errors(&node) {
        return Err(anyhow!("actual doesn't match expected:\n\n{}", print(&node)));
    }
    Ok(())
}

/// True if any node in the tree carries an error. Short-circuits on the
/// first one found.
pub fn has_errors(node: &CompareNode) -> bool {
    if !node.errors.is_empty() {
        return true;
    }
    match &node.children {
        Children::None => false,
        Children::List(kids) => kids.iter().any(has_errors),
        Children::Map(kids) => kids.iter().any(|(_, kid)| has_errors(kid)),
    }
}

fn compare_value(
    actual: &Val,
    expected: &Val,
    subset: bool,
    seen: &mut Vec<usize>,
) -> Result<CompareNode> {
    // Assume a revisited container matches; divergence would have been
    // caught before the cycle closed.
    if let Some(id) = actual.identity() {
        if seen.contains(&id) {
            return Ok(CompareNode::plain(actual));
        }
        seen.push(id);
    }
    let result = match expected {
        Val::Null => Ok(if matches!(actual, Val::Null) {
            CompareNode::plain(actual)
        } else {
            CompareNode::inline(actual, "not null")
        }),
        Val::Undef => Ok(if matches!(actual, Val::Undef) {
            CompareNode::plain(actual)
        } else {
            CompareNode::inline(actual, "not undefined")
        }),
        Val::List(items) => compare_list(actual, &items.borrow().clone(), subset, seen),
        Val::Map(entries) => compare_map(actual, &entries.borrow().clone(), subset, seen),
        Val::Func(f) => Ok(match actual {
            Val::Func(g) if std::rc::Rc::ptr_eq(f, g) => CompareNode::plain(actual),
            _ => CompareNode::inline(actual, "not the same function"),
        }),
        Val::Bool(_) | Val::Num(_) | Val::Str(_) => Ok(if scalar_eq(actual, expected) {
            CompareNode::plain(actual)
        } else {
            CompareNode::inline(actual, format!("not {}", scalar_repr(expected)))
        }),
    };
    if actual.identity().is_some() {
        seen.pop();
    }
    result
}

fn scalar_eq(actual: &Val, expected: &Val) -> bool {
    match (actual, expected) {
        (Val::Bool(a), Val::Bool(e)) => a == e,
        (Val::Num(a), Val::Num(e)) => a == e,
        (Val::Str(a), Val::Str(e)) => a == e,
        _ => false,
    }
}

fn scalar_repr(val: &Val) -> String {
    match val {
        Val::Str(s) => format!("{s:?}"),
        Val::Num(n) => fmt_num(*n),
        Val::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn compare_list(
    actual: &Val,
    expected_items: &[Val],
    subset: bool,
    seen: &mut Vec<usize>,
) -> Result<CompareNode> {
    let Val::List(actual_items) = actual else {
        return Ok(CompareNode::inline(actual, "not an array"));
    };
    let actual_items = actual_items.borrow().clone();

    // `$subset` / `$anyOrder` tokens apply to this array level only.
    let mut subset_mode = subset;
    let mut any_order = false;
    let mut items = Vec::new();
    for item in expected_items {
        match item.as_str() {
            Some("$subset") => subset_mode = true,
            Some("$anyOrder") => any_order = true,
            _ => items.push(item.clone()),
        }
    }

    let mut errors = Vec::new();
    let mut children = Vec::new();

    if subset_mode || any_order {
        // Claim-based matching: each expected item takes the first
        // not-yet-claimed actual item it matches (in subset mode).
        let mut claimed = vec![false; actual_items.len()];
        for item in &items {
            let mut found = false;
            for (j, candidate) in actual_items.iter().enumerate() {
                if claimed[j] {
                    continue;
                }
                let sub = compare_value(candidate, item, true, seen)?;
                if !has_errors(&sub) {
                    claimed[j] = true;
                    found = true;
                    break;
                }
            }
            if !found {
                errors.push(CompareError::Block {
                    label: "missing".to_string(),
                    key: None,
                    expected: item.clone(),
                });
            }
        }
        for (j, candidate) in actual_items.iter().enumerate() {
            // Plain any-order still flags leftovers; subset mode does not.
            if claimed[j] || subset_mode {
                children.push(CompareNode::plain(candidate));
            } else {
                children.push(CompareNode::inline(candidate, "not expected"));
            }
        }
    } else {
        for (i, item) in items.iter().enumerate() {
            match actual_items.get(i) {
                Some(candidate) => children.push(compare_value(candidate, item, subset, seen)?),
                None => errors.push(CompareError::Block {
                    label: "missing".to_string(),
                    key: None,
                    expected: item.clone(),
                }),
            }
        }
        for candidate in actual_items.iter().skip(items.len()) {
            if subset {
                children.push(CompareNode::plain(candidate));
            } else {
                children.push(CompareNode::inline(candidate, "not expected"));
            }
        }
    }

    Ok(CompareNode {
        errors,
        value: actual.clone(),
        children: Children::List(children),
    })
}

/// Operator rules applied to an expected object, in this fixed order.
/// `$every` and `$exact` need recursion over children and are handled at
/// their positions in `compare_map` rather than through this table.
#[derive(Clone, Copy)]
enum Op {
    Typeof,
    Regex,
    Contains,
    Max,
    Min,
    Code,
    Length,
    MaxLength,
    MinLength,
}

const OPS: &[(&str, Op)] = &[
    ("$typeof", Op::Typeof),
    ("$regex", Op::Regex),
    ("$contains", Op::Contains),
    ("$max", Op::Max),
    ("$min", Op::Min),
    ("$code", Op::Code),
    ("$length", Op::Length),
    ("$maxLength", Op::MaxLength),
    ("$minLength", Op::MinLength),
];

fn compare_map(
    actual: &Val,
    expected: &std::collections::BTreeMap<String, Val>,
    subset: bool,
    seen: &mut Vec<usize>,
) -> Result<CompareNode> {
    let mut errors = Vec::new();

    // All present operators contribute to the same node; no short-circuit.
    for (key, op) in OPS {
        if let Some(operand) = expected.get(*key) {
            apply_op(*op, key, operand, actual, &mut errors)?;
        }
    }

    let plain_keys: Vec<(&String, &Val)> = expected
        .iter()
        .filter(|(k, _)| !k.starts_with('$'))
        .collect();

    let mut children = Children::None;

    if !plain_keys.is_empty() || expected.contains_key("$exact") {
        let exact = expected
            .get("$exact")
            .map(Val::is_truthy)
            .unwrap_or(false);
        match actual {
            Val::Map(actual_entries) => {
                let actual_entries = actual_entries.borrow().clone();
                let mut kids: Vec<(String, CompareNode)> = Vec::new();
                for (key, candidate) in &actual_entries {
                    match expected.get(key).filter(|_| !key.starts_with('$')) {
                        Some(Val::Undef) => {
                            // Expected `undefined` is satisfied by an absent
                            // or undefined key.
                            if matches!(candidate, Val::Undef) {
                                kids.push((key.clone(), CompareNode::plain(candidate)));
                            } else {
                                kids.push((
                                    key.clone(),
                                    CompareNode::inline(candidate, "not undefined"),
                                ));
                            }
                        }
                        Some(item) => kids.push((
                            key.clone(),
                            compare_value(candidate, item, subset, seen)?,
                        )),
                        None => {
                            if exact && !expected.contains_key(key) {
                                kids.push((
                                    key.clone(),
                                    CompareNode::inline(
                                        candidate,
                                        "this key isn't in $exact object",
                                    ),
                                ));
                            } else {
                                kids.push((key.clone(), CompareNode::plain(candidate)));
                            }
                        }
                    }
                }
                for (key, item) in &plain_keys {
                    if !actual_entries.contains_key(*key) && !matches!(item, Val::Undef) {
                        errors.push(CompareError::Block {
                            label: "missing".to_string(),
                            key: Some((*key).clone()),
                            expected: (*item).clone(),
                        });
                    }
                }
                children = Children::Map(kids);
            }
            _ => errors.push(CompareError::Inline("not an object".to_string())),
        }
    } else if let Val::Map(actual_entries) = actual {
        // Operator-only expected object against a map: mirror the actual
        // entries so the diff still renders them.
        children = Children::Map(
            actual_entries
                .borrow()
                .iter()
                .map(|(k, v)| (k.clone(), CompareNode::plain(v)))
                .collect(),
        );
    }

    if let Some(item) = expected.get("$every") {
        match actual {
            Val::List(actual_items) if !actual_items.borrow().is_empty() => {
                let actual_items = actual_items.borrow().clone();
                let mut kids = Vec::new();
                for candidate in &actual_items {
                    kids.push(compare_value(candidate, item, subset, seen)?);
                }
                children = Children::List(kids);
            }
            _ => errors.push(CompareError::Inline(
                "not a non-empty array as needed for $every".to_string(),
            )),
        }
    }

    Ok(CompareNode {
        errors,
        value: actual.clone(),
        children,
    })
}

fn apply_op(
    op: Op,
    key: &str,
    operand: &Val,
    actual: &Val,
    errors: &mut Vec<CompareError>,
) -> Result<()> {
    match op {
        Op::Typeof => {
            let Some(name) = operand.as_str() else {
                bail!("{key} has to be a string: {operand}");
            };
            if actual.type_name() != name {
                errors.push(CompareError::Inline(format!("not $typeof {name}")));
            }
        }
        Op::Regex => {
            let Some(pattern) = operand.as_str() else {
                bail!("{key} has to be a string: {operand}");
            };
            let regex = Regex::new(pattern)
                .map_err(|err| anyhow!("{key} isn't a valid regex: {err}"))?;
            match actual.as_str() {
                Some(s) => {
                    if !regex.is_match(s) {
                        errors.push(CompareError::Inline(format!(
                            "doesn't match $regex /{pattern}/"
                        )));
                    }
                }
                None => errors.push(CompareError::Inline(format!(
                    "not a string so can't match $regex /{pattern}/"
                ))),
            }
        }
        Op::Contains => {
            let Some(needle) = operand.as_str() else {
                bail!("{key} has to be a string: {operand}");
            };
            match actual.as_str() {
                Some(s) => {
                    if !s.contains(needle) {
                        errors.push(CompareError::Inline(format!(
                            "doesn't $contains {needle:?}"
                        )));
                    }
                }
                None => errors.push(CompareError::Inline(format!(
                    "not a string so can't $contains {needle:?}"
                ))),
            }
        }
        Op::Max | Op::Min => {
            let Some(bound) = operand.as_num() else {
                bail!("{key} has to be a number: {operand}");
            };
            match actual.as_num() {
                Some(n) => match op {
                    Op::Max if n > bound => errors.push(CompareError::Inline(format!(
                        "is greater than $max {}",
                        fmt_num(bound)
                    ))),
                    Op::Min if n < bound => errors.push(CompareError::Inline(format!(
                        "is less than $min {}",
                        fmt_num(bound)
                    ))),
                    _ => {}
                },
                None => errors.push(CompareError::Inline(format!(
                    "not a number so can't be compared to {key} {}",
                    fmt_num(bound)
                ))),
            }
        }
        Op::Code => {
            let Val::Func(predicate) = operand else {
                bail!("{key} has to be a function: {operand}");
            };
            // Predicate errors propagate uncaught.
            if !predicate(actual)? {
                errors.push(CompareError::Inline("failed the $code check".to_string()));
            }
        }
        Op::Length | Op::MaxLength | Op::MinLength => {
            let bound = match operand.as_num() {
                Some(n) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                _ => bail!("{key} has to be a non-negative integer: {operand}"),
            };
            match actual.length() {
                Some(len) => match op {
                    Op::Length if len != bound => errors.push(CompareError::Inline(format!(
                        "doesn't have $length {bound}"
                    ))),
                    Op::MaxLength if len > bound => errors.push(CompareError::Inline(
                        format!("is longer than $maxLength {bound}"),
                    )),
                    Op::MinLength if len < bound => errors.push(CompareError::Inline(
                        format!("is shorter than $minLength {bound}"),
                    )),
                    _ => {}
                },
                None => errors.push(CompareError::Inline(format!(
                    "doesn't have a length so can't have {key} {bound}"
                ))),
            }
        }
    }
    Ok(())
}

const INDENT: &str = "    ";

/// Render the annotated tree as an indented, JSON-like diff.
pub fn print(node: &CompareNode) -> String {
    let mut out = render_node(node, 0, &mut Vec::new());
    out.truncate(out.trim_end().len());
    out
}

fn render_node(node: &CompareNode, depth: usize, seen: &mut Vec<usize>) -> String {
    let mut body = match &node.children {
        Children::None => render_raw(&node.value, depth, seen),
        Children::List(kids) => render_container(node, kids.len(), depth, seen, |i, d, s| {
            render_node(&kids[i], d, s)
        }),
        Children::Map(kids) => render_container(node, kids.len(), depth, seen, |i, d, s| {
            format!("{}: {}", fmt_key(&kids[i].0), render_node(&kids[i].1, d, s))
        }),
    };
    let inline: Vec<&str> = node
        .errors
        .iter()
        .filter_map(|e| match e {
            CompareError::Inline(msg) => Some(msg.as_str()),
            CompareError::Block { .. } => None,
        })
        .collect();
    if !inline.is_empty() {
        body.push_str("  -->  ");
        body.push_str(&inline.join(", "));
    }
    body
}

fn render_container(
    node: &CompareNode,
    count: usize,
    depth: usize,
    seen: &mut Vec<usize>,
    mut entry: impl FnMut(usize, usize, &mut Vec<usize>) -> String,
) -> String {
    let (open, close) = match node.children {
        Children::Map(_) => ('{', '}'),
        _ => ('[', ']'),
    };
    let blocks: Vec<&CompareError> = node
        .errors
        .iter()
        .filter(|e| matches!(e, CompareError::Block { .. }))
        .collect();
    if count == 0 && blocks.is_empty() {
        return format!("{open}{close}");
    }
    let pad = INDENT.repeat(depth + 1);
    let mut out = format!("{open}\n");
    for i in 0..count {
        out.push_str(&pad);
        out.push_str(&entry(i, depth + 1, seen));
        out.push_str(",\n");
    }
    for block in blocks {
        if let CompareError::Block {
            label,
            key,
            expected,
        } = block
        {
            out.push_str(&format!("{pad}-->  {label}\n"));
            if let Some(key) = key {
                out.push_str(&format!("{pad}{}\n", fmt_key(key)));
            }
            out.push_str(&pad);
            out.push_str(&render_raw(expected, depth + 1, seen));
            out.push('\n');
        }
    }
    out.push_str(&INDENT.repeat(depth));
    out.push(close);
    out
}

/// Pretty-print a raw value (no annotations) with cycle cut-offs.
fn render_raw(val: &Val, depth: usize, seen: &mut Vec<usize>) -> String {
    if let Some(id) = val.identity() {
        if seen.contains(&id) {
            return "[Circular]".to_string();
        }
        seen.push(id);
    }
    let out = match val {
        Val::Func(_) => "[Function]".to_string(),
        Val::Str(s) => format!("{s:?}"),
        Val::Num(n) => fmt_num(*n),
        Val::Bool(b) => b.to_string(),
        Val::Null => "null".to_string(),
        Val::Undef => "undefined".to_string(),
        Val::List(items) => {
            let items = items.borrow();
            if items.is_empty() {
                "[]".to_string()
            } else {
                let pad = INDENT.repeat(depth + 1);
                let body: Vec<String> = items
                    .iter()
                    .map(|v| format!("{pad}{},", render_raw(v, depth + 1, seen)))
                    .collect();
                format!("[\n{}\n{}]", body.join("\n"), INDENT.repeat(depth))
            }
        }
        Val::Map(entries) => {
            let entries = entries.borrow();
            if entries.is_empty() {
                "{}".to_string()
            } else {
                let pad = INDENT.repeat(depth + 1);
                let body: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| {
                        format!("{pad}{}: {},", fmt_key(k), render_raw(v, depth + 1, seen))
                    })
                    .collect();
                format!("{{\n{}\n{}}}", body.join("\n"), INDENT.repeat(depth))
            }
        }
    };
    if val.identity().is_some() {
        seen.pop();
    }
    out
}

/// Object keys print bare unless they contain characters outside
/// alphanumerics, `_`, and `$`.
fn fmt_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if bare {
        key.to_string()
    } else {
        format!("{key:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_clean(actual: &Val, expected: &Val) {
        let node = comparison(actual, expected, false).expect("comparison");
        assert!(!has_errors(&node), "unexpected errors:\n{}", print(&node));
    }

    fn assert_dirty(actual: &Val, expected: &Val) -> CompareNode {
        let node = comparison(actual, expected, false).expect("comparison");
        assert!(has_errors(&node), "expected errors, got clean match");
        node
    }

    /// Matching a value against a literal of its own shape succeeds and
    /// leaves the actual untouched.
    #[test]
    fn self_shaped_literal_matches_and_does_not_mutate() {
        let actual = Val::map([
            ("nums", Val::list(vec![Val::from(1), Val::from(2)])),
            ("name", Val::from("x")),
        ]);
        let snapshot = Val::from(actual.to_json());
        let expected = Val::from(actual.to_json());
        check(&actual, &expected).expect("match");
        assert_eq!(actual, snapshot);
    }

    #[test]
    fn exact_flags_extra_keys_individually() {
        let actual = Val::map([("a", Val::from(1))]);
        let expected = Val::map([("$exact", Val::from(true))]);
        let node = assert_dirty(&actual, &expected);
        let Children::Map(kids) = &node.children else {
            panic!("expected map children");
        };
        assert_eq!(kids.len(), 1);
        let msgs: Vec<_> = kids[0].1.errors.iter().collect();
        assert_eq!(msgs.len(), 1);
        match msgs[0] {
            CompareError::Inline(msg) => {
                assert_eq!(msg, "this key isn't in $exact object");
            }
            CompareError::Block { .. } => panic!("expected inline error"),
        }
    }

    #[test]
    fn positional_array_flags_extra_item() {
        let actual = Val::list(vec![Val::from(1), Val::from(2), Val::from(3)]);
        let expected = Val::list(vec![Val::from(1), Val::from(2)]);
        let node = assert_dirty(&actual, &expected);
        assert!(print(&node).contains("not expected"));
    }

    #[test]
    fn subset_array_allows_extra_items() {
        let actual = Val::list(vec![Val::from(1), Val::from(2), Val::from(3)]);
        let expected = Val::list(vec![Val::from("$subset"), Val::from(1), Val::from(2)]);
        assert_clean(&actual, &expected);
    }

    #[test]
    fn any_order_matches_out_of_order_items() {
        let actual = Val::list(vec![Val::from(3), Val::from(1), Val::from(2)]);
        let expected = Val::list(vec![
            Val::from("$anyOrder"),
            Val::from(1),
            Val::from(2),
            Val::from(3),
        ]);
        assert_clean(&actual, &expected);
    }

    #[test]
    fn any_order_reports_missing_item_as_block_error() {
        let actual = Val::list(vec![Val::from(1), Val::from(2)]);
        let expected = Val::list(vec![
            Val::from("$anyOrder"),
            Val::from(1),
            Val::from(2),
            Val::from(3),
        ]);
        let node = assert_dirty(&actual, &expected);
        let blocks: Vec<_> = node
            .errors
            .iter()
            .filter(|e| matches!(e, CompareError::Block { .. }))
            .collect();
        assert_eq!(blocks.len(), 1);
        match blocks[0] {
            CompareError::Block { label, expected, .. } => {
                assert_eq!(label, "missing");
                assert_eq!(*expected, Val::from(3));
            }
            CompareError::Inline(_) => unreachable!(),
        }
    }

    #[test]
    fn any_order_flags_leftover_actual_items() {
        let actual = Val::list(vec![Val::from(1), Val::from(2)]);
        let expected = Val::list(vec![Val::from("$anyOrder"), Val::from(1)]);
        let node = assert_dirty(&actual, &expected);
        assert!(print(&node).contains("not expected"));
    }

    /// Cyclic actual/expected graphs terminate and report no errors when
    /// the expected is the same cyclic shape.
    #[test]
    fn circular_graphs_terminate() {
        use std::cell::RefCell;
        use std::collections::BTreeMap;
        use std::rc::Rc;

        let a = Rc::new(RefCell::new(BTreeMap::new()));
        let b = Rc::new(RefCell::new(BTreeMap::new()));
        a.borrow_mut().insert("b".to_string(), Val::Map(b.clone()));
        b.borrow_mut().insert("a".to_string(), Val::Map(a.clone()));
        let actual = Val::Map(a);

        let node = comparison(&actual, &actual, false).expect("comparison");
        assert!(!has_errors(&node));
    }

    #[test]
    fn missing_key_is_a_block_error_with_expected_subtree() {
        let actual = Val::map([("a", Val::from(1))]);
        let expected = Val::map([
            ("a", Val::from(1)),
            ("b", Val::map([("deep", Val::from(2))])),
        ]);
        let node = assert_dirty(&actual, &expected);
        let rendered = print(&node);
        assert!(rendered.contains("-->  missing"));
        assert!(rendered.contains("b\n"));
        assert!(rendered.contains("deep: 2"));
    }

    #[test]
    fn expected_undefined_key_is_satisfied_by_absence() {
        let actual = Val::map([("a", Val::from(1))]);
        let expected = Val::map([("a", Val::from(1)), ("b", Val::Undef)]);
        assert_clean(&actual, &expected);

        let present = Val::map([("a", Val::from(1)), ("b", Val::from(2))]);
        let node = assert_dirty(&present, &expected);
        assert!(print(&node).contains("not undefined"));
    }

    #[test]
    fn operator_checks_accumulate_on_one_node() {
        let actual = Val::from("zebra");
        let expected = Val::map([
            ("$typeof", Val::from("number")),
            ("$contains", Val::from("lion")),
        ]);
        let node = assert_dirty(&actual, &expected);
        assert_eq!(node.errors.len(), 2);
    }

    #[test]
    fn typeof_recognizes_arrays() {
        let actual = Val::list(vec![Val::from(1)]);
        let expected = Val::map([("$typeof", Val::from("array"))]);
        assert_clean(&actual, &expected);
    }

    #[test]
    fn regex_and_contains_match_strings() {
        let actual = Val::from("smash all the tests");
        assert_clean(
            &actual,
            &Val::map([("$regex", Val::from("^smash.*tests$"))]),
        );
        assert_clean(&actual, &Val::map([("$contains", Val::from("all"))]));
        assert_dirty(&actual, &Val::map([("$regex", Val::from("^nope"))]));
    }

    #[test]
    fn numeric_bounds_apply_to_numbers_only() {
        assert_clean(&Val::from(5.0), &Val::map([("$max", Val::from(5.0))]));
        assert_dirty(&Val::from(6.0), &Val::map([("$max", Val::from(5.0))]));
        assert_dirty(&Val::from(1.0), &Val::map([("$min", Val::from(2.0))]));
        let node = assert_dirty(&Val::from("nan"), &Val::map([("$min", Val::from(2.0))]));
        assert!(print(&node).contains("not a number"));
    }

    #[test]
    fn code_predicate_runs_against_actual() {
        let even = Val::func(|v| Ok(v.as_num().is_some_and(|n| n % 2.0 == 0.0)));
        assert_clean(&Val::from(4.0), &Val::map([("$code", even.clone())]));
        assert_dirty(&Val::from(3.0), &Val::map([("$code", even)]));
    }

    #[test]
    fn code_predicate_errors_propagate() {
        let boom = Val::func(|_| anyhow::bail!("boom"));
        let err = comparison(&Val::from(1.0), &Val::map([("$code", boom)]), false)
            .expect_err("predicate error should propagate");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn length_family_checks_strings_and_arrays() {
        assert_clean(&Val::from("abc"), &Val::map([("$length", Val::from(3))]));
        assert_dirty(&Val::from("abc"), &Val::map([("$maxLength", Val::from(2))]));
        assert_dirty(&Val::from("abc"), &Val::map([("$minLength", Val::from(4))]));
        let node = assert_dirty(&Val::from(5.0), &Val::map([("$length", Val::from(1))]));
        assert!(print(&node).contains("doesn't have a length"));
    }

    #[test]
    fn every_applies_to_each_element() {
        let actual = Val::list(vec![Val::from(2), Val::from(4)]);
        let expected = Val::map([("$every", Val::map([("$typeof", Val::from("number"))]))]);
        assert_clean(&actual, &expected);

        let mixed = Val::list(vec![Val::from(2), Val::from("x")]);
        assert_dirty(&mixed, &expected);
        assert_dirty(&Val::list(vec![]), &expected);
    }

    #[test]
    fn malformed_operands_are_programmer_errors() {
        for expected in [
            Val::map([("$typeof", Val::from(1))]),
            Val::map([("$regex", Val::from(1))]),
            Val::map([("$contains", Val::from(1))]),
            Val::map([("$max", Val::from("x"))]),
            Val::map([("$code", Val::from("not a function"))]),
            Val::map([("$length", Val::from(-1))]),
            Val::map([("$regex", Val::from("(unclosed"))]),
        ] {
            comparison(&Val::from("x"), &expected, false).expect_err("should be rejected");
        }
    }

    /// `['$subset', {...}]` means objects nested anywhere below may carry
    /// extra keys without being flagged.
    #[test]
    fn subset_matching_propagates_into_nested_arrays() {
        let actual = Val::map([(
            "rows",
            Val::list(vec![Val::list(vec![Val::from(1), Val::from(2)])]),
        )]);
        let expected = Val::map([(
            "rows",
            Val::list(vec![
                Val::from("$subset"),
                Val::list(vec![Val::from(1)]),
            ]),
        )]);
        assert_clean(&actual, &expected);
    }

    #[test]
    fn check_error_carries_rendered_diff() {
        let actual = Val::map([("one", Val::from(1)), ("two", Val::from("two"))]);
        let expected = Val::map([("one", Val::from(1)), ("two", Val::from("three"))]);
        let err = check(&actual, &expected).expect_err("mismatch");
        let msg = err.to_string();
        assert!(msg.contains("two: \"two\"  -->  not \"three\""));
    }

    #[test]
    fn print_quotes_non_identifier_keys_and_renders_functions() {
        let actual = Val::map([
            ("plain$key_1", Val::from(1)),
            ("spaced key", Val::func(|_| Ok(true))),
        ]);
        let node = comparison(&actual, &Val::map(Vec::<(String, Val)>::new()), false)
            .expect("comparison");
        let rendered = print(&node);
        assert!(rendered.contains("plain$key_1: 1"));
        assert!(rendered.contains("\"spaced key\": [Function]"));
    }
}
