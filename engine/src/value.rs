//! Dynamically typed values flowing through branches and comparisons.
//!
//! Test data (variables, code-block return values, comparer inputs) has no
//! static shape, so the engine carries it as [`Val`]. Containers are
//! reference-shared (`Rc<RefCell<_>>`): two steps can hold the same list or
//! map, and cyclic graphs are representable. Identity is the `Rc` pointer.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Predicate attached to a `$code` comparer operator or held as a plain
/// function value. Errors propagate uncaught through a comparison.
pub type PredicateFn = dyn Fn(&Val) -> anyhow::Result<bool>;

/// A dynamically typed engine value.
///
/// `Undef` is distinct from `Null`: an object key whose expected value is
/// `Undef` is satisfied by an absent key, which `Null` is not.
#[derive(Clone)]
pub enum Val {
    Null,
    Undef,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Rc<RefCell<Vec<Val>>>),
    Map(Rc<RefCell<BTreeMap<String, Val>>>),
    Func(Rc<PredicateFn>),
}

impl Val {
    /// Build a list value from owned items.
    pub fn list(items: Vec<Val>) -> Val {
        Val::List(Rc::new(RefCell::new(items)))
    }

    /// Build a map value from key/value pairs.
    pub fn map<K, I>(pairs: I) -> Val
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Val)>,
    {
        Val::Map(Rc::new(RefCell::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    /// Wrap a predicate as a function value.
    pub fn func(f: impl Fn(&Val) -> anyhow::Result<bool> + 'static) -> Val {
        Val::Func(Rc::new(f))
    }

    /// Type name as reported by the `$typeof` comparer operator.
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Null => "null",
            Val::Undef => "undefined",
            Val::Bool(_) => "boolean",
            Val::Num(_) => "number",
            Val::Str(_) => "string",
            Val::List(_) => "array",
            Val::Map(_) => "object",
            Val::Func(_) => "function",
        }
    }

    /// Container identity (pointer) for cycle detection. `None` for scalars.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Val::List(rc) => Some(Rc::as_ptr(rc) as usize),
            Val::Map(rc) => Some(Rc::as_ptr(rc) as *const u8 as usize),
            _ => None,
        }
    }

    /// Length for `$length`-family operators: string chars, list items, or
    /// map entries. `None` if the value has no length.
    pub fn length(&self) -> Option<usize> {
        match self {
            Val::Str(s) => Some(s.chars().count()),
            Val::List(items) => Some(items.borrow().len()),
            Val::Map(entries) => Some(entries.borrow().len()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Val::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Val::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Plain-text form for substitution into step text and logs: strings
    /// come back unquoted, everything else renders as displayed.
    pub fn to_text(&self) -> String {
        match self {
            Val::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Truthiness for `$exact` and predicate-style operands.
    pub fn is_truthy(&self) -> bool {
        match self {
            Val::Null | Val::Undef => false,
            Val::Bool(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::List(_) | Val::Map(_) | Val::Func(_) => true,
        }
    }

    /// Convert to JSON for report output. Functions render as the string
    /// `"[Function]"`; revisited containers as `"[Circular]"`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_inner(&mut Vec::new())
    }

    fn to_json_inner(&self, seen: &mut Vec<usize>) -> serde_json::Value {
        if let Some(id) = self.identity() {
            if seen.contains(&id) {
                return serde_json::Value::String("[Circular]".to_string());
            }
            seen.push(id);
        }
        let out = match self {
            Val::Null | Val::Undef => serde_json::Value::Null,
            Val::Bool(b) => serde_json::Value::Bool(*b),
            Val::Num(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Val::Str(s) => serde_json::Value::String(s.clone()),
            Val::List(items) => serde_json::Value::Array(
                items.borrow().iter().map(|v| v.to_json_inner(seen)).collect(),
            ),
            Val::Map(entries) => serde_json::Value::Object(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(seen)))
                    .collect(),
            ),
            Val::Func(_) => serde_json::Value::String("[Function]".to_string()),
        };
        if self.identity().is_some() {
            seen.pop();
        }
        out
    }
}

impl From<serde_json::Value> for Val {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Val::Null,
            serde_json::Value::Bool(b) => Val::Bool(b),
            serde_json::Value::Number(n) => Val::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Val::Str(s),
            serde_json::Value::Array(items) => {
                Val::list(items.into_iter().map(Val::from).collect())
            }
            serde_json::Value::Object(entries) => {
                Val::map(entries.into_iter().map(|(k, v)| (k, Val::from(v))))
            }
        }
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Self {
        Val::Str(s.to_string())
    }
}

impl From<String> for Val {
    fn from(s: String) -> Self {
        Val::Str(s)
    }
}

impl From<f64> for Val {
    fn from(n: f64) -> Self {
        Val::Num(n)
    }
}

impl From<i64> for Val {
    fn from(n: i64) -> Self {
        Val::Num(n as f64)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::Bool(b)
    }
}

impl PartialEq for Val {
    /// Structural equality; functions compare by reference. Containers
    /// revisited within one comparison are treated as equal, so cyclic
    /// graphs terminate.
    fn eq(&self, other: &Val) -> bool {
        deep_eq(self, other, &mut Vec::new())
    }
}

fn deep_eq(a: &Val, b: &Val, seen: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Val::Null, Val::Null) | (Val::Undef, Val::Undef) => true,
        (Val::Bool(x), Val::Bool(y)) => x == y,
        (Val::Num(x), Val::Num(y)) => x == y,
        (Val::Str(x), Val::Str(y)) => x == y,
        (Val::Func(x), Val::Func(y)) => Rc::ptr_eq(x, y),
        (Val::List(x), Val::List(y)) => {
            let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if seen.contains(&pair) {
                return true;
            }
            seen.push(pair);
            let (x, y) = (x.borrow(), y.borrow());
            let eq = x.len() == y.len()
                && x.iter().zip(y.iter()).all(|(a, b)| deep_eq(a, b, seen));
            seen.pop();
            eq
        }
        (Val::Map(x), Val::Map(y)) => {
            let pair = (
                Rc::as_ptr(x) as *const u8 as usize,
                Rc::as_ptr(y) as *const u8 as usize,
            );
            if seen.contains(&pair) {
                return true;
            }
            seen.push(pair);
            let (x, y) = (x.borrow(), y.borrow());
            let eq = x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((ka, va), (kb, vb))| {
                    ka == kb && deep_eq(va, vb, seen)
                });
            seen.pop();
            eq
        }
        _ => false,
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render(self, &mut Vec::new()))
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One-line JSON-like rendering with `[Circular]` guards.
fn render(val: &Val, seen: &mut Vec<usize>) -> String {
    if let Some(id) = val.identity() {
        if seen.contains(&id) {
            return "[Circular]".to_string();
        }
        seen.push(id);
    }
    let out = match val {
        Val::Null => "null".to_string(),
        Val::Undef => "undefined".to_string(),
        Val::Bool(b) => b.to_string(),
        Val::Num(n) => fmt_num(*n),
        Val::Str(s) => format!("{s:?}"),
        Val::Func(_) => "[Function]".to_string(),
        Val::List(items) => {
            let body: Vec<String> = items.borrow().iter().map(|v| render(v, seen)).collect();
            format!("[{}]", body.join(", "))
        }
        Val::Map(entries) => {
            let body: Vec<String> = entries
                .borrow()
                .iter()
                .map(|(k, v)| format!("{}: {}", k, render(v, seen)))
                .collect();
            format!("{{{}}}", body.join(", "))
        }
    };
    if val.identity().is_some() {
        seen.pop();
    }
    out
}

/// Format a number without a trailing `.0` for integral values.
pub(crate) fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_cover_all_variants() {
        assert_eq!(Val::Null.type_name(), "null");
        assert_eq!(Val::Undef.type_name(), "undefined");
        assert_eq!(Val::from(true).type_name(), "boolean");
        assert_eq!(Val::from(1.5).type_name(), "number");
        assert_eq!(Val::from("x").type_name(), "string");
        assert_eq!(Val::list(vec![]).type_name(), "array");
        assert_eq!(Val::map(Vec::<(String, Val)>::new()).type_name(), "object");
        assert_eq!(Val::func(|_| Ok(true)).type_name(), "function");
    }

    #[test]
    fn structural_equality_ignores_sharing() {
        let a = Val::map([("k", Val::list(vec![Val::from(1)]))]);
        let b = Val::map([("k", Val::list(vec![Val::from(1)]))]);
        assert_eq!(a, b);
        assert_ne!(a, Val::map([("k", Val::list(vec![Val::from(2)]))]));
    }

    #[test]
    fn functions_compare_by_reference() {
        let f = Val::func(|_| Ok(true));
        assert_eq!(f, f.clone());
        assert_ne!(f, Val::func(|_| Ok(true)));
    }

    /// Cyclic graphs terminate under equality and rendering.
    #[test]
    fn cyclic_values_do_not_loop() {
        let a = Rc::new(RefCell::new(BTreeMap::new()));
        let b = Rc::new(RefCell::new(BTreeMap::new()));
        a.borrow_mut().insert("b".to_string(), Val::Map(b.clone()));
        b.borrow_mut().insert("a".to_string(), Val::Map(a.clone()));
        let val = Val::Map(a);

        assert_eq!(val, val.clone());
        assert!(val.to_string().contains("[Circular]"));
        assert_eq!(
            val.to_json()["b"]["a"],
            serde_json::Value::String("[Circular]".to_string())
        );
    }

    #[test]
    fn json_round_trip_for_plain_data() {
        let json: serde_json::Value = serde_json::json!({"a": [1, "two", null], "b": true});
        let val = Val::from(json.clone());
        assert_eq!(val.to_json(), json);
    }

    #[test]
    fn length_applies_to_strings_lists_and_maps() {
        assert_eq!(Val::from("abc").length(), Some(3));
        assert_eq!(Val::list(vec![Val::Null]).length(), Some(1));
        assert_eq!(Val::map([("k", Val::Null)]).length(), Some(1));
        assert_eq!(Val::from(3.0).length(), None);
    }
}
