//! Embedded Lua evaluator shared by every connection.
//!
//! The engine owns a single Lua state for the whole process. The reactor
//! is single-threaded, so the state is never entered concurrently, but
//! globals set by one connection's script are visible to the next.
//! That non-isolation is deliberate; this is introspection tooling.
//!
//! A script's result is classified once into one of three shapes before
//! any wire encoding happens: a scalar, a flat table (keys map to
//! scalars), or a nested table (keys map to sub-tables).

use mlua::{Lua, Value};

/// A table key as the evaluator saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptKey {
    /// A genuine string key (numbers are not coerced here).
    Str(String),
    /// A numeric key, truncated to an integer.
    Int(i64),
    /// Any other key type; callers render a placeholder.
    Opaque,
}

/// Cell text as Lua would render it; `None` where Lua has no string form
/// (booleans, nil, tables without a metamethod).
pub type CellText = Option<String>;

/// Classified result of a script evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// A single scalar value.
    Scalar(CellText),
    /// One level of keys mapping to scalars, in native iteration order.
    Flat(Vec<(ScriptKey, CellText)>),
    /// Keys mapping to sub-tables: one entry per row, each row's pairs in
    /// that sub-table's own iteration order.
    Nested(Vec<Vec<(ScriptKey, CellText)>>),
}

/// Process-wide scripting context.
pub struct ScriptEngine {
    lua: Lua,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    /// Create a fresh Lua state with the standard libraries.
    pub fn new() -> Self {
        Self { lua: Lua::new() }
    }

    /// Evaluate `source` as a zero-argument chunk and classify its result.
    ///
    /// Errors carry the evaluator's message and are user-visible; they do
    /// not poison the shared state.
    pub fn eval(&self, source: &str) -> mlua::Result<ScriptValue> {
        let value = self.lua.load(source).eval::<Value>()?;
        classify(value)
    }
}

/// Classify a Lua value into the three-variant shape.
///
/// For tables, the first entry's value type decides between flat and
/// nested; entries not matching the chosen shape degrade (tables render
/// NULL in flat shape, scalars are skipped in nested shape).
fn classify(value: Value) -> mlua::Result<ScriptValue> {
    let table = match value {
        Value::Table(t) => t,
        other => return Ok(ScriptValue::Scalar(to_text(&other))),
    };

    let mut entries = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        entries.push(pair?);
    }

    let nested = matches!(entries.first(), Some((_, Value::Table(_))));
    if !nested {
        let row = entries
            .iter()
            .map(|(k, v)| (to_key(k), to_text(v)))
            .collect();
        return Ok(ScriptValue::Flat(row));
    }

    let mut rows = Vec::new();
    for (_, value) in entries {
        let sub = match value {
            Value::Table(sub) => sub,
            _ => continue,
        };
        let mut row = Vec::new();
        for pair in sub.pairs::<Value, Value>() {
            let (k, v) = pair?;
            row.push((to_key(&k), to_text(&v)));
        }
        rows.push(row);
    }
    Ok(ScriptValue::Nested(rows))
}

/// Convert a table key. String keys keep their text; numeric keys become
/// integers; anything else is opaque.
fn to_key(key: &Value) -> ScriptKey {
    match key {
        Value::String(s) => ScriptKey::Str(s.to_string_lossy().to_string()),
        Value::Integer(i) => ScriptKey::Int(*i),
        Value::Number(n) => ScriptKey::Int(*n as i64),
        _ => ScriptKey::Opaque,
    }
}

/// Render a value the way Lua's tostring-for-strings-and-numbers does.
/// Values with no automatic string form yield `None`.
fn to_text(value: &Value) -> CellText {
    match value {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(format_number(*n)),
        _ => None,
    }
}

/// Lua prints integral floats with a trailing `.0`.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_string() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return 'foo'").unwrap();
        assert_eq!(value, ScriptValue::Scalar(Some("foo".to_string())));
    }

    #[test]
    fn test_scalar_integer() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return 1 + 1").unwrap();
        assert_eq!(value, ScriptValue::Scalar(Some("2".to_string())));
    }

    #[test]
    fn test_scalar_float_keeps_decimal() {
        let engine = ScriptEngine::new();
        assert_eq!(
            engine.eval("return 1.5").unwrap(),
            ScriptValue::Scalar(Some("1.5".to_string()))
        );
        assert_eq!(
            engine.eval("return 2.0").unwrap(),
            ScriptValue::Scalar(Some("2.0".to_string()))
        );
    }

    #[test]
    fn test_scalar_boolean_has_no_text() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return true").unwrap();
        assert_eq!(value, ScriptValue::Scalar(None));
    }

    #[test]
    fn test_flat_table() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return { foo = 'bar' }").unwrap();
        match value {
            ScriptValue::Flat(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, ScriptKey::Str("foo".to_string()));
                assert_eq!(entries[0].1, Some("bar".to_string()));
            }
            other => panic!("expected flat, got {other:?}"),
        }
    }

    #[test]
    fn test_flat_table_numeric_keys() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return { 'a', 'b' }").unwrap();
        match value {
            ScriptValue::Flat(entries) => {
                assert_eq!(entries[0].0, ScriptKey::Int(1));
                assert_eq!(entries[1].0, ScriptKey::Int(2));
            }
            other => panic!("expected flat, got {other:?}"),
        }
    }

    #[test]
    fn test_flat_table_opaque_key() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return { [true] = 'x' }").unwrap();
        match value {
            ScriptValue::Flat(entries) => {
                assert_eq!(entries[0].0, ScriptKey::Opaque);
            }
            other => panic!("expected flat, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_table() {
        let engine = ScriptEngine::new();
        let value = engine
            .eval("return { { a = '1', b = '2' }, { x = '3', y = '4' } }")
            .unwrap();
        match value {
            ScriptValue::Nested(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].len(), 2);
                assert_eq!(rows[1].len(), 2);
            }
            other => panic!("expected nested, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_skips_scalar_entries() {
        let engine = ScriptEngine::new();
        let value = engine.eval("return { { a = '1' }, 'stray' }").unwrap();
        match value {
            ScriptValue::Nested(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected nested, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_table_is_flat() {
        let engine = ScriptEngine::new();
        assert_eq!(engine.eval("return {}").unwrap(), ScriptValue::Flat(vec![]));
    }

    #[test]
    fn test_eval_error_carries_message() {
        let engine = ScriptEngine::new();
        let err = engine.eval("not valid lua ((").unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_runtime_error() {
        let engine = ScriptEngine::new();
        let err = engine.eval("error('boom')").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_globals_persist_across_evals() {
        let engine = ScriptEngine::new();
        engine.eval("counter = 41").unwrap();
        let value = engine.eval("counter = counter + 1 return counter").unwrap();
        assert_eq!(value, ScriptValue::Scalar(Some("42".to_string())));
    }
}
