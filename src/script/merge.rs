//! Combining per-node oracle results.
//!
//! Without a merge function, results are merged structurally: objects
//! key-wise (a key defined twice is a conflict), arrays by concatenation.
//! With one, the oracle source is evaluated in a pooled interpreter and the
//! merge function is called with the array of per-node results.

use super::descriptor::OracleDescriptor;
use super::pool::InterpreterPool;
use crate::error::{MergeError, ScriptError};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Globals every program runs with: a silent console and the `ctx` status
/// object scripts use to signal failure.
pub const PRELUDE: &str = r#"
var console = { log: function () {} };
var ctx = (function () {
    var failed = false, message = "";
    return {
        Error: function (msg) { failed = true; message = String(msg); return null; },
        IsError: function () { return failed; },
        Message: function () { return message; }
    };
})();
"#;

/// Wrap `call` so the program's completion value is a JSON report of how
/// the call went.
pub fn envelope(call: &str) -> String {
    format!(
        r#"
(function () {{
    var out = {{ failed: false, message: "", serializable: true, kind: "", value: null }};
    var value;
    try {{
        value = {call};
    }} catch (e) {{
        out.failed = true;
        out.kind = "exception";
        out.message = String(e);
        return JSON.stringify(out);
    }}
    if (ctx.IsError()) {{
        out.failed = true;
        out.kind = "signal";
        out.message = ctx.Message();
        return JSON.stringify(out);
    }}
    var kind = typeof value;
    if (kind === "function" || kind === "symbol" || kind === "bigint") {{
        out.serializable = false;
        out.kind = kind;
        return JSON.stringify(out);
    }}
    out.value = value === undefined ? null : value;
    try {{
        return JSON.stringify(out);
    }} catch (e) {{
        return JSON.stringify({{ failed: false, message: String(e), serializable: false, kind: "object", value: null }});
    }}
}})()
"#
    )
}

#[derive(Debug, Deserialize)]
struct Report {
    failed: bool,
    message: String,
    serializable: bool,
    kind: String,
    value: Value,
}

/// Decode the JSON report produced by an [`envelope`]d program.
pub fn read_report(raw: &str) -> Result<Value, ScriptError> {
    let report: Report =
        serde_json::from_str(raw).map_err(|e| ScriptError::Envelope(format!("{e}: {raw}")))?;
    if report.failed {
        return Err(if report.kind == "signal" {
            ScriptError::Signalled(report.message)
        } else {
            ScriptError::Runtime(report.message)
        });
    }
    if !report.serializable {
        return Err(ScriptError::NotSerializable(report.kind));
    }
    Ok(report.value)
}

/// Merge `results` with the oracle's merge function, or structurally when
/// it has none.
pub async fn merge_results(
    oracle: &OracleDescriptor,
    results: Vec<Value>,
    pool: &InterpreterPool,
) -> Result<Value, MergeError> {
    match oracle.merge_function() {
        Some(function) => custom_merge(oracle.source(), function, results, pool).await,
        None => default_merge(results),
    }
}

async fn custom_merge(
    source: &str,
    function: &str,
    results: Vec<Value>,
    pool: &InterpreterPool,
) -> Result<Value, MergeError> {
    let results = serde_json::to_string(&Value::Array(results))
        .map_err(|e| ScriptError::Envelope(e.to_string()))?;
    let program = format!(
        "{PRELUDE}\n{source}\nvar __results = {results};\n{}",
        envelope(&format!("{function}(__results)"))
    );
    let interpreter = pool.checkout().await?;
    let raw = interpreter.eval(program).await?;
    drop(interpreter);
    Ok(read_report(&raw)?)
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structural merge: every result must have the same shape.
pub fn default_merge(results: Vec<Value>) -> Result<Value, MergeError> {
    let mut prior: Option<&'static str> = None;
    let mut merged: Option<Value> = None;

    for result in results {
        let current = shape(&result);
        match prior {
            None => prior = Some(current),
            Some(prior) if prior != current => {
                return Err(MergeError::Heterogeneous { prior, current });
            }
            Some(_) => {}
        }

        match result {
            Value::Object(entries) => {
                let target = merged.get_or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(target) = target {
                    for (key, value) in entries {
                        if let Some(old) = target.get(&key) {
                            return Err(MergeError::KeyConflict {
                                key,
                                old: old.clone(),
                                new: value,
                            });
                        }
                        target.insert(key, value);
                    }
                }
            }
            Value::Array(items) => {
                let target = merged.get_or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(target) = target {
                    target.extend(items);
                }
            }
            other => return Err(MergeError::Unsupported(shape(&other))),
        }
    }

    Ok(merged.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_merge_key_wise() {
        let merged = default_merge(vec![json!({"1": "a"}), json!({"2": "b"})]).unwrap();
        assert_eq!(merged, json!({"1": "a", "2": "b"}));
    }

    #[test]
    fn duplicate_keys_conflict() {
        let err = default_merge(vec![json!({"1": "a"}), json!({"1": "b"})]).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"merge conflict: multiple results define key 1: oldValue='"a"', newValue='"b"'"#
        );
    }

    #[test]
    fn lists_concatenate_in_order() {
        let merged = default_merge(vec![json!([1, 2]), json!([3])]).unwrap();
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn scalars_need_a_merge_function() {
        let err = default_merge(vec![json!(1), json!(2)]).unwrap_err();
        assert!(matches!(err, MergeError::Unsupported("number")));
        assert!(err.to_string().contains("not supported for auto-merge"));
    }

    #[test]
    fn mixed_shapes_are_rejected() {
        let err = default_merge(vec![json!([1]), json!({"a": 1})]).unwrap_err();
        assert!(matches!(
            err,
            MergeError::Heterogeneous {
                prior: "array",
                current: "object"
            }
        ));
    }

    #[test]
    fn nothing_merges_to_null() {
        assert_eq!(default_merge(Vec::new()).unwrap(), Value::Null);
    }

    #[test]
    fn reports_map_to_script_errors() {
        assert_eq!(
            read_report(r#"{"failed":false,"message":"","serializable":true,"kind":"","value":[1]}"#).unwrap(),
            json!([1])
        );
        assert!(matches!(
            read_report(r#"{"failed":true,"message":"bad","serializable":true,"kind":"signal","value":null}"#),
            Err(ScriptError::Signalled(m)) if m == "bad"
        ));
        assert!(matches!(
            read_report(r#"{"failed":false,"message":"","serializable":false,"kind":"function","value":null}"#),
            Err(ScriptError::NotSerializable(k)) if k == "function"
        ));
        assert!(matches!(read_report("undefined"), Err(ScriptError::Envelope(_))));
    }

    #[tokio::test]
    async fn custom_merge_function_sums_results() {
        let oracle = OracleDescriptor::parse(
            "count",
            "function count() { return records.All().length; }\n\
             function mergeCounts(results) { var t = 0; results.forEach(function (r) { t += r; }); return t; }",
        )
        .unwrap();
        let pool = InterpreterPool::new(1).unwrap();
        let merged = merge_results(&oracle, vec![json!(2), json!(3)], &pool).await.unwrap();
        assert_eq!(merged, json!(5));
    }

    #[tokio::test]
    async fn merge_function_can_signal_failure() {
        let oracle = OracleDescriptor::parse(
            "f",
            "function f() { return 1; }\n\
             function mergeStrict(results) { return ctx.Error('disagreement'); }",
        )
        .unwrap();
        let pool = InterpreterPool::new(1).unwrap();
        let err = merge_results(&oracle, vec![json!(1)], &pool).await.unwrap_err();
        assert!(matches!(err, MergeError::Script(ScriptError::Signalled(m)) if m == "disagreement"));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn merge_function_must_return_data() {
        let oracle = OracleDescriptor::parse(
            "f",
            "function f() { return 1; }\nfunction mergeFn(results) { return function () {}; }",
        )
        .unwrap();
        let pool = InterpreterPool::new(1).unwrap();
        let err = merge_results(&oracle, vec![json!(1)], &pool).await.unwrap_err();
        assert!(matches!(err, MergeError::Script(ScriptError::NotSerializable(_))));
    }
}
