use serde_json::{json, Map, Value};

/// Wire envelope: `{id, ok, result}` on success, `{id, ok, error}` on
/// failure, one object per response line.
pub fn ok(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = Map::new();
    error.insert("code".into(), Value::String(code.to_string()));
    error.insert("message".into(), Value::String(message.into()));
    if let Some(d) = details {
        error.insert("details".into(), d);
    }
    json!({ "id": id, "ok": false, "error": error })
}
