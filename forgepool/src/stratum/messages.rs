//! Stratum line parsing and response construction.
//!
//! One JSON object per line in both directions. Requests are parsed
//! leniently (miners disagree on id types and params shapes); responses are
//! built as strings here so the session can batch several lines into one
//! write.

use serde_json::{json, Value};

use crate::job::validator::RejectCode;

/// A parsed client request. `id` is echoed back verbatim, whatever its
/// JSON type.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Vec<Value>,
}

/// Distinguishes unparseable bytes from parseable-but-wrong-shape JSON;
/// the two get different reject messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    BadJson,
    Malformed,
}

impl ParseError {
    pub fn message(self) -> &'static str {
        match self {
            ParseError::BadJson => "Bad JSON",
            ParseError::Malformed => "Malformed request",
        }
    }
}

pub fn parse_request(line: &str) -> Result<Request, ParseError> {
    let value: Value = serde_json::from_str(line).map_err(|_| ParseError::BadJson)?;
    let Value::Object(mut object) = value else {
        return Err(ParseError::Malformed);
    };
    let method = match object.get("method") {
        Some(Value::String(m)) if !m.is_empty() => m.clone(),
        _ => return Err(ParseError::Malformed),
    };
    let params = match object.remove("params") {
        Some(Value::Array(params)) => params,
        Some(Value::Null) | None => Vec::new(),
        // Single non-array param, seen from odd firmware.
        Some(other) => vec![other],
    };
    Ok(Request {
        id: object.remove("id"),
        method,
        params,
    })
}

fn id_value(id: &Option<Value>) -> Value {
    id.clone().unwrap_or(Value::Null)
}

pub fn result_line(id: &Option<Value>, result: Value) -> String {
    json!({ "id": id_value(id), "result": result, "error": null }).to_string()
}

pub fn error_line(id: &Option<Value>, code: i64, message: &str) -> String {
    json!({ "id": id_value(id), "result": null, "error": [code, message, null] }).to_string()
}

/// Reject response with the canonical error text for the code; the
/// detailed reason stays in the logs.
pub fn reject_line(id: &Option<Value>, code: RejectCode) -> String {
    let (number, message) = code.stratum_error();
    error_line(id, number, message)
}

/// Authorization failures carry `result: false` alongside the error, which
/// is what most firmware actually checks.
pub fn authorize_failure_line(id: &Option<Value>) -> String {
    let (number, message) = RejectCode::Unauthorized.stratum_error();
    json!({ "id": id_value(id), "result": false, "error": [number, message, null] }).to_string()
}

/// Difficulty notification. Whole numbers go out as JSON integers; some
/// firmware chokes on `16384.0`.
pub fn set_difficulty_line(difficulty: f64) -> String {
    let params = if difficulty.fract() == 0.0 && difficulty < 9.0e15 {
        json!([difficulty as u64])
    } else {
        json!([difficulty])
    };
    json!({ "id": null, "method": "mining.set_difficulty", "params": params }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_typical_submit() {
        let request = parse_request(
            r#"{"id": 4, "method": "mining.submit", "params": ["w.1", "1a", "0000000000000000", "6553f100", "12345678"]}"#,
        )
        .unwrap();
        assert_eq!(request.method, "mining.submit");
        assert_eq!(request.id, Some(json!(4)));
        assert_eq!(request.params.len(), 5);
    }

    #[test]
    fn string_and_missing_ids_survive() {
        let request = parse_request(r#"{"id": "abc", "method": "mining.subscribe"}"#).unwrap();
        assert_eq!(request.id, Some(json!("abc")));
        assert!(request.params.is_empty());

        let request = parse_request(r#"{"method": "mining.subscribe", "params": null}"#).unwrap();
        assert_eq!(request.id, None);
    }

    #[test_case("{not json" => ParseError::BadJson)]
    #[test_case("[1, 2, 3]" => ParseError::Malformed)]
    #[test_case(r#"{"id": 1, "params": []}"# => ParseError::Malformed)]
    #[test_case(r#"{"id": 1, "method": 7}"# => ParseError::Malformed)]
    #[test_case(r#"{"id": 1, "method": ""}"# => ParseError::Malformed)]
    fn rejects_garbage(line: &str) -> ParseError {
        parse_request(line).unwrap_err()
    }

    #[test]
    fn error_line_shape() {
        let line = error_line(&Some(json!(7)), 23, "Low difficulty share");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["result"], Value::Null);
        assert_eq!(value["error"], json!([23, "Low difficulty share", null]));
    }

    #[test]
    fn set_difficulty_prefers_integers() {
        assert_eq!(
            set_difficulty_line(16384.0),
            r#"{"id":null,"method":"mining.set_difficulty","params":[16384]}"#
        );
        let line = set_difficulty_line(0.5);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["params"], json!([0.5]));
    }
}
