use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Codec, JsonCodec};
use crate::error::{Error, RemoteError, Result};

/// Outcome tag of a command result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultState {
    Success,
    Error,
}

/// Reply to a command: the handler's value or a flattened error
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(Value),
    Error(RemoteError),
}

#[derive(Serialize)]
struct WireResult<'a> {
    state: ResultState,
    data: &'a Value,
}

#[derive(Deserialize)]
struct RawResult {
    state: Option<Value>,
    #[serde(default)]
    data: Value,
}

impl CommandResult {
    pub fn success(data: Value) -> Self {
        Self::Success(data)
    }

    /// Failure result flattened from any error value
    pub fn failure(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::Error(RemoteError::from_error(error))
    }

    pub fn state(&self) -> ResultState {
        match self {
            Self::Success(_) => ResultState::Success,
            Self::Error(_) => ResultState::Error,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Success(data) => encode_result(ResultState::Success, data),
            Self::Error(error) => {
                let data =
                    serde_json::to_value(error).map_err(|e| Error::Codec(e.to_string()))?;
                encode_result(ResultState::Error, &data)
            }
        }
    }

    /// Success payload, or the reconstructed remote error
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Success(data) => Ok(data),
            Self::Error(error) => Err(Error::Remote(error)),
        }
    }
}

pub fn encode_result(state: ResultState, data: &Value) -> Result<Vec<u8>> {
    JsonCodec.encode(&WireResult { state, data })
}

pub fn decode_result(bytes: &[u8]) -> Result<CommandResult> {
    let raw: RawResult = JsonCodec
        .decode(bytes)
        .map_err(|e| Error::MalformedPayload(e.to_string()))?;

    let state = raw
        .state
        .and_then(|state| serde_json::from_value::<ResultState>(state).ok())
        .ok_or_else(|| {
            Error::MalformedPayload("Expect state field to be one of success, error".to_string())
        })?;

    Ok(match state {
        ResultState::Success => CommandResult::Success(raw.data),
        ResultState::Error => CommandResult::Error(remote_error_from(raw.data)),
    })
}

fn remote_error_from(data: Value) -> RemoteError {
    match data {
        Value::String(message) => RemoteError {
            stack: format!("Error: {message}"),
            message,
            ..RemoteError::default()
        },
        Value::Object(fields) => {
            let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
            let fallback = RemoteError::default();
            let message = text("message").unwrap_or(fallback.message);
            let name = text("name").unwrap_or(fallback.name);
            let stack = text("stack").unwrap_or_else(|| format!("{name}: {message}"));
            RemoteError {
                message,
                name,
                stack,
            }
        }
        _ => RemoteError::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_round_trip() {
        let result = CommandResult::success(json!({"message": "Hello, Alisa!"}));
        let decoded = decode_result(&result.encode().unwrap()).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn error_round_trip_reconstructs_description() {
        let result = CommandResult::failure(&Error::UnknownCommand("hello2".to_string()));
        let bytes = result.encode().unwrap();

        let wire: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(wire["state"], "error");
        assert_eq!(wire["data"]["message"], "Unknown command hello2");
        assert_eq!(wire["data"]["name"], "UnknownCommand");

        let err = decode_result(&bytes).unwrap().into_result().unwrap_err();
        match err {
            Error::Remote(remote) => {
                assert_eq!(remote.message, "Unknown command hello2");
                assert!(remote.stack.starts_with("UnknownCommand: "));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_or_unknown_state() {
        for payload in [
            r#"{"data": 1}"#,
            r#"{"state": "pending", "data": 1}"#,
            r#"{"state": 1}"#,
            "[]",
        ] {
            assert!(
                matches!(
                    decode_result(payload.as_bytes()),
                    Err(Error::MalformedPayload(_))
                ),
                "{payload}"
            );
        }
    }

    #[test]
    fn tolerates_sparse_error_data() {
        let decoded = decode_result(br#"{"state": "error", "data": "boom"}"#).unwrap();
        assert_eq!(
            decoded,
            CommandResult::Error(RemoteError {
                message: "boom".to_string(),
                name: "Error".to_string(),
                stack: "Error: boom".to_string(),
            })
        );

        let decoded = decode_result(br#"{"state": "error", "data": {"message": "m"}}"#).unwrap();
        assert!(matches!(decoded, CommandResult::Error(ref e) if e.message == "m" && e.name == "Error"));
    }

    #[test]
    fn mistyped_error_fields_keep_the_rest() {
        let decoded = decode_result(
            br#"{"state": "error", "data": {"message": "boom", "name": "Error", "stack": null}}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            CommandResult::Error(RemoteError {
                message: "boom".to_string(),
                name: "Error".to_string(),
                stack: "Error: boom".to_string(),
            })
        );

        let decoded = decode_result(
            br#"{"state": "error", "data": {"message": "boom", "name": 7, "stack": "at x"}}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            CommandResult::Error(RemoteError {
                message: "boom".to_string(),
                name: "Error".to_string(),
                stack: "at x".to_string(),
            })
        );
    }
}
