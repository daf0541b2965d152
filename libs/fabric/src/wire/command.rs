use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Codec, JsonCodec};
use crate::error::{Error, Result};

/// A named invocation with its positional arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "command")]
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Serialize)]
struct WireCommand<'a> {
    command: &'a str,
    args: &'a [Value],
}

#[derive(Deserialize)]
struct RawCommand {
    command: Option<Value>,
    args: Option<Value>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Deserialize the argument at `index`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.args.get(index).ok_or_else(|| {
            Error::MalformedPayload(format!(
                "command {} expects an argument at position {index}",
                self.name
            ))
        })?;
        T::deserialize(value).map_err(|e| {
            Error::MalformedPayload(format!(
                "command {} argument {index}: {e}",
                self.name
            ))
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_command(&self.name, &self.args)
    }
}

pub fn encode_command(name: &str, args: &[Value]) -> Result<Vec<u8>> {
    JsonCodec.encode(&WireCommand {
        command: name,
        args,
    })
}

pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let raw: RawCommand = JsonCodec
        .decode(bytes)
        .map_err(|e| Error::MalformedPayload(e.to_string()))?;

    let name = match raw.command {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => {
            return Err(Error::MalformedPayload(
                "Expect command field to be a non-empty string".to_string(),
            ))
        }
    };

    let args = match raw.args {
        Some(Value::Array(args)) => args,
        _ => {
            return Err(Error::MalformedPayload(
                "Expect args field to be an array".to_string(),
            ))
        }
    };

    Ok(Command { name, args })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_name_and_args() {
        let args = vec![json!("Alisa"), json!({"foo": "bar"}), json!([1, 2, 3])];
        let bytes = encode_command("hello", &args).unwrap();

        assert_eq!(decode_command(&bytes).unwrap(), Command::new("hello", args));
    }

    #[test]
    fn wire_layout_uses_command_and_args_keys() {
        let bytes = Command::new("ping", vec![]).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"command": "ping", "args": []}));
    }

    #[test]
    fn rejects_missing_or_empty_name() {
        for payload in [
            r#"{"args": []}"#,
            r#"{"command": "", "args": []}"#,
            r#"{"command": 7, "args": []}"#,
        ] {
            let err = decode_command(payload.as_bytes()).unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)), "{payload}");
        }
    }

    #[test]
    fn rejects_missing_args_and_garbage() {
        assert!(matches!(
            decode_command(br#"{"command": "hello"}"#),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(
            decode_command(br#"{"command": "hello", "args": {"a": 1}}"#),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(
            decode_command(b"\xff\xfe"),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn typed_argument_access() {
        let cmd = Command::new("add", vec![json!(2), json!("x")]);
        assert_eq!(cmd.arg::<i64>(0).unwrap(), 2);
        assert!(cmd.arg::<i64>(1).is_err());
        assert!(cmd.arg::<String>(2).is_err());
    }
}
