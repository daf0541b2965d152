//! Command and result payloads exchanged by RPC clients and servers
//!
//! Both are JSON records: `{"command": name, "args": [...]}` for requests and
//! `{"state": "success" | "error", "data": ...}` for replies.

pub mod command;
pub mod result;

pub use self::command::{decode_command, encode_command, Command};
pub use self::result::{decode_result, encode_result, CommandResult, ResultState};
