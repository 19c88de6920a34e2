//! Shared protocol constants and wire types for the control and upload sockets

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Endpoint paths, relative to the base address
pub const CONTROL_PATH: &str = "/control";
pub const UPLOAD_PREFIX: &str = "/api/uploads/";

// One mebibyte per data frame; the server acknowledges each one
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

// Terminal error strings surfaced through Uploader::error()
pub mod reason {
    pub const CLOSED_BY_SERVER: &str = "socket closed by server";
    pub const CANCELLED: &str = "cancelled";
    pub const MALFORMED_REPLY: &str = "malformed control message";
}

pub mod timeouts {
    // Progress tick interval for UI updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;
}

/// Control commands sent as text frames on an upload socket.
///
/// The server dispatches on the `cmd` tag, so `Finish` goes out as
/// `{"cmd":"Finish"}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "cmd")]
pub enum UploadCommand {
    Seek { pos: u64 },
    Finish {},
}

impl UploadCommand {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reply to a data block or a control command on the upload socket.
///
/// Block acknowledgements carry `len` and `cur_pos`; command replies only
/// carry `err`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReply {
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub cur_pos: Option<u64>,
    #[serde(default)]
    pub len: Option<u64>,
}

/// Extract the server-side error of a control response.
///
/// A missing or `null` field means success. Non-string values are rendered
/// as their JSON text so nothing the server says is lost.
pub fn response_error(resp: &Value) -> Option<String> {
    match resp.get("err") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finish_command_wire_form() {
        let text = UploadCommand::Finish {}.to_text().unwrap();
        assert_eq!(text, r#"{"cmd":"Finish"}"#);
    }

    #[test]
    fn seek_command_wire_form() {
        let v: Value = serde_json::from_str(&UploadCommand::Seek { pos: 42 }.to_text().unwrap()).unwrap();
        assert_eq!(v, json!({"cmd": "Seek", "pos": 42}));
    }

    #[test]
    fn block_ack_parses() {
        let r: UploadReply = serde_json::from_str(r#"{"err":null,"len":1048576,"cur_pos":1048576}"#).unwrap();
        assert_eq!(r.err, None);
        assert_eq!(r.cur_pos, Some(1_048_576));
        assert_eq!(r.len, Some(1_048_576));
    }

    #[test]
    fn finish_reply_with_error_parses() {
        let r: UploadReply = serde_json::from_str(r#"{"err":"disk full"}"#).unwrap();
        assert_eq!(r.err.as_deref(), Some("disk full"));
        assert_eq!(r.cur_pos, None);
    }

    #[test]
    fn response_error_variants() {
        assert_eq!(response_error(&json!({"err": null, "x": 1})), None);
        assert_eq!(response_error(&json!({"x": 1})), None);
        assert_eq!(response_error(&json!({"err": "nope"})).as_deref(), Some("nope"));
        assert_eq!(response_error(&json!({"err": 7})).as_deref(), Some("7"));
    }
}
