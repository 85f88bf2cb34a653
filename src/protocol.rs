//! Line-delimited JSON envelopes spoken between the agent and the collector.
//!
//! Every request is a single JSON object terminated by `\n` and is answered by
//! exactly one response line on the same connection.

use serde::{Deserialize, Serialize};

use crate::message::LogMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Send(LogMessage),
    SendMultiple(Vec<LogMessage>),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Send(_) => "Send",
            Request::SendMultiple(_) => "SendMultiple",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}

/// Serializes `value` followed by the line terminator.
pub fn encode_line<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LogLevel;
    use chrono::{TimeZone, Utc};

    #[test]
    fn request_envelope_names_the_method() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let req = Request::Send(LogMessage::new("h", LogLevel::Info, time, "hi"));
        let line = String::from_utf8(encode_line(&req).unwrap()).unwrap();

        assert!(line.ends_with('\n'));
        assert!(!line.trim_end().contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "Send");
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn batch_request_parses() {
        let req: Request = serde_json::from_str(
            r#"{"method":"SendMultiple","params":[
                {"server":"a","logLevel":"INFO","time":"2024-01-01T00:00:00Z","message":"1"},
                {"server":"a","logLevel":"INFO","time":"2024-01-01T00:00:00Z","message":"2"}
            ]}"#,
        )
        .unwrap();
        match req {
            Request::SendMultiple(msgs) => {
                let texts: Vec<_> = msgs.iter().map(|m| m.message.as_str()).collect();
                assert_eq!(texts, ["1", "2"]);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"method":"Drop","params":[]}"#).is_err());
    }

    #[test]
    fn ok_response_omits_error() {
        let line = String::from_utf8(encode_line(&Response::ok()).unwrap()).unwrap();
        assert_eq!(line, "{\"ok\":true}\n");
        let parsed: Response = serde_json::from_str(r#"{"ok":false,"error":"queue closed"}"#).unwrap();
        assert_eq!(parsed, Response::error("queue closed"));
    }
}
