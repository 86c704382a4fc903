//! Message shapes on the worker channel
//!
//! Three kinds of messages travel the channel: a call request
//! `[uid, target, sig, args]`, a call response `[uid, error, result]`, and
//! the bare control tokens `"READY"` and `"TICK"`. Anything else is dropped
//! at the parse boundary so the channel stays tolerant of out-of-band
//! framing. The protocol is symmetric: either side may receive a request
//! and must answer it.

use goro_codec::{ErrorValue, WireValue};
use serde::{Deserialize, Serialize};

/// One-shot token a worker emits once its message handler is installed
pub const READY: &str = "READY";

/// Periodic liveness token
pub const TICK: &str = "TICK";

/// Interval between liveness ticks
pub const TICK_INTERVAL_MS: u64 = 100;

/// A worker whose latest tick is older than this is considered stale
pub const STALE_AFTER_MS: u64 = 1000;

/// Correlation key between a request and its response. Monotonically
/// increasing on the issuing side; wrap handling is out of scope.
pub type Uid = u64;

/// What a request asks the other side to run: a registry index, or a name
/// resolved against builtins and named registry entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallTarget {
    Index(u32),
    Name(String),
}

/// `[uid, target, sig, args]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest(pub Uid, pub CallTarget, pub u32, pub Vec<WireValue>);

impl CallRequest {
    pub fn uid(&self) -> Uid {
        self.0
    }

    pub fn target(&self) -> &CallTarget {
        &self.1
    }

    pub fn sig(&self) -> u32 {
        self.2
    }
}

/// `[uid, error, result]`; a non-null error means the call failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse(pub Uid, pub Option<ErrorValue>, pub WireValue);

impl CallResponse {
    pub fn ok(uid: Uid, result: WireValue) -> Self {
        Self(uid, None, result)
    }

    pub fn err(uid: Uid, error: ErrorValue) -> Self {
        Self(uid, Some(error), WireValue::Null)
    }

    pub fn uid(&self) -> Uid {
        self.0
    }
}

/// One channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(CallRequest),
    Response(CallResponse),
    Control(String),
}

impl Message {
    pub fn ready() -> Self {
        Message::Control(READY.to_string())
    }

    pub fn tick() -> Self {
        Message::Control(TICK.to_string())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Message::Control(token) if token == READY)
    }

    pub fn is_tick(&self) -> bool {
        matches!(self, Message::Control(token) if token == TICK)
    }

    /// Parse one channel line. Returns `None` for anything that does not
    /// match the three message shapes; callers drop those silently.
    pub fn parse(line: &str) -> Option<Message> {
        let message: Message = serde_json::from_str(line).ok()?;
        match &message {
            Message::Control(token) if token != READY && token != TICK => None,
            _ => Some(message),
        }
    }

    /// Serialize for the line-delimited channel
    pub fn to_line(&self) -> Result<String, crate::error::IpcError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = CallRequest(
            7,
            CallTarget::Index(2),
            0xDEAD_BEEF,
            vec![WireValue::Int(12), WireValue::Int(13)],
        );
        let json = serde_json::to_string(&Message::Request(request.clone())).unwrap();
        assert!(json.starts_with("[7,2,"));

        match Message::parse(&json) {
            Some(Message::Request(parsed)) => assert_eq!(parsed, request),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_name_target_wire_shape() {
        let request = CallRequest(1, CallTarget::Name("sum".into()), 42, vec![]);
        let json = serde_json::to_string(&Message::Request(request.clone())).unwrap();
        assert!(json.starts_with("[1,\"sum\","));
        assert_eq!(Message::parse(&json), Some(Message::Request(request)));
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = CallResponse::ok(9, WireValue::Int(25));
        let json = serde_json::to_string(&Message::Response(ok.clone())).unwrap();
        assert_eq!(json, r#"[9,null,{"t":"int","v":25}]"#);
        assert_eq!(Message::parse(&json), Some(Message::Response(ok)));

        let failed = CallResponse::err(10, goro_codec::ErrorValue::msg("Something went wrong"));
        let line = Message::Response(failed.clone()).to_line().unwrap();
        match Message::parse(&line) {
            Some(Message::Response(parsed)) => {
                assert_eq!(parsed.1.unwrap().message, "Something went wrong");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_control_tokens() {
        assert_eq!(Message::parse("\"READY\""), Some(Message::ready()));
        assert_eq!(Message::parse("\"TICK\""), Some(Message::tick()));
        assert!(Message::ready().is_ready());
        assert!(Message::tick().is_tick());
        assert!(!Message::tick().is_ready());
    }

    #[test]
    fn test_unrecognized_lines_are_dropped() {
        for line in [
            "",
            "garbage",
            "{}",
            "[1,2]",
            "[\"a\",\"b\",\"c\",\"d\"]",
            "\"NOPE\"",
            "[1,null]",
        ] {
            assert_eq!(Message::parse(line), None, "line {:?} should not parse", line);
        }
    }

    #[test]
    fn test_ticks_survive_round_trip() {
        let line = Message::tick().to_line().unwrap();
        assert!(Message::parse(&line).unwrap().is_tick());
    }
}
