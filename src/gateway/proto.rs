//! Gateway wire protocol.
//!
//! Every frame is a JSON object `{op, d, s, t}`. Inbound frames are decoded
//! into [`ServerFrame`]; outbound frames are built from [`ClientFrame`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Gateway operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event.
    Dispatch = 0,
    /// Liveness signal; the server may also send it to request one.
    Heartbeat = 1,
    /// Starts a new session.
    Identify = 2,
    /// Continues a previous session.
    Resume = 6,
    /// Server asks the client to reconnect and resume.
    Reconnect = 7,
    /// Session is invalid; `d` tells whether it can be resumed.
    InvalidSession = 9,
    /// First frame after connecting, carries the heartbeat interval.
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Raw gateway frame as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// A dispatched event forwarded to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub sequence: u64,
    /// Event name, such as `MESSAGE_CREATE`.
    pub name: String,
    pub data: Value,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Hello { heartbeat_interval: Duration },
    HeartbeatAck,
    /// The server wants a heartbeat now.
    HeartbeatRequest,
    Dispatch(DispatchEvent),
    Reconnect,
    InvalidSession { resumable: bool },
    /// An opcode this client does not consume.
    Unknown { op: u8 },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{op:?} frame is missing `{field}`")]
    MissingField { op: OpCode, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct HelloData {
    #[serde(alias = "heartbeat_interval")]
    heartbeat_interval_ms: u64,
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, FrameError> {
        let frame: GatewayFrame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: GatewayFrame) -> Result<Self, FrameError> {
        let Some(op) = OpCode::from_u8(frame.op) else {
            return Ok(Self::Unknown { op: frame.op });
        };

        match op {
            OpCode::Hello => {
                let hello: HelloData = serde_json::from_value(frame.d)?;
                Ok(Self::Hello {
                    heartbeat_interval: Duration::from_millis(hello.heartbeat_interval_ms),
                })
            }
            OpCode::HeartbeatAck => Ok(Self::HeartbeatAck),
            OpCode::Heartbeat => Ok(Self::HeartbeatRequest),
            OpCode::Reconnect => Ok(Self::Reconnect),
            OpCode::InvalidSession => Ok(Self::InvalidSession {
                resumable: frame.d.as_bool().unwrap_or(false),
            }),
            OpCode::Dispatch => {
                let sequence = frame.s.ok_or(FrameError::MissingField {
                    op,
                    field: "s",
                })?;
                let name = frame.t.ok_or(FrameError::MissingField { op, field: "t" })?;
                Ok(Self::Dispatch(DispatchEvent {
                    sequence,
                    name,
                    data: frame.d,
                }))
            }
            OpCode::Identify | OpCode::Resume => Ok(Self::Unknown { op: frame.op }),
        }
    }
}

/// Connection properties sent with identify.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "wyvern".to_string(),
            device: "wyvern".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: u64,
    pub properties: IdentifyProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Frames this client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Carries the last received sequence, `0` before any dispatch.
    Heartbeat { sequence: u64 },
    Identify(IdentifyPayload),
    Resume(ResumePayload),
}

impl ClientFrame {
    pub fn op(&self) -> OpCode {
        match self {
            Self::Heartbeat { .. } => OpCode::Heartbeat,
            Self::Identify(_) => OpCode::Identify,
            Self::Resume(_) => OpCode::Resume,
        }
    }

    pub fn to_frame(&self) -> Result<GatewayFrame, serde_json::Error> {
        let d = match self {
            Self::Heartbeat { sequence } => Value::from(*sequence),
            Self::Identify(payload) => serde_json::to_value(payload)?,
            Self::Resume(payload) => serde_json::to_value(payload)?,
        };
        Ok(GatewayFrame {
            op: self.op().as_u8(),
            d,
            s: None,
            t: None,
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_frame()?)
    }
}

/// Close codes the gateway sends when it terminates a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

/// What the session manager does after a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume if a session is held.
    Resume,
    /// Reconnect with a fresh identify.
    Reidentify,
    /// Credentials were rejected; stop.
    Unauthorized,
    /// Configuration is unusable; stop.
    Fatal,
}

impl CloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn action(self) -> CloseAction {
        match self {
            Self::AuthenticationFailed => CloseAction::Unauthorized,
            Self::InvalidShard
            | Self::ShardingRequired
            | Self::InvalidApiVersion
            | Self::InvalidIntents
            | Self::DisallowedIntents => CloseAction::Fatal,
            Self::InvalidSequence | Self::SessionTimedOut => CloseAction::Reidentify,
            Self::UnknownError
            | Self::UnknownOpcode
            | Self::DecodeError
            | Self::NotAuthenticated
            | Self::AlreadyAuthenticated
            | Self::RateLimited => CloseAction::Resume,
        }
    }
}

/// Maps a raw close code to an action; codes outside the gateway range resume.
#[must_use]
pub fn close_action(code: u16) -> CloseAction {
    CloseCode::from_u16(code).map_or(CloseAction::Resume, CloseCode::action)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn hello_accepts_both_interval_field_names() {
        let frame = ServerFrame::from_text(r#"{"op":10,"d":{"heartbeat_interval_ms":45000}}"#)
            .expect("hello");
        assert_eq!(
            frame,
            ServerFrame::Hello {
                heartbeat_interval: Duration::from_secs(45)
            }
        );

        let frame = ServerFrame::from_text(
            r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#,
        )
        .expect("hello");
        assert_eq!(
            frame,
            ServerFrame::Hello {
                heartbeat_interval: Duration::from_millis(41250)
            }
        );
    }

    #[test]
    fn dispatch_carries_sequence_and_name() {
        let frame = ServerFrame::from_text(
            r#"{"op":0,"d":{"content":"hi"},"s":57,"t":"MESSAGE_CREATE"}"#,
        )
        .expect("dispatch");
        assert_eq!(
            frame,
            ServerFrame::Dispatch(DispatchEvent {
                sequence: 57,
                name: "MESSAGE_CREATE".to_string(),
                data: json!({"content": "hi"}),
            })
        );
    }

    #[test]
    fn dispatch_without_sequence_is_rejected() {
        let error = ServerFrame::from_text(r#"{"op":0,"d":{},"t":"READY"}"#)
            .expect_err("missing s");
        assert!(matches!(
            error,
            FrameError::MissingField { field: "s", .. }
        ));
    }

    #[test]
    fn control_frames_are_classified() {
        let cases = [
            (r#"{"op":11}"#, ServerFrame::HeartbeatAck),
            (r#"{"op":1,"d":null}"#, ServerFrame::HeartbeatRequest),
            (r#"{"op":7,"d":null}"#, ServerFrame::Reconnect),
            (
                r#"{"op":9,"d":true}"#,
                ServerFrame::InvalidSession { resumable: true },
            ),
            (
                r#"{"op":9,"d":false}"#,
                ServerFrame::InvalidSession { resumable: false },
            ),
            (r#"{"op":42,"d":null}"#, ServerFrame::Unknown { op: 42 }),
        ];
        for (text, expected) in cases {
            assert_eq!(ServerFrame::from_text(text).expect(text), expected);
        }
    }

    #[test]
    fn heartbeat_frame_carries_sequence() {
        let text = ClientFrame::Heartbeat { sequence: 0 }
            .to_text()
            .expect("encode");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["op"], 1);
        assert_eq!(value["d"], 0);
    }

    #[test]
    fn resume_frame_uses_seq_field() {
        let frame = ClientFrame::Resume(ResumePayload {
            token: "t".to_string(),
            session_id: "abc".to_string(),
            seq: 57,
        })
        .to_frame()
        .expect("encode");
        assert_eq!(frame.op, 6);
        assert_eq!(frame.d, json!({"token": "t", "session_id": "abc", "seq": 57}));
    }

    #[test]
    fn close_codes_map_to_actions() {
        assert_eq!(close_action(4004), CloseAction::Unauthorized);
        assert_eq!(close_action(4014), CloseAction::Fatal);
        assert_eq!(close_action(4009), CloseAction::Reidentify);
        assert_eq!(close_action(4000), CloseAction::Resume);
        assert_eq!(close_action(1001), CloseAction::Resume);
    }
}
