//! Channel protocol message types.
//!
//! Every message is tagged by `type`. Requests and responses carry the id of
//! the request they belong to, except the handshake (`ResponseInitialize`) and
//! the client hello, which are connection-scoped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IpcError, RemoteError};

/// Message discriminant, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    RequestCommon,
    RequestCancel,
    ResponseInitialize,
    ResponseSuccess,
    ResponseProgress,
    ResponseError,
    ResponseErrorObj,
    Hello,
}

impl MessageKind {
    /// Check if this kind travels from server to client.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::ResponseInitialize
                | MessageKind::ResponseSuccess
                | MessageKind::ResponseProgress
                | MessageKind::ResponseError
                | MessageKind::ResponseErrorObj
        )
    }

    /// Check if this kind travels from client to server.
    pub fn is_request(self) -> bool {
        matches!(self, MessageKind::RequestCommon | MessageKind::RequestCancel)
    }

    /// Check if this kind settles a pending request.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageKind::ResponseSuccess | MessageKind::ResponseError | MessageKind::ResponseErrorObj
        )
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Invoke `name` on `channel_name`.
    RequestCommon {
        id: u64,
        #[serde(rename = "channelName")]
        channel_name: String,
        name: String,
        #[serde(default)]
        arg: Value,
    },
    /// Abandon the request with this id.
    RequestCancel { id: u64 },
    /// Handshake: the sending server is ready.
    ResponseInitialize,
    /// Terminal success.
    ResponseSuccess {
        id: u64,
        #[serde(default)]
        data: Value,
    },
    /// Non-terminal progress notification.
    ResponseProgress {
        id: u64,
        #[serde(default)]
        data: Value,
    },
    /// Terminal structured error.
    ResponseError { id: u64, data: RemoteError },
    /// Terminal opaque error payload.
    ResponseErrorObj {
        id: u64,
        #[serde(default)]
        data: Value,
    },
    /// First message of a routed connection: the client's self-announced id.
    Hello {
        #[serde(rename = "clientId")]
        client_id: String,
    },
}

impl Message {
    /// Create a request.
    pub fn request(id: u64, channel_name: impl Into<String>, name: impl Into<String>, arg: Value) -> Self {
        Message::RequestCommon {
            id,
            channel_name: channel_name.into(),
            name: name.into(),
            arg,
        }
    }

    /// Create a cancel request.
    pub fn cancel(id: u64) -> Self {
        Message::RequestCancel { id }
    }

    /// Create a success response.
    pub fn success(id: u64, data: Value) -> Self {
        Message::ResponseSuccess { id, data }
    }

    /// Create a progress response.
    pub fn progress(id: u64, data: Value) -> Self {
        Message::ResponseProgress { id, data }
    }

    /// Create the terminal error response for `err`.
    ///
    /// Opaque payloads become `ResponseErrorObj`, everything else `ResponseError`.
    pub fn failure(id: u64, err: &IpcError) -> Self {
        match err {
            IpcError::Opaque(data) => Message::ResponseErrorObj { id, data: data.clone() },
            other => Message::ResponseError {
                id,
                data: other.structured(),
            },
        }
    }

    /// Create a client hello.
    pub fn hello(client_id: impl Into<String>) -> Self {
        Message::Hello {
            client_id: client_id.into(),
        }
    }

    /// The message discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RequestCommon { .. } => MessageKind::RequestCommon,
            Message::RequestCancel { .. } => MessageKind::RequestCancel,
            Message::ResponseInitialize => MessageKind::ResponseInitialize,
            Message::ResponseSuccess { .. } => MessageKind::ResponseSuccess,
            Message::ResponseProgress { .. } => MessageKind::ResponseProgress,
            Message::ResponseError { .. } => MessageKind::ResponseError,
            Message::ResponseErrorObj { .. } => MessageKind::ResponseErrorObj,
            Message::Hello { .. } => MessageKind::Hello,
        }
    }

    /// Request id, for request-scoped messages.
    pub fn id(&self) -> Option<u64> {
        match self {
            Message::RequestCommon { id, .. }
            | Message::RequestCancel { id }
            | Message::ResponseSuccess { id, .. }
            | Message::ResponseProgress { id, .. }
            | Message::ResponseError { id, .. }
            | Message::ResponseErrorObj { id, .. } => Some(*id),
            Message::ResponseInitialize | Message::Hello { .. } => None,
        }
    }

    /// Check if this message travels from server to client.
    pub fn is_response(&self) -> bool {
        self.kind().is_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialize() {
        let msg = Message::request(0, "launch", "start", json!({"args": ["--version"]}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "RequestCommon");
        assert_eq!(json["id"], 0);
        assert_eq!(json["channelName"], "launch");
        assert_eq!(json["name"], "start");
        assert_eq!(json["arg"]["args"][0], "--version");
    }

    #[test]
    fn test_initialize_has_no_id() {
        let json = serde_json::to_string(&Message::ResponseInitialize).unwrap();
        assert_eq!(json, r#"{"type":"ResponseInitialize"}"#);
        assert_eq!(Message::ResponseInitialize.id(), None);
    }

    #[test]
    fn test_request_parsing_without_arg() {
        let json = r#"{"type":"RequestCommon","id":3,"channelName":"c","name":"ping"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg, Message::request(3, "c", "ping", Value::Null));
    }

    #[test]
    fn test_success_without_data_parses_as_null() {
        let json = r#"{"type":"ResponseSuccess","id":0}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg, Message::success(0, Value::Null));
    }

    #[test]
    fn test_kind_classification() {
        assert!(MessageKind::ResponseInitialize.is_response());
        assert!(MessageKind::ResponseProgress.is_response());
        assert!(!MessageKind::ResponseProgress.is_terminal());
        assert!(MessageKind::ResponseErrorObj.is_terminal());
        assert!(MessageKind::RequestCancel.is_request());
        assert!(!MessageKind::Hello.is_request());
        assert!(!MessageKind::Hello.is_response());
    }

    #[test]
    fn test_failure_structured() {
        let err = IpcError::UnknownChannel("nope".into());
        match Message::failure(7, &err) {
            Message::ResponseError { id, data } => {
                assert_eq!(id, 7);
                assert_eq!(data.name, "UnknownChannel");
                assert_eq!(data.message, "Unknown channel: nope");
                assert!(data.stack.is_none());
            }
            other => panic!("Expected ResponseError, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_remote_passes_through() {
        let remote = RemoteError::new("UsageError", "no arguments").with_stack(vec!["at start".into()]);
        assert_eq!(
            Message::failure(3, &IpcError::Remote(remote.clone())),
            Message::ResponseError { id: 3, data: remote }
        );
    }

    #[test]
    fn test_failure_opaque() {
        let err = IpcError::Opaque(json!({"code": 42}));
        assert_eq!(
            Message::failure(1, &err),
            Message::ResponseErrorObj {
                id: 1,
                data: json!({"code": 42})
            }
        );
    }

    #[test]
    fn test_error_stack_serializes_as_lines() {
        let data = RemoteError::new("Error", "boom").with_stack(vec!["Error: boom".into(), "at f".into()]);
        let json = serde_json::to_value(Message::ResponseError { id: 2, data }).unwrap();
        assert_eq!(json["data"]["stack"], json!(["Error: boom", "at f"]));
    }

    #[test]
    fn test_hello_serialize() {
        let json = serde_json::to_value(Message::hello("w1")).unwrap();
        assert_eq!(json, json!({"type": "Hello", "clientId": "w1"}));
    }

    #[test]
    fn test_ids() {
        assert_eq!(Message::cancel(9).id(), Some(9));
        assert_eq!(Message::progress(4, json!(1)).id(), Some(4));
        assert_eq!(Message::hello("x").id(), None);
    }
}
