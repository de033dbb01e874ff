//! Wire protocol: client operations, acknowledgments and server frames.
//!
//! Client frames look like `{"id": "r1", "event": "todo:create", "data": {...}}`.
//! Every frame receives exactly one [`AckReply`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tasksync_types::{DeviceClass, MutationVerb, PresenceStatus, ResourceKind, UserId};

use crate::error::RealtimeError;
use crate::event::OutboundEvent;

/// Raw client frame before the operation is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Request id echoed in the ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Operation name.
    pub event: String,
    /// Operation payload.
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    /// Decode the typed operation.
    pub fn operation(&self) -> Result<ClientOperation, RealtimeError> {
        ClientOperation::parse(&self.event, self.data.clone())
    }
}

/// A validated request to persist a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Target resource kind.
    pub kind: ResourceKind,
    /// Mutation verb.
    pub verb: MutationVerb,
    /// Target resource id; for creates, an optional client-chosen id.
    pub resource_id: Option<String>,
    /// Version the client last saw; a mismatch is a conflict.
    pub base_version: Option<u64>,
    /// Overwrite regardless of server state.
    pub force: bool,
    /// Resource fields, without the control fields above.
    pub fields: Map<String, Value>,
}

impl MutationRequest {
    /// Split a client payload into control fields and resource fields.
    pub fn from_payload(
        kind: ResourceKind,
        verb: MutationVerb,
        data: Value,
    ) -> Result<Self, String> {
        let mut fields = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(format!("expected an object, got {}", type_name(&other))),
        };

        let resource_id = match fields.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(_) => return Err("id must be a non-empty string".to_string()),
        };
        let base_version = match fields.remove("base_version") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or("base_version must be an unsigned integer")?),
        };
        let force = match fields.remove("force") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => b,
            Some(_) => return Err("force must be a boolean".to_string()),
        };

        if matches!(verb, MutationVerb::Update | MutationVerb::Delete) && resource_id.is_none() {
            return Err(format!("{} requires an id", verb));
        }
        if verb == MutationVerb::Reorder && !fields.get("items").is_some_and(Value::is_array) {
            return Err("reorder requires an items array".to_string());
        }

        Ok(Self {
            kind,
            verb,
            resource_id,
            base_version,
            force,
            fields,
        })
    }

    /// Re-assemble the client payload.
    pub fn to_payload(&self) -> Value {
        let mut map = self.fields.clone();
        if let Some(id) = &self.resource_id {
            map.insert("id".into(), Value::String(id.clone()));
        }
        if let Some(v) = self.base_version {
            map.insert("base_version".into(), json!(v));
        }
        if self.force {
            map.insert("force".into(), Value::Bool(true));
        }
        Value::Object(map)
    }

    /// Wire operation name (`todo:update`, ...).
    pub fn operation_name(&self) -> String {
        format!("{}:{}", self.kind.wire_prefix(), self.verb.as_str())
    }
}

/// Every operation a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOperation {
    /// `todo:*`, `category:*`, `tag:*`.
    Mutate(MutationRequest),
    /// `presence:update`.
    PresenceUpdate {
        status: PresenceStatus,
        device: Option<DeviceClass>,
    },
    /// `presence:typing:start`.
    TypingStart { task_id: String },
    /// `presence:typing:stop`.
    TypingStop { task_id: String },
    /// `presence:subscribe`: watch other users' presence.
    PresenceSubscribe { user_ids: Vec<UserId> },
    /// `presence:unsubscribe`.
    PresenceUnsubscribe { user_ids: Vec<UserId> },
    /// `presence:query`: current records for a set of users.
    PresenceQuery { user_ids: Vec<UserId> },
    /// `activity:subscribe`: receive `activity:feed` for one's own actions.
    ActivitySubscribe,
    /// `activity:unsubscribe`.
    ActivityUnsubscribe,
    /// `ping`.
    Ping,
}

#[derive(Deserialize)]
struct PresenceUpdatePayload {
    status: PresenceStatus,
    #[serde(default)]
    device: Option<DeviceClass>,
}

#[derive(Deserialize)]
struct TypingPayload {
    task_id: String,
}

#[derive(Deserialize)]
struct UsersPayload {
    user_ids: Vec<UserId>,
}

impl ClientOperation {
    /// Decode an operation from its wire name and payload.
    pub fn parse(event: &str, data: Value) -> Result<Self, RealtimeError> {
        let invalid = |reason: String| RealtimeError::InvalidPayload {
            operation: event.to_string(),
            reason,
        };
        if let Some((kind, verb)) = parse_mutation_name(event) {
            return MutationRequest::from_payload(kind, verb, data)
                .map(ClientOperation::Mutate)
                .map_err(invalid);
        }

        let op = match event {
            "presence:update" => {
                let p: PresenceUpdatePayload = decode(data).map_err(invalid)?;
                if p.status == PresenceStatus::Offline {
                    return Err(invalid("offline is derived from connections".to_string()));
                }
                ClientOperation::PresenceUpdate {
                    status: p.status,
                    device: p.device,
                }
            }
            "presence:typing:start" => {
                let p: TypingPayload = decode(data).map_err(invalid)?;
                ClientOperation::TypingStart { task_id: p.task_id }
            }
            "presence:typing:stop" => {
                let p: TypingPayload = decode(data).map_err(invalid)?;
                ClientOperation::TypingStop { task_id: p.task_id }
            }
            "presence:subscribe" => {
                let p: UsersPayload = decode(data).map_err(invalid)?;
                ClientOperation::PresenceSubscribe {
                    user_ids: p.user_ids,
                }
            }
            "presence:unsubscribe" => {
                let p: UsersPayload = decode(data).map_err(invalid)?;
                ClientOperation::PresenceUnsubscribe {
                    user_ids: p.user_ids,
                }
            }
            "presence:query" => {
                let p: UsersPayload = decode(data).map_err(invalid)?;
                ClientOperation::PresenceQuery {
                    user_ids: p.user_ids,
                }
            }
            "activity:subscribe" => ClientOperation::ActivitySubscribe,
            "activity:unsubscribe" => ClientOperation::ActivityUnsubscribe,
            "ping" => ClientOperation::Ping,
            other => return Err(RealtimeError::UnknownOperation(other.to_string())),
        };
        Ok(op)
    }

    /// Wire name of this operation.
    pub fn name(&self) -> String {
        match self {
            ClientOperation::Mutate(req) => req.operation_name(),
            ClientOperation::PresenceUpdate { .. } => "presence:update".into(),
            ClientOperation::TypingStart { .. } => "presence:typing:start".into(),
            ClientOperation::TypingStop { .. } => "presence:typing:stop".into(),
            ClientOperation::PresenceSubscribe { .. } => "presence:subscribe".into(),
            ClientOperation::PresenceUnsubscribe { .. } => "presence:unsubscribe".into(),
            ClientOperation::PresenceQuery { .. } => "presence:query".into(),
            ClientOperation::ActivitySubscribe => "activity:subscribe".into(),
            ClientOperation::ActivityUnsubscribe => "activity:unsubscribe".into(),
            ClientOperation::Ping => "ping".into(),
        }
    }

    /// Encode as a client frame.
    pub fn to_frame(&self, id: Option<String>) -> ClientFrame {
        let data = match self {
            ClientOperation::Mutate(req) => req.to_payload(),
            ClientOperation::PresenceUpdate { status, device } => {
                json!({ "status": status, "device": device })
            }
            ClientOperation::TypingStart { task_id } | ClientOperation::TypingStop { task_id } => {
                json!({ "task_id": task_id })
            }
            ClientOperation::PresenceSubscribe { user_ids }
            | ClientOperation::PresenceUnsubscribe { user_ids }
            | ClientOperation::PresenceQuery { user_ids } => json!({ "user_ids": user_ids }),
            ClientOperation::ActivitySubscribe
            | ClientOperation::ActivityUnsubscribe
            | ClientOperation::Ping => Value::Null,
        };
        ClientFrame {
            id,
            event: self.name(),
            data,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|e| e.to_string())
}

fn parse_mutation_name(event: &str) -> Option<(ResourceKind, MutationVerb)> {
    let (prefix, verb) = event.split_once(':')?;
    let kind = match prefix {
        "todo" => ResourceKind::Task,
        "category" => ResourceKind::Category,
        "tag" => ResourceKind::Tag,
        _ => return None,
    };
    let verb = match verb {
        "create" => MutationVerb::Create,
        "update" => MutationVerb::Update,
        "delete" => MutationVerb::Delete,
        "reorder" if kind == ResourceKind::Task => MutationVerb::Reorder,
        _ => return None,
    };
    Some((kind, verb))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Error object inside a failed ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// The single reply to a client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckReply {
    /// Request id from the client frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Result payload. For conflicts, the server's current state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl AckReply {
    /// Successful ack.
    pub fn ok(id: Option<String>, data: Option<Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    /// Failed ack.
    pub fn err(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(AckError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    /// Attach data to the ack.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Error code, if failed.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Reply to a client operation.
    Ack(AckReply),
    /// Pushed notification.
    Event(OutboundEvent),
}

impl ServerFrame {
    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, RealtimeError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventName;

    #[test]
    fn test_parse_mutations() {
        let op = ClientOperation::parse(
            "todo:update",
            json!({"id": "t1", "title": "Buy milk", "base_version": 3}),
        )
        .unwrap();

        match op {
            ClientOperation::Mutate(req) => {
                assert_eq!(req.kind, ResourceKind::Task);
                assert_eq!(req.verb, MutationVerb::Update);
                assert_eq!(req.resource_id.as_deref(), Some("t1"));
                assert_eq!(req.base_version, Some(3));
                assert!(!req.force);
                assert_eq!(req.fields.get("title"), Some(&json!("Buy milk")));
                assert!(!req.fields.contains_key("id"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_update_requires_id() {
        let err = ClientOperation::parse("tag:update", json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_reorder_only_for_tasks() {
        assert!(ClientOperation::parse("todo:reorder", json!({"items": []})).is_ok());
        assert!(matches!(
            ClientOperation::parse("category:reorder", json!({"items": []})),
            Err(RealtimeError::UnknownOperation(_))
        ));
        assert!(ClientOperation::parse("todo:reorder", json!({})).is_err());
    }

    #[test]
    fn test_parse_presence_ops() {
        let op = ClientOperation::parse(
            "presence:update",
            json!({"status": "busy", "device": "mobile"}),
        )
        .unwrap();
        assert_eq!(
            op,
            ClientOperation::PresenceUpdate {
                status: PresenceStatus::Busy,
                device: Some(DeviceClass::Mobile)
            }
        );

        assert!(ClientOperation::parse("presence:update", json!({"status": "offline"})).is_err());

        let op = ClientOperation::parse("presence:typing:start", json!({"task_id": "t9"})).unwrap();
        assert_eq!(
            op,
            ClientOperation::TypingStart {
                task_id: "t9".into()
            }
        );

        assert_eq!(
            ClientOperation::parse("ping", Value::Null).unwrap(),
            ClientOperation::Ping
        );
    }

    #[test]
    fn test_unknown_operation() {
        assert!(matches!(
            ClientOperation::parse("todo:explode", json!({})),
            Err(RealtimeError::UnknownOperation(_))
        ));
        assert!(matches!(
            ClientOperation::parse("admin:shutdown", json!({})),
            Err(RealtimeError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_frame_round_trip_through_name() {
        let op = ClientOperation::PresenceSubscribe {
            user_ids: vec![UserId::new("bob")],
        };
        let frame = op.to_frame(Some("r1".into()));
        assert_eq!(frame.event, "presence:subscribe");
        assert_eq!(frame.operation().unwrap(), op);

        let text = serde_json::to_string(&frame).unwrap();
        let parsed: ClientFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_frame_without_data() {
        let frame: ClientFrame = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(frame.id.is_none());
        assert_eq!(frame.operation().unwrap(), ClientOperation::Ping);
    }

    #[test]
    fn test_ack_serialization() {
        let ack = AckReply::err(Some("r2".into()), "CONFLICT", "changed").with_data(Value::Null);
        let frame = ServerFrame::Ack(ack);
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"ack\""));
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"CONFLICT\""));

        let ok = ServerFrame::Ack(AckReply::ok(None, None)).to_json().unwrap();
        assert_eq!(ok, r#"{"type":"ack","success":true}"#);
    }

    #[test]
    fn test_event_frame_serialization() {
        let frame = ServerFrame::Event(OutboundEvent::new(
            EventName::TodoDeleted,
            json!({"id": "t1"}),
        ));
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"event\""));
        assert!(json.contains("\"event\":\"todo:deleted\""));

        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ServerFrame::Event(e) if e.event == EventName::TodoDeleted));
    }
}
