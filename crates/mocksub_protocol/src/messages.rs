#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use mocksub_domain::{SubscriptionRecord, SubscriptionStatus, TransportKind};
use serde::{Deserialize, Serialize};

/// Message types carried in `metadata.message_type`.
pub const MESSAGE_TYPE_WELCOME: &str = "session_welcome";
pub const MESSAGE_TYPE_KEEPALIVE: &str = "session_keepalive";
pub const MESSAGE_TYPE_RECONNECT: &str = "session_reconnect";
pub const MESSAGE_TYPE_NOTIFICATION: &str = "notification";
pub const MESSAGE_TYPE_REVOCATION: &str = "revocation";

/// Session status strings carried in `payload.session.status`.
pub const SESSION_STATUS_CONNECTED: &str = "connected";
pub const SESSION_STATUS_RECONNECTING: &str = "reconnecting";

/// Cost ceiling reported by the subscriptions endpoint.
pub const MAX_TOTAL_COST: u64 = 10;

/// Envelope metadata present on every server-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
	pub message_id: String,
	pub message_type: String,
	pub message_timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub subscription_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub subscription_version: Option<String>,
}

impl MessageMetadata {
	/// Fresh metadata with a random message id and the current timestamp.
	pub fn new(message_type: &str) -> Self {
		Self {
			message_id: uuid::Uuid::new_v4().to_string(),
			message_type: message_type.to_string(),
			message_timestamp: Utc::now(),
			subscription_type: None,
			subscription_version: None,
		}
	}

	/// Metadata for subscription-scoped messages (notification, revocation).
	pub fn for_subscription(message_type: &str, event_type: &str, version: &str) -> Self {
		let mut metadata = Self::new(message_type);
		metadata.subscription_type = Some(event_type.to_string());
		metadata.subscription_version = Some(version.to_string());
		metadata
	}
}

/// `payload.session` of welcome and reconnect messages.
///
/// `keepalive_timeout_seconds` and `reconnect_url` are serialized even when
/// null; clients key off their presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
	pub id: String,
	pub status: String,
	pub connected_at: DateTime<Utc>,
	pub keepalive_timeout_seconds: Option<u64>,
	pub reconnect_url: Option<String>,
	pub recovery_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
	pub session: SessionData,
}

/// Welcome and reconnect messages share one envelope shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
	pub metadata: MessageMetadata,
	pub payload: SessionPayload,
}

impl SessionMessage {
	/// `session_welcome` announcing the keepalive cadence.
	pub fn welcome(session_id: &str, connected_at: DateTime<Utc>, keepalive_timeout_seconds: u64) -> Self {
		Self {
			metadata: MessageMetadata::new(MESSAGE_TYPE_WELCOME),
			payload: SessionPayload {
				session: SessionData {
					id: session_id.to_string(),
					status: SESSION_STATUS_CONNECTED.to_string(),
					connected_at,
					keepalive_timeout_seconds: Some(keepalive_timeout_seconds),
					reconnect_url: None,
					recovery_url: None,
				},
			},
		}
	}

	/// `session_reconnect` pointing the client at the replacement instance.
	/// Carries the original connect timestamp and no keepalive value.
	pub fn reconnect(session_id: &str, connected_at: DateTime<Utc>, reconnect_url: String) -> Self {
		Self {
			metadata: MessageMetadata::new(MESSAGE_TYPE_RECONNECT),
			payload: SessionPayload {
				session: SessionData {
					id: session_id.to_string(),
					status: SESSION_STATUS_RECONNECTING.to_string(),
					connected_at,
					keepalive_timeout_seconds: None,
					reconnect_url: Some(reconnect_url),
					recovery_url: None,
				},
			},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeepalivePayload {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveMessage {
	pub metadata: MessageMetadata,
	pub payload: KeepalivePayload,
}

impl KeepaliveMessage {
	pub fn new() -> Self {
		Self {
			metadata: MessageMetadata::new(MESSAGE_TYPE_KEEPALIVE),
			payload: KeepalivePayload {},
		}
	}
}

impl Default for KeepaliveMessage {
	fn default() -> Self {
		Self::new()
	}
}

/// Transport descriptor inside a subscription object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportData {
	pub method: TransportKind,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub session_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub callback: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub connected_at: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub disconnected_at: Option<DateTime<Utc>>,
}

impl TransportData {
	pub fn websocket(session_id: &str) -> Self {
		Self {
			method: TransportKind::Websocket,
			session_id: Some(session_id.to_string()),
			callback: None,
			connected_at: None,
			disconnected_at: None,
		}
	}

	pub fn webhook(callback: &str) -> Self {
		Self {
			method: TransportKind::Webhook,
			session_id: None,
			callback: Some(callback.to_string()),
			connected_at: None,
			disconnected_at: None,
		}
	}
}

fn default_status() -> SubscriptionStatus {
	SubscriptionStatus::Enabled
}

fn default_cost() -> u64 {
	0
}

/// Full subscription object as it appears on the wire, both in HTTP
/// responses and inside notification payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
	pub id: String,
	#[serde(default = "default_status")]
	pub status: SubscriptionStatus,
	#[serde(rename = "type")]
	pub event_type: String,
	pub version: String,
	#[serde(default)]
	pub condition: serde_json::Value,
	pub transport: TransportData,
	pub created_at: DateTime<Utc>,
	#[serde(default = "default_cost")]
	pub cost: u64,
}

impl SubscriptionData {
	/// Render a registry record for the HTTP surface. The session id is the
	/// caller's: the registry only stores connection names.
	pub fn from_record(record: &SubscriptionRecord, session_id: &str) -> Self {
		Self {
			id: record.id.clone(),
			status: record.status,
			event_type: record.event_type.clone(),
			version: record.version.clone(),
			condition: record.condition.clone(),
			transport: TransportData {
				method: TransportKind::Websocket,
				session_id: Some(session_id.to_string()),
				callback: None,
				connected_at: Some(record.connected_at),
				disconnected_at: record.disconnected_at,
			},
			created_at: record.created_at,
			cost: 0,
		}
	}
}

/// Payload of a notification or revocation message. The same shape doubles
/// as the body a trigger submits for forwarding, which is why `event` is
/// optional: revocations carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
	pub subscription: SubscriptionData,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub event: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
	pub metadata: MessageMetadata,
	pub payload: NotificationPayload,
}

impl NotificationMessage {
	/// `notification` envelope around a subscription + event pair.
	pub fn notification(payload: NotificationPayload) -> Self {
		let metadata = MessageMetadata::for_subscription(
			MESSAGE_TYPE_NOTIFICATION,
			&payload.subscription.event_type,
			&payload.subscription.version,
		);
		Self { metadata, payload }
	}

	/// `revocation` envelope. Drops any event body: revoked clients only
	/// learn what was revoked, not what they missed.
	pub fn revocation(subscription: SubscriptionData) -> Self {
		let metadata = MessageMetadata::for_subscription(
			MESSAGE_TYPE_REVOCATION,
			&subscription.event_type,
			&subscription.version,
		);
		Self {
			metadata,
			payload: NotificationPayload {
				subscription,
				event: None,
			},
		}
	}
}

/// Body of `POST /eventsub/subscriptions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
	#[serde(rename = "type")]
	pub event_type: String,
	pub version: String,
	#[serde(default)]
	pub condition: serde_json::Value,
	pub transport: TransportData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pagination {}

/// Envelope for subscription list and create responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionListResponse {
	pub data: Vec<SubscriptionData>,
	pub total: usize,
	pub total_cost: u64,
	pub max_total_cost: u64,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub pagination: Option<Pagination>,
}

/// JSON error body used by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
	pub error: String,
	pub status: u16,
	pub message: String,
}

#[derive(Deserialize)]
struct MetadataOnly {
	metadata: MessageMetadata,
}

/// Cheaply extract `metadata.message_type` from a raw frame, for routing
/// before committing to a full parse.
pub fn peek_message_type(text: &str) -> Option<String> {
	serde_json::from_str::<MetadataOnly>(text)
		.ok()
		.map(|m| m.metadata.message_type)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn welcome_serializes_null_reconnect_url() {
		let msg = SessionMessage::welcome("9a31ffcc_d27e05af", Utc::now(), 10);
		let json = serde_json::to_value(&msg).unwrap();

		assert_eq!(json["metadata"]["message_type"], "session_welcome");
		assert_eq!(json["payload"]["session"]["status"], "connected");
		assert_eq!(json["payload"]["session"]["keepalive_timeout_seconds"], 10);
		assert!(json["payload"]["session"]["reconnect_url"].is_null());
		assert!(
			json["payload"]["session"]
				.as_object()
				.unwrap()
				.contains_key("reconnect_url")
		);
	}

	#[test]
	fn reconnect_has_url_and_no_keepalive() {
		let msg = SessionMessage::reconnect(
			"9a31ffcc_d27e05af",
			Utc::now(),
			"ws://127.0.0.1:8080/ws?reconnect_id=abc".to_string(),
		);
		let json = serde_json::to_value(&msg).unwrap();

		assert_eq!(json["metadata"]["message_type"], "session_reconnect");
		assert_eq!(json["payload"]["session"]["status"], "reconnecting");
		assert!(json["payload"]["session"]["keepalive_timeout_seconds"].is_null());
		assert_eq!(
			json["payload"]["session"]["reconnect_url"],
			"ws://127.0.0.1:8080/ws?reconnect_id=abc"
		);
	}

	#[test]
	fn keepalive_payload_is_empty_object() {
		let msg = KeepaliveMessage::new();
		let json = serde_json::to_value(&msg).unwrap();

		assert_eq!(json["metadata"]["message_type"], "session_keepalive");
		assert_eq!(json["payload"], serde_json::json!({}));
	}

	#[test]
	fn notification_metadata_carries_subscription_fields() {
		let payload = NotificationPayload {
			subscription: SubscriptionData {
				id: "sub-1".into(),
				status: SubscriptionStatus::Enabled,
				event_type: "channel.cheer".into(),
				version: "1".into(),
				condition: serde_json::json!({"broadcaster_user_id": "1234"}),
				transport: TransportData::websocket("9a31ffcc_d27e05af"),
				created_at: Utc::now(),
				cost: 0,
			},
			event: Some(serde_json::json!({"bits": 100})),
		};

		let msg = NotificationMessage::notification(payload);
		assert_eq!(msg.metadata.subscription_type.as_deref(), Some("channel.cheer"));
		assert_eq!(msg.metadata.subscription_version.as_deref(), Some("1"));

		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(json["payload"]["subscription"]["type"], "channel.cheer");
		assert_eq!(json["payload"]["event"]["bits"], 100);
	}

	#[test]
	fn revocation_drops_the_event() {
		let mut subscription = SubscriptionData {
			id: "sub-1".into(),
			status: SubscriptionStatus::AuthorizationRevoked,
			event_type: "channel.follow".into(),
			version: "2".into(),
			condition: serde_json::Value::Null,
			transport: TransportData::websocket("9a31ffcc_d27e05af"),
			created_at: Utc::now(),
			cost: 0,
		};
		subscription.condition = serde_json::json!({"broadcaster_user_id": "1234"});

		let msg = NotificationMessage::revocation(subscription);
		assert_eq!(msg.metadata.message_type, MESSAGE_TYPE_REVOCATION);
		assert!(msg.payload.event.is_none());

		let json = serde_json::to_value(&msg).unwrap();
		assert!(json["payload"].as_object().unwrap().get("event").is_none());
		assert_eq!(json["payload"]["subscription"]["status"], "authorization_revoked");
	}

	#[test]
	fn create_request_parses_helix_shape() {
		let body = serde_json::json!({
			"type": "channel.follow",
			"version": "2",
			"condition": {"broadcaster_user_id": "1234", "moderator_user_id": "1234"},
			"transport": {"method": "websocket", "session_id": "9a31ffcc_d27e05af"}
		});

		let req: CreateSubscriptionRequest = serde_json::from_value(body).unwrap();
		assert_eq!(req.event_type, "channel.follow");
		assert_eq!(req.transport.method, TransportKind::Websocket);
		assert_eq!(req.transport.session_id.as_deref(), Some("9a31ffcc_d27e05af"));
	}

	#[test]
	fn forwarded_body_defaults_status_to_enabled() {
		let body = serde_json::json!({
			"subscription": {
				"id": "sub-9",
				"type": "channel.raid",
				"version": "1",
				"transport": {"method": "websocket"},
				"created_at": "2026-08-01T00:00:00Z"
			},
			"event": {"viewers": 5}
		});

		let payload: NotificationPayload = serde_json::from_value(body).unwrap();
		assert_eq!(payload.subscription.status, SubscriptionStatus::Enabled);
		assert_eq!(payload.subscription.cost, 0);
	}

	#[test]
	fn peek_finds_message_type() {
		let msg = SessionMessage::welcome("9a31ffcc_d27e05af", Utc::now(), 10);
		let text = serde_json::to_string(&msg).unwrap();
		assert_eq!(peek_message_type(&text).as_deref(), Some(MESSAGE_TYPE_WELCOME));
		assert_eq!(peek_message_type("not json"), None);
	}
}
