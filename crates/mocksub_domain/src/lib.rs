#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard cap on live subscriptions a single connection may hold.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 100;

/// Delivery transports a subscription can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
	Websocket,
	Webhook,
}

impl TransportKind {
	/// Stable string identifier, as it appears in transport descriptors.
	pub const fn as_str(self) -> &'static str {
		match self {
			TransportKind::Websocket => "websocket",
			TransportKind::Webhook => "webhook",
		}
	}
}

impl fmt::Display for TransportKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown transport: {0}")]
	UnknownTransport(String),
	#[error("unknown subscription status: {0}")]
	UnknownStatus(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for TransportKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"websocket" | "ws" => Ok(TransportKind::Websocket),
			"webhook" => Ok(TransportKind::Webhook),
			other => Err(ParseIdError::UnknownTransport(other.to_string())),
		}
	}
}

/// Lifecycle status of a subscription record.
///
/// `NetworkTimeout` intentionally has no `websocket_` prefix; that is the
/// string peers observe in production and changing it would break consumers
/// that match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
	Enabled,
	WebsocketDisconnected,
	WebsocketInternalError,
	WebsocketReceivedInboundTraffic,
	WebsocketFailedPingPong,
	WebsocketConnectionUnused,
	NetworkTimeout,
	WebsocketNetworkError,
	WebsocketFailedToReconnect,
	AuthorizationRevoked,
	UserRemoved,
	VersionRemoved,
	ModeratorRemoved,
}

impl SubscriptionStatus {
	pub const ALL: &'static [SubscriptionStatus] = &[
		SubscriptionStatus::Enabled,
		SubscriptionStatus::WebsocketDisconnected,
		SubscriptionStatus::WebsocketInternalError,
		SubscriptionStatus::WebsocketReceivedInboundTraffic,
		SubscriptionStatus::WebsocketFailedPingPong,
		SubscriptionStatus::WebsocketConnectionUnused,
		SubscriptionStatus::NetworkTimeout,
		SubscriptionStatus::WebsocketNetworkError,
		SubscriptionStatus::WebsocketFailedToReconnect,
		SubscriptionStatus::AuthorizationRevoked,
		SubscriptionStatus::UserRemoved,
		SubscriptionStatus::VersionRemoved,
		SubscriptionStatus::ModeratorRemoved,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			SubscriptionStatus::Enabled => "enabled",
			SubscriptionStatus::WebsocketDisconnected => "websocket_disconnected",
			SubscriptionStatus::WebsocketInternalError => "websocket_internal_error",
			SubscriptionStatus::WebsocketReceivedInboundTraffic => "websocket_received_inbound_traffic",
			SubscriptionStatus::WebsocketFailedPingPong => "websocket_failed_ping_pong",
			SubscriptionStatus::WebsocketConnectionUnused => "websocket_connection_unused",
			SubscriptionStatus::NetworkTimeout => "network_timeout",
			SubscriptionStatus::WebsocketNetworkError => "websocket_network_error",
			SubscriptionStatus::WebsocketFailedToReconnect => "websocket_failed_to_reconnect",
			SubscriptionStatus::AuthorizationRevoked => "authorization_revoked",
			SubscriptionStatus::UserRemoved => "user_removed",
			SubscriptionStatus::VersionRemoved => "version_removed",
			SubscriptionStatus::ModeratorRemoved => "moderator_removed",
		}
	}

	/// True for every status except `enabled`. A forwarded event whose
	/// subscription carries such a status is delivered as a revocation.
	pub const fn is_revocation(self) -> bool {
		!matches!(self, SubscriptionStatus::Enabled)
	}
}

impl fmt::Display for SubscriptionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SubscriptionStatus {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		SubscriptionStatus::ALL
			.iter()
			.copied()
			.find(|status| status.as_str() == s.to_ascii_lowercase())
			.ok_or_else(|| ParseIdError::UnknownStatus(s.to_string()))
	}
}

/// WebSocket close codes the mock server can send, with their protocol
/// meanings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
	Normal = 1000,
	InternalError = 4000,
	SentInboundTraffic = 4001,
	FailedPingPong = 4002,
	ConnectionUnused = 4003,
	ReconnectGraceExpired = 4004,
	NetworkTimeout = 4005,
	NetworkError = 4006,
	InvalidReconnect = 4007,
}

impl CloseCode {
	pub const ALL: &'static [CloseCode] = &[
		CloseCode::Normal,
		CloseCode::InternalError,
		CloseCode::SentInboundTraffic,
		CloseCode::FailedPingPong,
		CloseCode::ConnectionUnused,
		CloseCode::ReconnectGraceExpired,
		CloseCode::NetworkTimeout,
		CloseCode::NetworkError,
		CloseCode::InvalidReconnect,
	];

	pub const fn as_u16(self) -> u16 {
		self as u16
	}

	pub fn from_u16(code: u16) -> Option<Self> {
		CloseCode::ALL.iter().copied().find(|c| c.as_u16() == code)
	}

	/// Human-readable close frame reason.
	pub const fn reason_text(self) -> &'static str {
		match self {
			CloseCode::Normal => "Normal Closure",
			CloseCode::InternalError => "Internal Server Error",
			CloseCode::SentInboundTraffic => "Client sent inbound traffic",
			CloseCode::FailedPingPong => "Client failed ping-pong",
			CloseCode::ConnectionUnused => "Connection unused",
			CloseCode::ReconnectGraceExpired => "Reconnect grace time expired",
			CloseCode::NetworkTimeout => "Network timeout",
			CloseCode::NetworkError => "Network error",
			CloseCode::InvalidReconnect => "Invalid reconnect",
		}
	}

	/// Status stamped onto the closing connection's still-enabled
	/// subscriptions.
	///
	/// `ReconnectGraceExpired` maps back to `enabled`: clients cut off at the
	/// end of a reconnect grace window keep their subscriptions usable, which
	/// is what production does for that code.
	pub const fn derived_status(self) -> SubscriptionStatus {
		match self {
			CloseCode::Normal => SubscriptionStatus::WebsocketDisconnected,
			CloseCode::InternalError => SubscriptionStatus::WebsocketInternalError,
			CloseCode::SentInboundTraffic => SubscriptionStatus::WebsocketReceivedInboundTraffic,
			CloseCode::FailedPingPong => SubscriptionStatus::WebsocketFailedPingPong,
			CloseCode::ConnectionUnused => SubscriptionStatus::WebsocketConnectionUnused,
			CloseCode::ReconnectGraceExpired => SubscriptionStatus::Enabled,
			CloseCode::NetworkTimeout => SubscriptionStatus::NetworkTimeout,
			CloseCode::NetworkError => SubscriptionStatus::WebsocketNetworkError,
			CloseCode::InvalidReconnect => SubscriptionStatus::WebsocketFailedToReconnect,
		}
	}
}

impl fmt::Display for CloseCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.as_u16(), self.reason_text())
	}
}

/// WebSocket session identifier: `<instance id>_<connection name>`.
///
/// The instance half changes on every reconnect handoff while the connection
/// half names one client socket for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
	instance: String,
	connection: String,
}

impl SessionId {
	pub fn new(instance: impl Into<String>, connection: impl Into<String>) -> Result<Self, ParseIdError> {
		let instance = instance.into();
		let connection = connection.into();
		if instance.trim().is_empty() || connection.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if instance.contains('_') {
			return Err(ParseIdError::InvalidFormat("instance id must not contain '_'".into()));
		}
		Ok(Self { instance, connection })
	}

	/// Parse a `<instance>_<connection>` pair. Splits on the first
	/// underscore, so generated connection names must never start with one.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (instance, connection) = s
			.split_once('_')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected <instance>_<connection>".into()))?;

		SessionId::new(instance, connection)
	}

	pub fn instance(&self) -> &str {
		&self.instance
	}

	pub fn connection(&self) -> &str {
		&self.connection
	}

	/// Opaque token carried in reconnect URLs, encoding this session id.
	pub fn reconnect_token(&self) -> String {
		STANDARD_NO_PAD.encode(self.to_string())
	}

	/// Decode a reconnect token back into the session id it names.
	pub fn from_reconnect_token(token: &str) -> Result<Self, ParseIdError> {
		let bytes = STANDARD_NO_PAD
			.decode(token.trim())
			.map_err(|_| ParseIdError::InvalidFormat("reconnect token is not base64".into()))?;
		let text = String::from_utf8(bytes)
			.map_err(|_| ParseIdError::InvalidFormat("reconnect token is not utf-8".into()))?;
		SessionId::parse(&text)
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}_{}", self.instance, self.connection)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SessionId::parse(s)
	}
}

/// Short random identifier used for instance ids and connection names.
/// Eight lowercase hex characters, no underscores.
pub fn short_id() -> String {
	let mut id = uuid::Uuid::new_v4().simple().to_string();
	id.truncate(8);
	id
}

/// One subscription held by the registry.
///
/// Records survive their connection: a close stamps `disconnected_at` and a
/// terminal status instead of deleting the row, so tools can inspect what a
/// dead client was subscribed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
	pub id: String,
	pub client_id: String,
	pub event_type: String,
	pub version: String,
	pub condition: serde_json::Value,
	pub status: SubscriptionStatus,
	pub created_at: DateTime<Utc>,
	pub conn_name: String,
	pub connected_at: DateTime<Utc>,
	pub disconnected_at: Option<DateTime<Utc>>,
}

impl SubscriptionRecord {
	/// True while the record still counts against the per-connection quota.
	pub fn is_live(&self) -> bool {
		self.status == SubscriptionStatus::Enabled
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transport_parse_and_display() {
		assert_eq!("websocket".parse::<TransportKind>().unwrap(), TransportKind::Websocket);
		assert_eq!("WS".parse::<TransportKind>().unwrap(), TransportKind::Websocket);
		assert_eq!("webhook".parse::<TransportKind>().unwrap(), TransportKind::Webhook);
		assert_eq!(TransportKind::Webhook.to_string(), "webhook");
		assert!("carrier-pigeon".parse::<TransportKind>().is_err());
	}

	#[test]
	fn status_strings_match_wire_values() {
		assert_eq!(SubscriptionStatus::Enabled.as_str(), "enabled");
		assert_eq!(SubscriptionStatus::WebsocketFailedPingPong.as_str(), "websocket_failed_ping_pong");
		// No websocket_ prefix on this one.
		assert_eq!(SubscriptionStatus::NetworkTimeout.as_str(), "network_timeout");
		for status in SubscriptionStatus::ALL {
			assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), *status);
		}
	}

	#[test]
	fn status_serde_uses_as_str() {
		for status in SubscriptionStatus::ALL {
			let json = serde_json::to_string(status).unwrap();
			assert_eq!(json, format!("\"{}\"", status.as_str()));
		}
	}

	#[test]
	fn revocation_covers_everything_but_enabled() {
		assert!(!SubscriptionStatus::Enabled.is_revocation());
		assert!(SubscriptionStatus::UserRemoved.is_revocation());
		assert!(SubscriptionStatus::WebsocketDisconnected.is_revocation());
	}

	#[test]
	fn close_code_roundtrip_and_derived_status() {
		for code in CloseCode::ALL {
			assert_eq!(CloseCode::from_u16(code.as_u16()), Some(*code));
		}
		assert_eq!(CloseCode::from_u16(4242), None);
		assert_eq!(CloseCode::Normal.derived_status(), SubscriptionStatus::WebsocketDisconnected);
		assert_eq!(CloseCode::NetworkTimeout.derived_status(), SubscriptionStatus::NetworkTimeout);
		// Grace expiry keeps subscriptions usable.
		assert_eq!(CloseCode::ReconnectGraceExpired.derived_status(), SubscriptionStatus::Enabled);
	}

	#[test]
	fn session_id_parse_roundtrip() {
		let sid = SessionId::parse("9a31ffcc_d27e05af").unwrap();
		assert_eq!(sid.instance(), "9a31ffcc");
		assert_eq!(sid.connection(), "d27e05af");
		assert_eq!(sid.to_string(), "9a31ffcc_d27e05af");
	}

	#[test]
	fn session_id_rejects_garbage() {
		assert!(SessionId::parse("").is_err());
		assert!(SessionId::parse("no-separator").is_err());
		assert!(SessionId::parse("_conn").is_err());
		assert!(SessionId::parse("inst_").is_err());
		assert!(SessionId::new("under_score", "conn").is_err());
	}

	#[test]
	fn reconnect_token_roundtrip() {
		let sid = SessionId::new("9a31ffcc", "d27e05af").unwrap();
		let token = sid.reconnect_token();
		assert!(!token.contains('='));
		assert_eq!(SessionId::from_reconnect_token(&token).unwrap(), sid);
	}

	#[test]
	fn reconnect_token_rejects_garbage() {
		assert!(SessionId::from_reconnect_token("!!!not-base64!!!").is_err());
		// Valid base64, but not a session id underneath.
		let token = STANDARD_NO_PAD.encode("no-separator");
		assert!(SessionId::from_reconnect_token(&token).is_err());
	}

	#[test]
	fn short_ids_are_hex_and_unique_enough() {
		let a = short_id();
		let b = short_id();
		assert_eq!(a.len(), 8);
		assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
		assert!(!a.contains('_'));
		assert_ne!(a, b);
	}
}
