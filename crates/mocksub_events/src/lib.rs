#![forbid(unsafe_code)]

//! Event generators for the mock EventSub stack.
//!
//! Every supported topic is one variant of [`Topic`]; lookup resolves the
//! short trigger names the CLI accepts, and building produces the full
//! subscription + event payload for one delivery.

use chrono::{DateTime, Utc};
use mocksub_domain::{SubscriptionStatus, TransportKind};
use mocksub_protocol::messages::{NotificationPayload, SubscriptionData, TransportData};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
	#[error("unknown trigger: {0}")]
	UnknownTrigger(String),

	#[error("topic {topic} does not support version {version}")]
	UnsupportedVersion {
		topic: &'static str,
		version: String,
	},

	#[error("topic {topic} does not support {transport} transport")]
	UnsupportedTransport {
		topic: &'static str,
		transport: TransportKind,
	},

	#[error("payload encode error: {0}")]
	Encode(String),
}

/// Parameters for one generated event. `TriggerParams::new` fills every
/// field with plausible defaults; callers pin only what they care about.
#[derive(Debug, Clone)]
pub struct TriggerParams {
	/// Doubles as the payload's subscription id and the replay-store key.
	pub event_id: String,
	pub timestamp: DateTime<Utc>,
	pub from_user_id: String,
	pub from_user_login: String,
	pub from_user_name: String,
	pub to_user_id: String,
	pub to_user_login: String,
	pub to_user_name: String,
	pub transport: TransportKind,
	/// Session the subscription descriptor points at (websocket transport).
	pub session_id: Option<String>,
	/// Callback the subscription descriptor points at (webhook transport).
	pub callback: Option<String>,
}

impl TriggerParams {
	pub fn new(transport: TransportKind) -> Self {
		Self {
			event_id: uuid::Uuid::new_v4().to_string(),
			timestamp: Utc::now(),
			from_user_id: random_user_id(),
			from_user_login: "testFromUser".to_string(),
			from_user_name: "testFromUser".to_string(),
			to_user_id: random_user_id(),
			to_user_login: "testBroadcaster".to_string(),
			to_user_name: "testBroadcaster".to_string(),
			transport,
			session_id: None,
			callback: None,
		}
	}

	fn transport_data(&self) -> TransportData {
		match self.transport {
			TransportKind::Websocket => TransportData::websocket(self.session_id.as_deref().unwrap_or("")),
			TransportKind::Webhook => TransportData::webhook(self.callback.as_deref().unwrap_or("https://localhost/webhook")),
		}
	}
}

/// Random numeric user id in the shape real user ids have.
fn random_user_id() -> String {
	let bytes = *uuid::Uuid::new_v4().as_bytes();
	let n = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
	(10_000_000 + (n % 90_000_000)).to_string()
}

/// All event topics the mock can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
	ChannelFollow,
	ChannelCheer,
	ChannelSubscribe,
	ChannelSubscriptionGift,
	ChannelSubscriptionMessage,
	ChannelRaid,
	ChannelBan,
	ChannelUnban,
	StreamOnline,
	StreamOffline,
}

impl Topic {
	pub const ALL: &'static [Topic] = &[
		Topic::ChannelFollow,
		Topic::ChannelCheer,
		Topic::ChannelSubscribe,
		Topic::ChannelSubscriptionGift,
		Topic::ChannelSubscriptionMessage,
		Topic::ChannelRaid,
		Topic::ChannelBan,
		Topic::ChannelUnban,
		Topic::StreamOnline,
		Topic::StreamOffline,
	];

	/// The EventSub subscription type string.
	pub const fn event_type(self) -> &'static str {
		match self {
			Topic::ChannelFollow => "channel.follow",
			Topic::ChannelCheer => "channel.cheer",
			Topic::ChannelSubscribe => "channel.subscribe",
			Topic::ChannelSubscriptionGift => "channel.subscription.gift",
			Topic::ChannelSubscriptionMessage => "channel.subscription.message",
			Topic::ChannelRaid => "channel.raid",
			Topic::ChannelBan => "channel.ban",
			Topic::ChannelUnban => "channel.unban",
			Topic::StreamOnline => "stream.online",
			Topic::StreamOffline => "stream.offline",
		}
	}

	/// Short trigger aliases accepted on the command line, full type
	/// included.
	pub const fn triggers(self) -> &'static [&'static str] {
		match self {
			Topic::ChannelFollow => &["follow", "channel.follow"],
			Topic::ChannelCheer => &["cheer", "channel.cheer"],
			Topic::ChannelSubscribe => &["subscribe", "channel.subscribe"],
			Topic::ChannelSubscriptionGift => &["gift", "channel.subscription.gift"],
			Topic::ChannelSubscriptionMessage => &["resubscribe", "subscribe-message", "channel.subscription.message"],
			Topic::ChannelRaid => &["raid", "channel.raid"],
			Topic::ChannelBan => &["ban", "channel.ban"],
			Topic::ChannelUnban => &["unban", "channel.unban"],
			Topic::StreamOnline => &["streamup", "stream.online"],
			Topic::StreamOffline => &["streamdown", "stream.offline"],
		}
	}

	pub const fn supported_versions(self) -> &'static [&'static str] {
		match self {
			Topic::ChannelFollow => &["1", "2"],
			_ => &["1"],
		}
	}

	pub const fn default_version(self) -> &'static str {
		match self {
			Topic::ChannelFollow => "2",
			_ => "1",
		}
	}

	pub const fn supported_transports(self) -> &'static [TransportKind] {
		// Every current topic delivers over both transports; the table is
		// still consulted so a one-transport topic is a data change.
		&[TransportKind::Websocket, TransportKind::Webhook]
	}

	/// True when the (type, version) pair names a registered generator.
	/// The subscriptions endpoint uses this to validate create requests.
	pub fn supports(event_type: &str, version: &str) -> bool {
		Topic::ALL
			.iter()
			.any(|t| t.event_type() == event_type && t.supported_versions().contains(&version))
	}

	/// Resolve a trigger alias to a topic plus an effective version.
	pub fn lookup(trigger: &str, transport: TransportKind, version: Option<&str>) -> Result<ResolvedTopic, TopicError> {
		let trigger = trigger.trim().to_ascii_lowercase();
		let topic = Topic::ALL
			.iter()
			.copied()
			.find(|t| t.triggers().iter().any(|alias| alias.eq_ignore_ascii_case(&trigger)))
			.ok_or_else(|| TopicError::UnknownTrigger(trigger.clone()))?;

		if !topic.supported_transports().contains(&transport) {
			return Err(TopicError::UnsupportedTransport {
				topic: topic.event_type(),
				transport,
			});
		}

		let version = match version {
			Some(v) => {
				if !topic.supported_versions().contains(&v) {
					return Err(TopicError::UnsupportedVersion {
						topic: topic.event_type(),
						version: v.to_string(),
					});
				}
				v.to_string()
			}
			None => topic.default_version().to_string(),
		};

		Ok(ResolvedTopic { topic, version })
	}

	fn condition(self, version: &str, params: &TriggerParams) -> Result<serde_json::Value, TopicError> {
		let broadcaster = params.to_user_id.as_str();
		match self {
			Topic::ChannelFollow if version == "2" => to_json(&ModeratedBroadcasterCondition {
				broadcaster_user_id: broadcaster,
				moderator_user_id: broadcaster,
			}),
			Topic::ChannelRaid => to_json(&RaidToCondition {
				to_broadcaster_user_id: broadcaster,
			}),
			_ => to_json(&BroadcasterCondition {
				broadcaster_user_id: broadcaster,
			}),
		}
	}

	fn event_body(self, _version: &str, params: &TriggerParams) -> Result<serde_json::Value, TopicError> {
		let user = UserFields {
			user_id: &params.from_user_id,
			user_login: &params.from_user_login,
			user_name: &params.from_user_name,
		};
		let broadcaster = BroadcasterFields {
			broadcaster_user_id: &params.to_user_id,
			broadcaster_user_login: &params.to_user_login,
			broadcaster_user_name: &params.to_user_name,
		};

		match self {
			Topic::ChannelFollow => to_json(&FollowEvent {
				user,
				broadcaster,
				followed_at: params.timestamp,
			}),
			Topic::ChannelCheer => to_json(&CheerEvent {
				is_anonymous: false,
				user,
				broadcaster,
				message: "cheer100",
				bits: 100,
			}),
			Topic::ChannelSubscribe => to_json(&SubscribeEvent {
				user,
				broadcaster,
				tier: "1000",
				is_gift: false,
			}),
			Topic::ChannelSubscriptionGift => to_json(&SubscriptionGiftEvent {
				user,
				broadcaster,
				total: 2,
				tier: "1000",
				cumulative_total: Some(284),
				is_anonymous: false,
			}),
			Topic::ChannelSubscriptionMessage => to_json(&SubscriptionMessageEvent {
				user,
				broadcaster,
				tier: "1000",
				message: SubscriptionChatMessage {
					text: "Ten months, let's go!",
					emotes: &[],
				},
				cumulative_months: 10,
				streak_months: Some(10),
				duration_months: 1,
			}),
			Topic::ChannelRaid => to_json(&RaidEvent {
				from_broadcaster_user_id: &params.from_user_id,
				from_broadcaster_user_login: &params.from_user_login,
				from_broadcaster_user_name: &params.from_user_name,
				to_broadcaster_user_id: &params.to_user_id,
				to_broadcaster_user_login: &params.to_user_login,
				to_broadcaster_user_name: &params.to_user_name,
				viewers: 127,
			}),
			Topic::ChannelBan => to_json(&BanEvent {
				user,
				broadcaster,
				moderator_user_id: &params.to_user_id,
				moderator_user_login: &params.to_user_login,
				moderator_user_name: &params.to_user_name,
				reason: "This was a test ban",
				banned_at: params.timestamp,
				ends_at: None,
				is_permanent: true,
			}),
			Topic::ChannelUnban => to_json(&UnbanEvent {
				user,
				broadcaster,
				moderator_user_id: &params.to_user_id,
				moderator_user_login: &params.to_user_login,
				moderator_user_name: &params.to_user_name,
			}),
			Topic::StreamOnline => to_json(&StreamOnlineEvent {
				id: &params.event_id,
				broadcaster,
				kind: "live",
				started_at: params.timestamp,
			}),
			Topic::StreamOffline => to_json(&StreamOfflineEvent { broadcaster }),
		}
	}
}

/// A topic pinned to one concrete version, ready to build payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTopic {
	pub topic: Topic,
	pub version: String,
}

impl ResolvedTopic {
	/// Produce a full subscription + event payload for one delivery.
	pub fn build(&self, params: &TriggerParams) -> Result<NotificationPayload, TopicError> {
		let condition = self.topic.condition(&self.version, params)?;
		let event = self.topic.event_body(&self.version, params)?;

		Ok(NotificationPayload {
			subscription: SubscriptionData {
				id: params.event_id.clone(),
				status: SubscriptionStatus::Enabled,
				event_type: self.topic.event_type().to_string(),
				version: self.version.clone(),
				condition,
				transport: params.transport_data(),
				created_at: params.timestamp,
				cost: 0,
			},
			event: Some(event),
		})
	}
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, TopicError> {
	serde_json::to_value(value).map_err(|e| TopicError::Encode(e.to_string()))
}

#[derive(Serialize)]
struct BroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Serialize)]
struct ModeratedBroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
	moderator_user_id: &'a str,
}

#[derive(Serialize)]
struct RaidToCondition<'a> {
	to_broadcaster_user_id: &'a str,
}

#[derive(Serialize, Clone, Copy)]
struct UserFields<'a> {
	user_id: &'a str,
	user_login: &'a str,
	user_name: &'a str,
}

#[derive(Serialize, Clone, Copy)]
struct BroadcasterFields<'a> {
	broadcaster_user_id: &'a str,
	broadcaster_user_login: &'a str,
	broadcaster_user_name: &'a str,
}

#[derive(Serialize)]
struct FollowEvent<'a> {
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	followed_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct CheerEvent<'a> {
	is_anonymous: bool,
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	message: &'a str,
	bits: u64,
}

#[derive(Serialize)]
struct SubscribeEvent<'a> {
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	tier: &'a str,
	is_gift: bool,
}

#[derive(Serialize)]
struct SubscriptionGiftEvent<'a> {
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	total: u32,
	tier: &'a str,
	cumulative_total: Option<u32>,
	is_anonymous: bool,
}

#[derive(Serialize)]
struct SubscriptionChatMessage<'a> {
	text: &'a str,
	emotes: &'a [serde_json::Value],
}

#[derive(Serialize)]
struct SubscriptionMessageEvent<'a> {
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	tier: &'a str,
	message: SubscriptionChatMessage<'a>,
	cumulative_months: u32,
	streak_months: Option<u32>,
	duration_months: u32,
}

#[derive(Serialize)]
struct RaidEvent<'a> {
	from_broadcaster_user_id: &'a str,
	from_broadcaster_user_login: &'a str,
	from_broadcaster_user_name: &'a str,
	to_broadcaster_user_id: &'a str,
	to_broadcaster_user_login: &'a str,
	to_broadcaster_user_name: &'a str,
	viewers: u32,
}

#[derive(Serialize)]
struct BanEvent<'a> {
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	moderator_user_id: &'a str,
	moderator_user_login: &'a str,
	moderator_user_name: &'a str,
	reason: &'a str,
	banned_at: DateTime<Utc>,
	ends_at: Option<DateTime<Utc>>,
	is_permanent: bool,
}

#[derive(Serialize)]
struct UnbanEvent<'a> {
	#[serde(flatten)]
	user: UserFields<'a>,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	moderator_user_id: &'a str,
	moderator_user_login: &'a str,
	moderator_user_name: &'a str,
}

#[derive(Serialize)]
struct StreamOnlineEvent<'a> {
	id: &'a str,
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
	#[serde(rename = "type")]
	kind: &'a str,
	started_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct StreamOfflineEvent<'a> {
	#[serde(flatten)]
	broadcaster: BroadcasterFields<'a>,
}
