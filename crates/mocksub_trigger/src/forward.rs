#![forbid(unsafe_code)]

//! Webhook delivery for generated events.
//!
//! Sends the same payload the websocket path would wrap in a notification
//! message, but as an HTTP POST with the `Twitch-Eventsub-*` headers a real
//! webhook receiver expects, including an HMAC signature it can verify.

use anyhow::{Context, anyhow};
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use mocksub_protocol::messages::NotificationPayload;
use sha2::Sha256;

pub struct WebhookForwarder {
	client: reqwest::Client,
}

impl WebhookForwarder {
	pub fn new() -> Self {
		Self {
			client: reqwest::Client::new(),
		}
	}

	/// POST one event to `address`. With a secret the request carries a
	/// `Twitch-Eventsub-Message-Signature` over message id, timestamp and
	/// body, in that order.
	pub async fn forward(&self, address: &str, secret: Option<&str>, payload: &NotificationPayload) -> anyhow::Result<()> {
		let url = reqwest::Url::parse(address).with_context(|| format!("invalid forward address: {address}"))?;

		let message_id = uuid::Uuid::new_v4().to_string();
		let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
		let body = serde_json::to_string(payload).context("encoding event payload")?;

		let mut request = self
			.client
			.post(url)
			.header("Content-Type", "application/json")
			.header("Twitch-Eventsub-Message-Id", &message_id)
			.header("Twitch-Eventsub-Message-Type", "notification")
			.header("Twitch-Eventsub-Message-Timestamp", &timestamp)
			.header("Twitch-Eventsub-Message-Retry", "0")
			.header("Twitch-Eventsub-Subscription-Type", payload.subscription.event_type.as_str())
			.header("Twitch-Eventsub-Subscription-Version", payload.subscription.version.as_str());
		if let Some(secret) = secret {
			let signature = sign_payload(secret.as_bytes(), &message_id, &timestamp, body.as_bytes());
			request = request.header("Twitch-Eventsub-Message-Signature", signature);
		}

		let resp = request
			.body(body)
			.send()
			.await
			.with_context(|| format!("posting event to {address}"))?;

		match resp.status() {
			status if status.is_success() => Ok(()),
			status => Err(anyhow!("webhook at {address} answered status={status}")),
		}
	}
}

impl Default for WebhookForwarder {
	fn default() -> Self {
		Self::new()
	}
}

/// HMAC-SHA256 over `message_id || timestamp || body`, rendered as
/// `sha256=<lowercase hex>`.
pub fn sign_payload(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> String {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	let digest = mac.finalize().into_bytes();
	let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
	format!("sha256={hex}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_matches_the_rfc4231_test_vector() {
		// HMAC-SHA256 test case 1: key = 20 x 0x0b, data = "Hi There".
		let signature = sign_payload(&[0x0b; 20], "Hi ", "There", b"");
		assert_eq!(signature, "sha256=b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7");
	}

	#[test]
	fn signature_depends_on_every_input() {
		let base = sign_payload(b"s3cret", "id", "ts", b"body");
		assert_eq!(base, sign_payload(b"s3cret", "id", "ts", b"body"));
		assert_ne!(base, sign_payload(b"other", "id", "ts", b"body"));
		assert_ne!(base, sign_payload(b"s3cret", "id2", "ts", b"body"));
		assert_ne!(base, sign_payload(b"s3cret", "id", "ts2", b"body"));
		assert_ne!(base, sign_payload(b"s3cret", "id", "ts", b"body2"));
	}

	#[tokio::test]
	async fn rejects_an_unparsable_forward_address() {
		use mocksub_domain::TransportKind;
		use mocksub_events::{Topic, TriggerParams};

		let resolved = Topic::lookup("follow", TransportKind::Webhook, None).unwrap();
		let payload = resolved.build(&TriggerParams::new(TransportKind::Webhook)).unwrap();

		let err = WebhookForwarder::new()
			.forward("not a url", None, &payload)
			.await
			.unwrap_err();
		assert!(err.to_string().contains("invalid forward address"));
	}
}
