#![forbid(unsafe_code)]

//! Replay store for triggered events.
//!
//! Every generated event is written to `~/.mocksub/events.json` so
//! `retrigger --id <event-id>` can resend it later. The file is a plain
//! JSON list ordered oldest first; a missing or corrupt file reads as
//! empty rather than failing the trigger.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mocksub_protocol::messages::NotificationPayload;
use serde::{Deserialize, Serialize};

/// Events kept per store file. Inserting beyond this drops the oldest.
pub const MAX_STORED_EVENTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
	/// Matches the payload's subscription id; the `retrigger --id` key.
	pub event_id: String,
	/// Trigger alias the event was generated from.
	pub trigger: String,
	pub version: String,
	pub stored_at: DateTime<Utc>,
	pub payload: NotificationPayload,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
	events: Vec<StoredEvent>,
}

pub struct EventStore {
	path: PathBuf,
}

impl EventStore {
	pub fn at(path: PathBuf) -> Self {
		Self { path }
	}

	/// Store under the invoking user's home directory.
	pub fn open_default() -> anyhow::Result<Self> {
		let home = dirs::home_dir().context("cannot determine home directory for the event store")?;
		Ok(Self::at(home.join(".mocksub").join("events.json")))
	}

	/// Insert or refresh one event. An existing entry with the same id is
	/// replaced and moved to the newest position.
	pub fn insert(&self, event: StoredEvent) -> anyhow::Result<()> {
		let mut file = self.read_file();
		file.events.retain(|e| e.event_id != event.event_id);
		file.events.push(event);
		if file.events.len() > MAX_STORED_EVENTS {
			let excess = file.events.len() - MAX_STORED_EVENTS;
			file.events.drain(..excess);
		}
		self.write_file(&file)
	}

	pub fn get(&self, event_id: &str) -> Option<StoredEvent> {
		self.read_file().events.into_iter().find(|e| e.event_id == event_id)
	}

	fn read_file(&self) -> StoreFile {
		let Ok(raw) = std::fs::read_to_string(&self.path) else {
			return StoreFile::default();
		};
		serde_json::from_str(&raw).unwrap_or_default()
	}

	fn write_file(&self, file: &StoreFile) -> anyhow::Result<()> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
		}
		let raw = serde_json::to_string_pretty(file).context("encoding event store")?;
		std::fs::write(&self.path, raw).with_context(|| format!("writing {}", self.path.display()))
	}
}

#[cfg(test)]
mod tests {
	use mocksub_domain::TransportKind;
	use mocksub_events::{Topic, TriggerParams};

	use super::*;

	fn temp_store() -> EventStore {
		let path = std::env::temp_dir().join(format!("mocksub-store-{}.json", uuid::Uuid::new_v4()));
		EventStore::at(path)
	}

	fn stored(id: &str) -> StoredEvent {
		let resolved = Topic::lookup("follow", TransportKind::Websocket, None).unwrap();
		let mut params = TriggerParams::new(TransportKind::Websocket);
		params.event_id = id.to_string();
		let payload = resolved.build(&params).unwrap();
		StoredEvent {
			event_id: id.to_string(),
			trigger: "follow".to_string(),
			version: resolved.version.clone(),
			stored_at: Utc::now(),
			payload,
		}
	}

	#[test]
	fn insert_then_get_round_trips_through_the_file() {
		let store = temp_store();
		store.insert(stored("evt-1")).unwrap();

		let back = store.get("evt-1").unwrap();
		assert_eq!(back.trigger, "follow");
		assert_eq!(back.payload.subscription.id, "evt-1");
		assert!(store.get("evt-2").is_none());

		let _ = std::fs::remove_file(&store.path);
	}

	#[test]
	fn pruning_keeps_the_newest_entries() {
		let store = temp_store();
		for i in 0..(MAX_STORED_EVENTS + 5) {
			store.insert(stored(&format!("evt-{i}"))).unwrap();
		}

		assert!(store.get("evt-0").is_none());
		assert!(store.get("evt-4").is_none());
		assert!(store.get("evt-5").is_some());
		assert!(store.get(&format!("evt-{}", MAX_STORED_EVENTS + 4)).is_some());

		let _ = std::fs::remove_file(&store.path);
	}

	#[test]
	fn reinserting_an_id_replaces_instead_of_duplicating() {
		let store = temp_store();
		store.insert(stored("evt-1")).unwrap();
		let mut updated = stored("evt-1");
		updated.trigger = "cheer".to_string();
		store.insert(updated).unwrap();

		let back = store.get("evt-1").unwrap();
		assert_eq!(back.trigger, "cheer");

		let _ = std::fs::remove_file(&store.path);
	}

	#[test]
	fn corrupt_or_missing_files_read_as_empty() {
		let store = temp_store();
		assert!(store.get("anything").is_none());

		std::fs::write(&store.path, "{ not json").unwrap();
		assert!(store.get("anything").is_none());
		store.insert(stored("evt-1")).unwrap();
		assert!(store.get("evt-1").is_some());

		let _ = std::fs::remove_file(&store.path);
	}
}
