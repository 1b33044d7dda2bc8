#![forbid(unsafe_code)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mocksub_domain::{MAX_SUBSCRIPTIONS_PER_CONNECTION, SubscriptionRecord, SubscriptionStatus};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("subscription already exists for this client, type and version on connection {conn}")]
	Duplicate { conn: String },
	#[error("connection {conn} already holds {max} subscriptions")]
	QuotaExceeded { conn: String, max: usize },
}

/// Subscription store of one protocol server instance.
///
/// Records are keyed by subscription id and scanned linearly; the quota caps
/// any one connection at 100 records, which keeps scans trivial. Closing a
/// connection never deletes records, it only rewrites their status, so the
/// registry doubles as a post-mortem view of dead clients.
#[derive(Default)]
pub struct Registry {
	records: Mutex<HashMap<String, SubscriptionRecord>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create an `enabled` subscription for a connection, enforcing the
	/// per-connection quota and the (client, type, version) uniqueness rule.
	pub fn create(
		&self,
		client_id: &str,
		event_type: &str,
		version: &str,
		condition: serde_json::Value,
		conn_name: &str,
		connected_at: DateTime<Utc>,
	) -> Result<SubscriptionRecord, RegistryError> {
		let mut records = self.records.lock();

		let mut held = 0usize;
		for record in records.values() {
			if record.conn_name != conn_name {
				continue;
			}
			held += 1;
			if record.client_id == client_id && record.event_type == event_type && record.version == version {
				return Err(RegistryError::Duplicate {
					conn: conn_name.to_string(),
				});
			}
		}
		if held >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
			return Err(RegistryError::QuotaExceeded {
				conn: conn_name.to_string(),
				max: MAX_SUBSCRIPTIONS_PER_CONNECTION,
			});
		}

		let record = SubscriptionRecord {
			id: uuid::Uuid::new_v4().to_string(),
			client_id: client_id.to_string(),
			event_type: event_type.to_string(),
			version: version.to_string(),
			condition,
			status: SubscriptionStatus::Enabled,
			created_at: Utc::now(),
			conn_name: conn_name.to_string(),
			connected_at,
			disconnected_at: None,
		};
		records.insert(record.id.clone(), record.clone());
		Ok(record)
	}

	/// All records owned by `client_id`, or every record when `include_all`
	/// (the admin identity). Sorted by creation time for stable listings.
	pub fn list(&self, client_id: &str, include_all: bool) -> Vec<SubscriptionRecord> {
		let records = self.records.lock();
		let mut out: Vec<SubscriptionRecord> = records
			.values()
			.filter(|r| include_all || r.client_id == client_id)
			.cloned()
			.collect();
		out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
		out
	}

	/// Remove by id. Returns whether the record existed.
	pub fn delete(&self, id: &str) -> bool {
		self.records.lock().remove(id).is_some()
	}

	/// Override one record's status. Returns whether the record existed.
	pub fn set_status(&self, id: &str, status: SubscriptionStatus) -> bool {
		let mut records = self.records.lock();
		match records.get_mut(id) {
			Some(record) => {
				debug!(subscription = %id, status = %status, "subscription status overridden");
				record.status = status;
				true
			}
			None => false,
		}
	}

	/// Flip every still-enabled record of a closing connection to the status
	/// derived from its close code and stamp the disconnect time.
	pub fn mark_closed(&self, conn_name: &str, derived: SubscriptionStatus) {
		let now = Utc::now();
		let mut records = self.records.lock();
		for record in records.values_mut() {
			if record.conn_name == conn_name && record.status == SubscriptionStatus::Enabled {
				record.status = derived;
				record.disconnected_at = Some(now);
			}
		}
	}

	pub fn count_for_connection(&self, conn_name: &str) -> usize {
		self.records.lock().values().filter(|r| r.conn_name == conn_name).count()
	}

	pub fn records_for_connection(&self, conn_name: &str) -> Vec<SubscriptionRecord> {
		self.records
			.lock()
			.values()
			.filter(|r| r.conn_name == conn_name)
			.cloned()
			.collect()
	}

	/// The enabled record a forwarded event should be delivered under for
	/// this connection, if any.
	pub fn find_for_receiver(&self, conn_name: &str, event_type: &str, version: &str) -> Option<SubscriptionRecord> {
		self.records
			.lock()
			.values()
			.find(|r| {
				r.conn_name == conn_name && r.is_live() && r.event_type == event_type && r.version == version
			})
			.cloned()
	}

	/// Every record, grouped by owning connection name. Handoff snapshots are
	/// built from this.
	pub fn group_by_connection(&self) -> HashMap<String, Vec<SubscriptionRecord>> {
		let records = self.records.lock();
		let mut grouped: HashMap<String, Vec<SubscriptionRecord>> = HashMap::new();
		for record in records.values() {
			grouped.entry(record.conn_name.clone()).or_default().push(record.clone());
		}
		grouped
	}

	/// Insert carried-over records as-is (ids and statuses preserved).
	pub fn adopt(&self, carried: Vec<SubscriptionRecord>) {
		let mut records = self.records.lock();
		for record in carried {
			records.insert(record.id.clone(), record);
		}
	}
}
