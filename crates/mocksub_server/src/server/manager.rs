#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use mocksub_domain::{CloseCode, SubscriptionStatus};
use mocksub_protocol::messages::NotificationPayload;
use parking_lot::Mutex;
use tracing::info;

use crate::config::ServerTiming;
use crate::server::instance::{ForwardError, Instance};
use crate::util::endpoint::WsEndpoint;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
	pub public_endpoint: WsEndpoint,
	pub timing: ServerTiming,
	pub strict_subscriptions: bool,
	pub admin_client_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
	#[error("a reconnect handoff is already in progress")]
	AlreadyInProgress,
}

struct ManagerInner {
	instances: HashMap<String, Arc<Instance>>,
	primary: Arc<Instance>,
	handoff_in_progress: bool,
}

/// Routes every operation to the current primary instance and runs the
/// reconnect handoff that replaces it.
pub struct Manager {
	inner: Mutex<ManagerInner>,
	settings: ManagerSettings,
}

impl Manager {
	pub fn new(settings: ManagerSettings) -> Arc<Self> {
		let first = Instance::new(settings.timing, settings.strict_subscriptions);
		let mut instances = HashMap::new();
		instances.insert(first.id().to_string(), Arc::clone(&first));
		info!(instance = %first.id(), "primary instance online");

		Arc::new(Self {
			inner: Mutex::new(ManagerInner {
				instances,
				primary: first,
				handoff_in_progress: false,
			}),
			settings,
		})
	}

	pub fn settings(&self) -> &ManagerSettings {
		&self.settings
	}

	pub fn primary(&self) -> Arc<Instance> {
		Arc::clone(&self.inner.lock().primary)
	}

	pub fn instance_count(&self) -> usize {
		self.inner.lock().instances.len()
	}

	pub fn handoff_in_progress(&self) -> bool {
		self.inner.lock().handoff_in_progress
	}

	/// Swap in a fresh primary and drain the old one in the background.
	///
	/// The swap happens before any client is told to move, so new websocket
	/// upgrades land on the replacement from the first moment of the handoff.
	/// Old connections keep their subscriptions through carry-over bundles
	/// and get the full grace window to redeem them. Returns the replacement
	/// instance's id.
	pub fn start_reconnect(self: &Arc<Self>) -> Result<String, ManagerError> {
		let old = {
			let mut inner = self.inner.lock();
			if inner.handoff_in_progress {
				return Err(ManagerError::AlreadyInProgress);
			}
			inner.handoff_in_progress = true;
			Arc::clone(&inner.primary)
		};

		let replacement = Instance::with_carry_over(
			self.settings.timing,
			self.settings.strict_subscriptions,
			old.carry_over_snapshot(),
		);
		let new_id = replacement.id().to_string();

		{
			let mut inner = self.inner.lock();
			inner.instances.insert(new_id.clone(), Arc::clone(&replacement));
			inner.primary = replacement;
		}
		info!(old = %old.id(), new = %new_id, "reconnect handoff started");
		metrics::counter!("mocksub_reconnect_handoffs_total").increment(1);

		let manager = Arc::clone(self);
		let reconnect_url = self.settings.public_endpoint.ws_url("ws");
		tokio::spawn(async move {
			old.drain(&reconnect_url).await;
			tokio::time::sleep(manager.settings.timing.reconnect_grace).await;
			old.force_close_all().await;

			let mut inner = manager.inner.lock();
			inner.instances.remove(old.id());
			inner.handoff_in_progress = false;
			info!(instance = %old.id(), "drained instance removed");
		});

		Ok(new_id)
	}

	pub async fn forward_event(&self, scope: Option<&str>, payload: &NotificationPayload) -> Result<usize, ForwardError> {
		self.primary().forward_event(scope, payload).await
	}

	pub async fn close_connection(&self, name: &str, code: CloseCode) -> bool {
		self.primary().close_connection(name, code).await
	}

	pub fn set_subscription_status(&self, id: &str, status: SubscriptionStatus) -> bool {
		self.primary().registry.set_status(id, status)
	}
}
