#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use mocksub_domain::{CloseCode, SessionId, SubscriptionRecord, TransportKind, short_id};
use mocksub_protocol::messages::{
	KeepaliveMessage, NotificationMessage, NotificationPayload, SessionMessage, SubscriptionData, TransportData,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as FrameCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, info, warn};

use crate::config::ServerTiming;
use crate::server::connection::{Connection, WsReader, WsStream};
use crate::server::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
	Online,
	Draining,
	Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
	#[error("unknown connection: {0}")]
	UnknownConnection(String),
	#[error("event was not delivered to any connection")]
	NoReceivers,
}

/// One logical edge server: a set of connections plus their subscriptions.
///
/// Multiple instances exist only transiently, while a reconnect handoff
/// drains the previous one. Connections are owned exclusively by their
/// instance and keyed by connection name; the registry references them by
/// name only, never by handle.
pub struct Instance {
	id: String,
	status: Mutex<InstanceStatus>,
	connections: Mutex<HashMap<String, Arc<Connection>>>,
	pub registry: Registry,
	// Handoff bundles keyed by the previous instance's session id string,
	// consumed at most once per reconnecting client.
	carry_over: Mutex<HashMap<String, Vec<SubscriptionRecord>>>,
	timing: ServerTiming,
	strict: bool,
}

impl Instance {
	pub fn new(timing: ServerTiming, strict: bool) -> Arc<Self> {
		Self::with_carry_over(timing, strict, HashMap::new())
	}

	/// Instance seeded with carry-over bundles, as created by a handoff.
	pub fn with_carry_over(
		timing: ServerTiming,
		strict: bool,
		carry_over: HashMap<String, Vec<SubscriptionRecord>>,
	) -> Arc<Self> {
		Arc::new(Self {
			id: short_id(),
			status: Mutex::new(InstanceStatus::Online),
			connections: Mutex::new(HashMap::new()),
			registry: Registry::new(),
			carry_over: Mutex::new(carry_over),
			timing,
			strict,
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn status(&self) -> InstanceStatus {
		*self.status.lock()
	}

	fn set_status(&self, status: InstanceStatus) {
		*self.status.lock() = status;
	}

	pub fn timing(&self) -> &ServerTiming {
		&self.timing
	}

	pub fn strict(&self) -> bool {
		self.strict
	}

	pub fn connection_count(&self) -> usize {
		self.connections.lock().len()
	}

	pub fn has_connection(&self, name: &str) -> bool {
		self.connections.lock().contains_key(name)
	}

	pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
		self.connections.lock().get(name).cloned()
	}

	/// Close one connection: cancel its timers, send a best-effort close
	/// frame and flip its still-enabled subscriptions to the derived status.
	/// The map removal doubles as the idempotency gate, so a second close of
	/// the same name is a no-op.
	pub async fn close_connection(&self, name: &str, code: CloseCode) -> bool {
		let conn = { self.connections.lock().remove(name) };
		let Some(conn) = conn else {
			return false;
		};

		conn.cancel_timers();
		let _ = conn.close_with_reason(code).await;
		self.registry.mark_closed(name, code.derived_status());
		info!(conn = %name, code = %code, "connection closed");
		metrics::counter!("mocksub_connections_closed_total").increment(1);
		true
	}

	/// Deliver a forwarded event to the scoped connection, or to every
	/// connection. Each receiver gets the payload rewritten onto its own
	/// matching subscription so ids and session ids are the receiver's; a
	/// revocation status turns the message into a `revocation` and flips the
	/// receiver's registry record.
	pub async fn forward_event(&self, scope: Option<&str>, incoming: &NotificationPayload) -> Result<usize, ForwardError> {
		let targets: Vec<Arc<Connection>> = {
			let conns = self.connections.lock();
			match scope {
				Some(name) => match conns.get(name) {
					Some(conn) => vec![Arc::clone(conn)],
					None => return Err(ForwardError::UnknownConnection(name.to_string())),
				},
				None => conns.values().cloned().collect(),
			}
		};

		let event_type = incoming.subscription.event_type.as_str();
		let version = incoming.subscription.version.as_str();
		let revocation = incoming.subscription.status.is_revocation();

		let mut delivered = 0usize;
		for conn in targets {
			let matched = self.registry.find_for_receiver(conn.name(), event_type, version);
			if matched.is_none() && self.strict {
				debug!(conn = %conn.name(), event_type, "no matching enabled subscription; skipping receiver");
				continue;
			}

			let session_id = conn.session().to_string();
			let subscription = match matched {
				Some(mut record) => {
					if revocation {
						record.status = incoming.subscription.status;
						self.registry.set_status(&record.id, record.status);
					}
					SubscriptionData::from_record(&record, &session_id)
				}
				None => {
					// Nothing registered here; deliver the payload as-is with
					// the transport rewritten to the receiving session.
					let mut data = incoming.subscription.clone();
					data.transport = TransportData {
						method: TransportKind::Websocket,
						session_id: Some(session_id),
						callback: None,
						connected_at: Some(conn.connected_at),
						disconnected_at: None,
					};
					data
				}
			};

			let message = if revocation {
				NotificationMessage::revocation(subscription)
			} else {
				NotificationMessage::notification(NotificationPayload {
					subscription,
					event: incoming.event.clone(),
				})
			};

			if conn.send_json(&message).await.is_ok() {
				delivered += 1;
			} else {
				warn!(conn = %conn.name(), "event delivery failed; closing connection");
				self.close_connection(conn.name(), CloseCode::NetworkError).await;
			}
		}

		if delivered == 0 {
			return Err(ForwardError::NoReceivers);
		}
		if revocation {
			metrics::counter!("mocksub_revocations_sent_total").increment(delivered as u64);
		} else {
			metrics::counter!("mocksub_notifications_sent_total").increment(delivered as u64);
		}
		Ok(delivered)
	}

	/// Snapshot every subscription into handoff bundles keyed by this
	/// instance's session ids.
	pub fn carry_over_snapshot(&self) -> HashMap<String, Vec<SubscriptionRecord>> {
		self.registry
			.group_by_connection()
			.into_iter()
			.map(|(conn_name, records)| (format!("{}_{conn_name}", self.id), records))
			.collect()
	}

	/// Claim the carry-over bundle a reconnect token names and re-home its
	/// records onto the given connection. Bad or unknown tokens are ignored;
	/// the connection simply proceeds as brand-new. Returns how many records
	/// were restored.
	pub(crate) fn adopt_reconnect_token(&self, token: &str, conn_name: &str, connected_at: DateTime<Utc>) -> usize {
		let old_session = match SessionId::from_reconnect_token(token) {
			Ok(session) => session,
			Err(e) => {
				debug!(error = %e, "ignoring malformed reconnect token");
				return 0;
			}
		};

		let bundle = { self.carry_over.lock().remove(&old_session.to_string()) };
		let Some(mut records) = bundle else {
			debug!(session = %old_session, "reconnect token names no carry-over bundle; ignoring");
			return 0;
		};

		let count = records.len();
		for record in &mut records {
			record.conn_name = conn_name.to_string();
			record.connected_at = connected_at;
			record.disconnected_at = None;
		}
		self.registry.adopt(records);
		count
	}

	/// Stop accepting and tell every client to move: cancel keepalive and
	/// must-subscribe timers (pings keep flowing so sockets stay verifiably
	/// alive) and send `session_reconnect` with a carry-over token.
	pub async fn drain(&self, reconnect_base_url: &str) {
		self.set_status(InstanceStatus::Draining);

		let conns: Vec<Arc<Connection>> = self.connections.lock().values().cloned().collect();
		info!(instance = %self.id, connections = conns.len(), "draining instance");

		for conn in conns {
			conn.keepalive_cancel.cancel();
			conn.must_subscribe_cancel.cancel();

			let token = conn.session().reconnect_token();
			let reconnect_url = format!("{reconnect_base_url}?reconnect_id={token}");
			let message = SessionMessage::reconnect(&conn.session().to_string(), conn.connected_at, reconnect_url);
			if conn.send_json(&message).await.is_err() {
				warn!(conn = %conn.name(), "reconnect notice failed; closing connection");
				self.close_connection(conn.name(), CloseCode::NetworkError).await;
			}
		}
	}

	/// End of the grace window: force-close every straggler with 4004. That
	/// code derives back to `enabled`, because the subscriptions were already
	/// promised to the replacement instance.
	pub async fn force_close_all(&self) {
		self.set_status(InstanceStatus::Stopped);

		let names: Vec<String> = self.connections.lock().keys().cloned().collect();
		for name in names {
			self.close_connection(&name, CloseCode::ReconnectGraceExpired).await;
		}
		info!(instance = %self.id, "instance stopped");
	}
}

/// Drive one upgraded websocket for its whole life. Everything here is
/// internal: failures become close codes and derived statuses, never errors
/// to a caller.
pub async fn run_connection(instance: Arc<Instance>, mut ws: WsStream, reconnect_token: Option<String>) {
	// A draining or stopped instance never registers new connections, the
	// same way a load balancer would stop routing to it.
	if instance.status() != InstanceStatus::Online {
		debug!(instance = %instance.id(), status = ?instance.status(), "refusing connection; instance is not online");
		let frame = CloseFrame {
			code: FrameCloseCode::from(CloseCode::InternalError.as_u16()),
			reason: CloseCode::InternalError.reason_text().into(),
		};
		let _ = ws.send(Message::Close(Some(frame))).await;
		return;
	}

	let session = match SessionId::new(instance.id(), short_id()) {
		Ok(session) => session,
		Err(e) => {
			warn!(error = %e, "could not mint a session id; dropping connection");
			let frame = CloseFrame {
				code: FrameCloseCode::from(CloseCode::InternalError.as_u16()),
				reason: CloseCode::InternalError.reason_text().into(),
			};
			let _ = ws.send(Message::Close(Some(frame))).await;
			return;
		}
	};
	let connected_at = Utc::now();

	let (writer, reader) = ws.split();
	let conn = Arc::new(Connection::new(session, connected_at, writer));

	if let Some(token) = reconnect_token.as_deref() {
		let adopted = instance.adopt_reconnect_token(token, conn.name(), connected_at);
		if adopted > 0 {
			info!(conn = %conn.name(), count = adopted, "restored carried-over subscriptions");
		}
	}

	{
		let mut conns = instance.connections.lock();
		conns.insert(conn.name().to_string(), Arc::clone(&conn));
	}
	metrics::counter!("mocksub_connections_total").increment(1);
	info!(session = %conn.session(), "websocket client connected");

	let keepalive_secs = instance.timing.keepalive_interval.as_secs();
	let welcome = SessionMessage::welcome(&conn.session().to_string(), connected_at, keepalive_secs);
	if conn.send_json(&welcome).await.is_err() {
		instance.close_connection(conn.name(), CloseCode::NetworkError).await;
		return;
	}

	spawn_keepalive(&instance, &conn);
	spawn_ping(&instance, &conn);
	if instance.strict {
		spawn_must_subscribe(&instance, &conn);
	}

	read_loop(instance, conn, reader).await;
}

fn spawn_keepalive(instance: &Arc<Instance>, conn: &Arc<Connection>) {
	let mut cancel = conn.keepalive_cancel.arm();
	let instance = Arc::clone(instance);
	let conn = Arc::clone(conn);
	tokio::spawn(async move {
		let period = instance.timing.keepalive_interval;
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		loop {
			tokio::select! {
				_ = &mut cancel => return,
				_ = ticker.tick() => {
					if conn.send_json(&KeepaliveMessage::new()).await.is_err() {
						warn!(conn = %conn.name(), "keepalive send failed; closing connection");
						instance.close_connection(conn.name(), CloseCode::NetworkError).await;
						return;
					}
					debug!(conn = %conn.name(), "keepalive sent");
				}
			}
		}
	});
}

fn spawn_ping(instance: &Arc<Instance>, conn: &Arc<Connection>) {
	let mut cancel = conn.ping_cancel.arm();
	let instance = Arc::clone(instance);
	let conn = Arc::clone(conn);
	tokio::spawn(async move {
		let period = instance.timing.ping_interval;
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		loop {
			tokio::select! {
				_ = &mut cancel => return,
				_ = ticker.tick() => {
					if conn.send_ping().await.is_err() {
						warn!(conn = %conn.name(), "ping send failed; closing connection");
						instance.close_connection(conn.name(), CloseCode::FailedPingPong).await;
						return;
					}
				}
			}
		}
	});
}

fn spawn_must_subscribe(instance: &Arc<Instance>, conn: &Arc<Connection>) {
	let mut cancel = conn.must_subscribe_cancel.arm();
	let instance = Arc::clone(instance);
	let conn = Arc::clone(conn);
	tokio::spawn(async move {
		let window = instance.timing.must_subscribe_window;
		tokio::select! {
			_ = &mut cancel => {}
			_ = tokio::time::sleep(window) => {
				if instance.registry.count_for_connection(conn.name()) == 0 {
					info!(conn = %conn.name(), "no subscription within the must-subscribe window; closing");
					instance.close_connection(conn.name(), CloseCode::ConnectionUnused).await;
				}
			}
		}
	});
}

async fn read_loop(instance: Arc<Instance>, conn: Arc<Connection>, mut reader: WsReader) {
	let timeout = instance.timing.inactivity_timeout;
	let mut deadline = Instant::now() + timeout;

	loop {
		tokio::select! {
			_ = tokio::time::sleep_until(deadline) => {
				if !instance.has_connection(conn.name()) {
					// Closed elsewhere; the read half just needed to notice.
					return;
				}
				info!(conn = %conn.name(), "inactivity deadline expired; closing connection");
				instance.close_connection(conn.name(), CloseCode::NetworkTimeout).await;
				return;
			}
			frame = reader.next() => {
				if !instance.has_connection(conn.name()) {
					return;
				}
				match frame {
					Some(Ok(message)) => {
						deadline = Instant::now() + timeout;
						match message {
							Message::Ping(payload) => {
								let _ = conn.send_pong(payload).await;
							}
							Message::Pong(_) => {}
							Message::Close(frame) => {
								debug!(conn = %conn.name(), frame = ?frame, "client closed websocket");
								instance.close_connection(conn.name(), CloseCode::Normal).await;
								return;
							}
							Message::Text(_) | Message::Binary(_) => {
								// Clients never have a reason to send data; treat it
								// as a violation while we are the live instance.
								if instance.status() == InstanceStatus::Online {
									warn!(conn = %conn.name(), "client sent inbound traffic; closing connection");
									instance.close_connection(conn.name(), CloseCode::SentInboundTraffic).await;
									return;
								}
							}
							Message::Frame(_) => {}
						}
					}
					Some(Err(e)) => {
						// Suppressed once stopped: the force-close already chose
						// the close code for this socket.
						if instance.status() != InstanceStatus::Stopped {
							debug!(conn = %conn.name(), error = %e, "websocket read error");
							instance.close_connection(conn.name(), CloseCode::NetworkError).await;
						}
						return;
					}
					None => {
						instance.close_connection(conn.name(), CloseCode::Normal).await;
						return;
					}
				}
			}
		}
	}
}
