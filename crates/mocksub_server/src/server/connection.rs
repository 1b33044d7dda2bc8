#![forbid(unsafe_code)]

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use mocksub_domain::{CloseCode, SessionId};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as FrameCloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

/// Server-side websocket over a hyper upgraded stream.
pub type WsStream = WebSocketStream<TokioIo<Upgraded>>;
pub type WsWriter = SplitSink<WsStream, Message>;
pub type WsReader = SplitStream<WsStream>;

/// Cancellation handle for one per-connection background task. Taking the
/// sender out is the "still open" check, so a second cancel is a no-op and
/// the signal can never be closed twice.
#[derive(Default)]
pub struct CancelSlot(parking_lot::Mutex<Option<oneshot::Sender<()>>>);

impl CancelSlot {
	/// Install a fresh signal and hand back the receiving half for the task.
	pub fn arm(&self) -> oneshot::Receiver<()> {
		let (tx, rx) = oneshot::channel();
		*self.0.lock() = Some(tx);
		rx
	}

	pub fn cancel(&self) {
		if let Some(tx) = self.0.lock().take() {
			let _ = tx.send(());
		}
	}
}

/// One accepted client connection.
///
/// All outbound frames (welcome, keepalive, ping, notifications, reconnect,
/// close) funnel through `writer`, so concurrent producers can never
/// interleave partial frames. The read half stays with the read loop.
pub struct Connection {
	session: SessionId,
	pub connected_at: DateTime<Utc>,
	writer: tokio::sync::Mutex<WsWriter>,
	pub(crate) keepalive_cancel: CancelSlot,
	pub(crate) ping_cancel: CancelSlot,
	pub(crate) must_subscribe_cancel: CancelSlot,
}

impl Connection {
	pub fn new(session: SessionId, connected_at: DateTime<Utc>, writer: WsWriter) -> Self {
		Self {
			session,
			connected_at,
			writer: tokio::sync::Mutex::new(writer),
			keepalive_cancel: CancelSlot::default(),
			ping_cancel: CancelSlot::default(),
			must_subscribe_cancel: CancelSlot::default(),
		}
	}

	/// Connection name, the half of the session id that outlives handoffs.
	pub fn name(&self) -> &str {
		self.session.connection()
	}

	pub fn session(&self) -> &SessionId {
		&self.session
	}

	/// Serialize and send one JSON text frame.
	pub async fn send_json<T: Serialize>(&self, message: &T) -> anyhow::Result<()> {
		let text = serde_json::to_string(message).context("serialize outbound message")?;
		let mut writer = self.writer.lock().await;
		writer
			.send(Message::Text(text.into()))
			.await
			.context("write websocket frame")?;
		Ok(())
	}

	pub async fn send_ping(&self) -> anyhow::Result<()> {
		let mut writer = self.writer.lock().await;
		writer
			.send(Message::Ping(Bytes::new()))
			.await
			.context("write websocket ping")?;
		Ok(())
	}

	pub async fn send_pong(&self, payload: Bytes) -> anyhow::Result<()> {
		let mut writer = self.writer.lock().await;
		writer
			.send(Message::Pong(payload))
			.await
			.context("write websocket pong")?;
		Ok(())
	}

	/// Best-effort close frame; the connection is going away regardless, so
	/// callers ignore the result.
	pub async fn close_with_reason(&self, code: CloseCode) -> anyhow::Result<()> {
		let frame = CloseFrame {
			code: FrameCloseCode::from(code.as_u16()),
			reason: code.reason_text().into(),
		};
		let mut writer = self.writer.lock().await;
		writer
			.send(Message::Close(Some(frame)))
			.await
			.context("write websocket close frame")?;
		Ok(())
	}

	/// Stop every background task tied to this connection.
	pub fn cancel_timers(&self) {
		self.keepalive_cancel.cancel();
		self.ping_cancel.cancel();
		self.must_subscribe_cancel.cancel();
	}
}
