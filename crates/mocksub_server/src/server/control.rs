#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use mocksub_domain::{CloseCode, SubscriptionStatus};
use mocksub_protocol::control::{
	ControlRequest, ControlResponse, OP_CLOSE_CONNECTION, OP_FORWARD_EVENT, OP_RECONNECT, OP_SET_SUBSCRIPTION_STATUS,
	VAR_CLOSE_REASON, VAR_CONNECTION_NAME, VAR_SUBSCRIPTION_ID, VAR_SUBSCRIPTION_STATUS,
};
use mocksub_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame_default, try_decode_frame_from_buffer};
use mocksub_protocol::messages::NotificationPayload;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::server::manager::Manager;

/// Control socket for the trigger tool: length-prefixed JSON frames, one
/// response per request, connections held open for as many requests as the
/// client wants. There is no auth; bind it to loopback.
pub async fn serve_control(listener: TcpListener, manager: Arc<Manager>) -> anyhow::Result<()> {
	loop {
		let (stream, addr) = listener.accept().await?;
		let manager = Arc::clone(&manager);
		tokio::spawn(async move {
			if let Err(err) = handle_control_conn(stream, &manager).await {
				debug!(error = %err, peer = %addr, "control connection error");
			}
		});
	}
}

async fn handle_control_conn(mut stream: TcpStream, manager: &Arc<Manager>) -> anyhow::Result<()> {
	let mut buf = BytesMut::with_capacity(4096);
	loop {
		while let Some(request) = try_decode_frame_from_buffer::<ControlRequest>(&mut buf, DEFAULT_MAX_FRAME_SIZE)? {
			let response = dispatch(manager, request).await;
			let frame = encode_frame_default(&response)?;
			stream.write_all(&frame).await.context("writing control response")?;
		}

		let read = stream.read_buf(&mut buf).await.context("reading control socket")?;
		if read == 0 {
			// Clean disconnect; a partial trailing frame is discarded.
			return Ok(());
		}
	}
}

/// Route one request by operation name. Unknown operations get
/// InvalidOperation back without touching any server state.
pub(crate) async fn dispatch(manager: &Arc<Manager>, request: ControlRequest) -> ControlResponse {
	info!(op = %request.op, "control request");
	metrics::counter!("mocksub_control_requests_total").increment(1);

	match request.op.as_str() {
		OP_RECONNECT => handle_reconnect(manager).await,
		OP_FORWARD_EVENT => handle_forward_event(manager, &request).await,
		OP_CLOSE_CONNECTION => handle_close_connection(manager, &request).await,
		OP_SET_SUBSCRIPTION_STATUS => handle_set_subscription_status(manager, &request),
		other => ControlResponse::invalid_operation(format!("unknown operation: {other}")),
	}
}

async fn handle_reconnect(manager: &Arc<Manager>) -> ControlResponse {
	match manager.start_reconnect() {
		Ok(new_id) => ControlResponse::success(format!("reconnect started; new primary instance {new_id}")),
		Err(err) => ControlResponse::failed(err.to_string()),
	}
}

async fn handle_forward_event(manager: &Arc<Manager>, request: &ControlRequest) -> ControlResponse {
	let Some(body) = request.body.as_deref().filter(|b| !b.trim().is_empty()) else {
		return ControlResponse::missing_argument("ForwardEvent requires an event payload body");
	};
	let payload: NotificationPayload = match serde_json::from_str(body) {
		Ok(payload) => payload,
		Err(err) => return ControlResponse::failed(format!("invalid event payload: {err}")),
	};

	let scope = request.variable(VAR_CONNECTION_NAME);
	match manager.forward_event(scope, &payload).await {
		Ok(delivered) => ControlResponse::success(format!("forwarded event to {delivered} connection(s)")),
		Err(err) => ControlResponse::failed(err.to_string()),
	}
}

async fn handle_close_connection(manager: &Arc<Manager>, request: &ControlRequest) -> ControlResponse {
	let Some(name) = request.variable(VAR_CONNECTION_NAME) else {
		return ControlResponse::missing_argument(format!("{VAR_CONNECTION_NAME} is required"));
	};
	let Some(reason) = request.variable(VAR_CLOSE_REASON) else {
		return ControlResponse::missing_argument(format!("{VAR_CLOSE_REASON} is required"));
	};

	let Some(code) = reason.parse::<u16>().ok().and_then(CloseCode::from_u16) else {
		return ControlResponse::failed(format!("unknown close reason: {reason}"));
	};

	if manager.close_connection(name, code).await {
		ControlResponse::success(format!("closed connection {name} with {code}"))
	} else {
		ControlResponse::failed(format!("unknown connection: {name}"))
	}
}

fn handle_set_subscription_status(manager: &Arc<Manager>, request: &ControlRequest) -> ControlResponse {
	let Some(id) = request.variable(VAR_SUBSCRIPTION_ID) else {
		return ControlResponse::missing_argument(format!("{VAR_SUBSCRIPTION_ID} is required"));
	};
	let Some(status_raw) = request.variable(VAR_SUBSCRIPTION_STATUS) else {
		return ControlResponse::missing_argument(format!("{VAR_SUBSCRIPTION_STATUS} is required"));
	};

	let status = match status_raw.parse::<SubscriptionStatus>() {
		Ok(status) => status,
		Err(err) => return ControlResponse::failed(err.to_string()),
	};

	if manager.set_subscription_status(id, status) {
		ControlResponse::success(format!("subscription {id} set to {status}"))
	} else {
		ControlResponse::failed(format!("unknown subscription: {id}"))
	}
}
