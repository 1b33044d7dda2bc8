#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mocksub_domain::SessionId;
use mocksub_domain::TransportKind;
use mocksub_events::Topic;
use mocksub_protocol::messages::{
	ApiErrorBody, CreateSubscriptionRequest, MAX_TOTAL_COST, SubscriptionData, SubscriptionListResponse,
};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use crate::server::instance::run_connection;
use crate::server::manager::Manager;
use crate::server::registry::RegistryError;

/// Public listener: websocket upgrades, the subscriptions API and the health
/// probe all share one http1 port.
pub async fn serve_public(listener: TcpListener, manager: Arc<Manager>) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let manager = Arc::clone(&manager);
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, Arc::clone(&manager)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				debug!(error = %err, "public connection error");
			}
		});
	}
}

async fn route(mut req: Request<Incoming>, manager: Arc<Manager>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let path = req.uri().path().to_string();
	match (req.method().clone(), path.as_str()) {
		(Method::GET, "/ws") => Ok(handle_ws_upgrade(&mut req, manager)),
		(_, "/eventsub/subscriptions") => handle_subscriptions(req, manager).await,
		(Method::GET, "/health") => Ok(handle_health(&manager)),
		_ => Ok(json_error(StatusCode::NOT_FOUND, "Not Found", "unknown route")),
	}
}

/// Complete the websocket handshake by hand and hand the upgraded stream to
/// the current primary instance. The `reconnect_id` query parameter, if
/// present, is the carry-over token a previous instance issued.
fn handle_ws_upgrade(req: &mut Request<Incoming>, manager: Arc<Manager>) -> Response<Full<Bytes>> {
	let upgrade_requested = req
		.headers()
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false);
	let key = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned();

	let (true, Some(key)) = (upgrade_requested, key) else {
		return json_error(
			StatusCode::BAD_REQUEST,
			"Bad Request",
			"websocket upgrade headers required on /ws",
		);
	};
	let accept = derive_accept_key(key.as_bytes());

	let reconnect_token = req.uri().query().and_then(|q| query_param(q, "reconnect_id"));

	let upgrade = hyper::upgrade::on(req);
	tokio::spawn(async move {
		match upgrade.await {
			Ok(upgraded) => {
				let io = TokioIo::new(upgraded);
				let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
				run_connection(manager.primary(), ws, reconnect_token).await;
			}
			Err(err) => warn!(error = %err, "websocket upgrade failed"),
		}
	});

	Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(header::CONNECTION, "upgrade")
		.header(header::UPGRADE, "websocket")
		.header(header::SEC_WEBSOCKET_ACCEPT, accept)
		.body(Full::new(Bytes::new()))
		.unwrap()
}

async fn handle_subscriptions(req: Request<Incoming>, manager: Arc<Manager>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();

	let client_id = parts
		.headers
		.get("client-id")
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.filter(|v| !v.is_empty())
		.map(str::to_string);
	let Some(client_id) = client_id else {
		return Ok(json_error(
			StatusCode::UNAUTHORIZED,
			"Unauthorized",
			"client-id header required",
		));
	};

	let primary = manager.primary();

	match parts.method {
		Method::POST => {
			let body_bytes = match body.collect().await {
				Ok(collected) => collected.to_bytes(),
				Err(err) => {
					warn!(error = %err, "subscription request body read failed");
					return Ok(json_error(StatusCode::BAD_REQUEST, "Bad Request", "could not read request body"));
				}
			};

			let request: CreateSubscriptionRequest = match serde_json::from_slice(&body_bytes) {
				Ok(request) => request,
				Err(err) => {
					return Ok(json_error(
						StatusCode::BAD_REQUEST,
						"Bad Request",
						&format!("invalid subscription request: {err}"),
					));
				}
			};

			if request.transport.method != TransportKind::Websocket {
				return Ok(json_error(
					StatusCode::BAD_REQUEST,
					"Bad Request",
					"only the websocket transport is supported here",
				));
			}
			let Some(session_raw) = request.transport.session_id.as_deref() else {
				return Ok(json_error(
					StatusCode::BAD_REQUEST,
					"Bad Request",
					"transport.session_id is required",
				));
			};
			let session = match SessionId::parse(session_raw) {
				Ok(session) => session,
				Err(err) => {
					return Ok(json_error(
						StatusCode::BAD_REQUEST,
						"Bad Request",
						&format!("invalid transport.session_id: {err}"),
					));
				}
			};

			// The session must name a connection that is live on the current
			// primary. Sessions minted by a drained instance do not count.
			let conn = if session.instance() == primary.id() {
				primary.connection(session.connection())
			} else {
				None
			};
			let Some(conn) = conn else {
				return Ok(json_error(
					StatusCode::BAD_REQUEST,
					"Bad Request",
					"transport.session_id does not name a connected websocket session",
				));
			};

			if !Topic::supports(&request.event_type, &request.version) {
				return Ok(json_error(
					StatusCode::BAD_REQUEST,
					"Bad Request",
					&format!("unsupported subscription type: {} version {}", request.event_type, request.version),
				));
			}

			match primary.registry.create(
				&client_id,
				&request.event_type,
				&request.version,
				request.condition,
				session.connection(),
				conn.connected_at,
			) {
				Ok(record) => {
					let data = SubscriptionData::from_record(&record, &session.to_string());
					let response = SubscriptionListResponse {
						data: vec![data],
						total: 1,
						total_cost: 0,
						max_total_cost: MAX_TOTAL_COST,
						pagination: None,
					};
					Ok(json_response(StatusCode::ACCEPTED, &response))
				}
				Err(err @ RegistryError::Duplicate { .. }) => {
					Ok(json_error(StatusCode::CONFLICT, "Conflict", &err.to_string()))
				}
				Err(err @ RegistryError::QuotaExceeded { .. }) => {
					Ok(json_error(StatusCode::BAD_REQUEST, "Bad Request", &err.to_string()))
				}
			}
		}
		Method::GET => {
			let include_all = client_id == manager.settings().admin_client_id;
			let records = primary.registry.list(&client_id, include_all);
			let data: Vec<SubscriptionData> = records
				.iter()
				.map(|record| {
					let session_id = format!("{}_{}", primary.id(), record.conn_name);
					SubscriptionData::from_record(record, &session_id)
				})
				.collect();

			let response = SubscriptionListResponse {
				total: data.len(),
				total_cost: 0,
				max_total_cost: MAX_TOTAL_COST,
				pagination: Some(Default::default()),
				data,
			};
			Ok(json_response(StatusCode::OK, &response))
		}
		Method::DELETE => {
			let id = parts.uri.query().and_then(|q| query_param(q, "id"));
			let Some(id) = id else {
				return Ok(json_error(StatusCode::BAD_REQUEST, "Bad Request", "id query parameter required"));
			};

			if primary.registry.delete(&id) {
				Ok(Response::builder()
					.status(StatusCode::NO_CONTENT)
					.body(Full::new(Bytes::new()))
					.unwrap())
			} else {
				Ok(json_error(StatusCode::NOT_FOUND, "Not Found", "subscription not found"))
			}
		}
		_ => Ok(json_error(
			StatusCode::METHOD_NOT_ALLOWED,
			"Method Not Allowed",
			"use POST, GET or DELETE",
		)),
	}
}

fn handle_health(manager: &Manager) -> Response<Full<Bytes>> {
	let primary = manager.primary();
	let body = serde_json::json!({
		"status": "ok",
		"primary_instance": primary.id(),
		"connections": primary.connection_count(),
		"instances": manager.instance_count(),
	});
	json_response(StatusCode::OK, &body)
}

/// Extract one query parameter without percent-decoding. Reconnect tokens are
/// standard base64 whose `+` and `/` must be taken literally, so decoding
/// here would corrupt them.
fn query_param(query: &str, name: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (key, value) = pair.split_once('=')?;
		(key == name && !value.is_empty()).then(|| value.to_string())
	})
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
	let bytes = serde_json::to_vec(body).unwrap_or_default();
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(bytes)))
		.unwrap()
}

fn json_error(status: StatusCode, error: &str, message: &str) -> Response<Full<Bytes>> {
	let body = ApiErrorBody {
		error: error.to_string(),
		status: status.as_u16(),
		message: message.to_string(),
	};
	json_response(status, &body)
}
