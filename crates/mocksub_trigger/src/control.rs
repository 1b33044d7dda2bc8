#![forbid(unsafe_code)]

//! Client side of the server's control socket.

use anyhow::Context;
use bytes::BytesMut;
use mocksub_protocol::control::{ControlRequest, ControlResponse};
use mocksub_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame_default, try_decode_frame_from_buffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Send one request over the control socket and wait for its response.
pub async fn send_control_request(addr: &str, request: &ControlRequest) -> anyhow::Result<ControlResponse> {
	tracing::debug!(%addr, op = %request.op, "control request");
	let mut stream = TcpStream::connect(addr)
		.await
		.with_context(|| format!("connecting to control socket at {addr}"))?;

	let frame = encode_frame_default(request).context("encoding control request")?;
	stream.write_all(&frame).await.context("sending control request")?;

	let mut buf = BytesMut::with_capacity(4096);
	loop {
		if let Some(response) = try_decode_frame_from_buffer::<ControlResponse>(&mut buf, DEFAULT_MAX_FRAME_SIZE)? {
			return Ok(response);
		}

		let n = stream.read_buf(&mut buf).await.context("reading control response")?;
		if n == 0 {
			anyhow::bail!("control socket at {addr} closed before responding");
		}
	}
}

#[cfg(test)]
mod tests {
	use mocksub_protocol::control::{ControlCode, OP_RECONNECT};
	use tokio::net::TcpListener;

	use super::*;

	#[tokio::test]
	async fn round_trips_a_request_against_a_canned_server() -> anyhow::Result<()> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;

		let server = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await?;
			let mut buf = BytesMut::new();
			let request = loop {
				if let Some(req) = try_decode_frame_from_buffer::<ControlRequest>(&mut buf, DEFAULT_MAX_FRAME_SIZE)? {
					break req;
				}
				stream.read_buf(&mut buf).await?;
			};
			let response = ControlResponse::success(format!("saw {}", request.op));
			stream.write_all(&encode_frame_default(&response)?).await?;
			anyhow::Ok(())
		});

		let response = send_control_request(&addr.to_string(), &ControlRequest::new(OP_RECONNECT)).await?;
		assert_eq!(response.code, ControlCode::Success);
		assert_eq!(response.detail, "saw Reconnect");

		server.await??;
		Ok(())
	}

	#[tokio::test]
	async fn early_disconnect_is_an_error() -> anyhow::Result<()> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;

		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			drop(stream);
		});

		let err = send_control_request(&addr.to_string(), &ControlRequest::new(OP_RECONNECT))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("closed before responding"));
		Ok(())
	}
}
