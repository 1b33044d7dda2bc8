#![forbid(unsafe_code)]

use std::net::SocketAddr;

/// Parsed `ws://host:port` endpoint for the public listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WsEndpoint {
	pub host: String,
	pub port: u16,
}

impl WsEndpoint {
	/// Returns `host:port` (host preserved, IPv6 stays bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Render a websocket URL rooted at this endpoint, e.g. `ws_url("ws")`
	/// gives `ws://host:port/ws`. Reconnect URLs are built from this.
	pub fn ws_url(&self, path: &str) -> String {
		let path = path.trim_start_matches('/');
		format!("ws://{}/{}", self.hostport(), path)
	}

	/// Convert to `SocketAddr` only if the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
		self.hostport()
			.parse()
			.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
	}

	/// Parse a websocket endpoint string in the form `ws://host:port`.
	pub fn parse(s: &str) -> Result<Self, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
		}

		let rest = s
			.strip_prefix("ws://")
			.ok_or_else(|| format!("invalid endpoint (expected ws://host:port): {s}"))?;

		if rest.contains('/') || rest.contains('?') || rest.contains('#') {
			return Err(format!(
				"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
			));
		}

		let (host, port_str) = rest
			.rsplit_once(':')
			.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
		}

		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(format!(
				"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8080): {s}"
			));
		}

		let port: u16 = port_str
			.trim()
			.parse()
			.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

		if port == 0 {
			return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
		}

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_dns_hostname() {
		let e = WsEndpoint::parse("ws://mocksub.example.com:8080").unwrap();
		assert_eq!(e.host, "mocksub.example.com");
		assert_eq!(e.port, 8080);
		assert_eq!(e.hostport(), "mocksub.example.com:8080");
	}

	#[test]
	fn parses_ipv4() {
		let e = WsEndpoint::parse("ws://127.0.0.1:8080").unwrap();
		assert_eq!(e.host, "127.0.0.1");
		assert_eq!(e.port, 8080);
		assert_eq!(e.hostport(), "127.0.0.1:8080");
	}

	#[test]
	fn parses_bracketed_ipv6() {
		let e = WsEndpoint::parse("ws://[::1]:8080").unwrap();
		assert_eq!(e.host, "[::1]");
		assert_eq!(e.port, 8080);
		assert_eq!(e.hostport(), "[::1]:8080");
	}

	#[test]
	fn rejects_unbracketed_ipv6() {
		let err = WsEndpoint::parse("ws://::1:8080").unwrap_err();
		assert!(err.to_lowercase().contains("ipv6"));
	}

	#[test]
	fn rejects_path_query_fragment() {
		assert!(WsEndpoint::parse("ws://127.0.0.1:8080/").is_err());
		assert!(WsEndpoint::parse("ws://127.0.0.1:8080?x=y").is_err());
		assert!(WsEndpoint::parse("ws://127.0.0.1:8080#frag").is_err());
	}

	#[test]
	fn rejects_port_zero_and_missing_port() {
		assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
		assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
	}

	#[test]
	fn ws_url_joins_paths() {
		let e = WsEndpoint::parse("ws://127.0.0.1:8080").unwrap();
		assert_eq!(e.ws_url("ws"), "ws://127.0.0.1:8080/ws");
		assert_eq!(e.ws_url("/ws"), "ws://127.0.0.1:8080/ws");
	}

	#[test]
	fn to_socket_addr_if_ip_literal_accepts_ip_literals() {
		let e4 = WsEndpoint::parse("ws://127.0.0.1:8080").unwrap();
		let a4 = e4.to_socket_addr_if_ip_literal().unwrap();
		assert_eq!(a4.to_string(), "127.0.0.1:8080");

		let e6 = WsEndpoint::parse("ws://[::1]:8080").unwrap();
		let a6 = e6.to_socket_addr_if_ip_literal().unwrap();
		assert_eq!(a6.to_string(), "[::1]:8080");
	}

	#[test]
	fn to_socket_addr_if_ip_literal_rejects_dns() {
		let e = WsEndpoint::parse("ws://mocksub.example.com:8080").unwrap();
		assert!(e.to_socket_addr_if_ip_literal().is_err());
	}
}
