#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default public endpoint clients dial.
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:8080";
/// Default loopback address of the control-plane listener.
pub const DEFAULT_CONTROL_BIND: &str = "127.0.0.1:8181";
/// Caller identity that may list every subscription, not just its own.
pub const DEFAULT_ADMIN_CLIENT_ID: &str = "mocksub-cli";

/// Default config path: `~/.mocksub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".mocksub").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub timing: ServerTiming,
}

/// Listener and identity settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Public endpoint (`ws://host:port`) serving the websocket and the
	/// subscription API. Also the host clients are pointed back at in
	/// reconnect URLs.
	pub bind: String,
	/// Control-plane listener address (`host:port`).
	pub control_bind: String,
	/// Client id that sees every subscription in list responses.
	pub admin_client_id: String,
	/// Require every connection to create a subscription within the
	/// must-subscribe window or be closed with 4003.
	pub strict_subscriptions: bool,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			control_bind: DEFAULT_CONTROL_BIND.to_string(),
			admin_client_id: DEFAULT_ADMIN_CLIENT_ID.to_string(),
			strict_subscriptions: false,
			metrics_bind: None,
		}
	}
}

/// Protocol timing knobs. Production values are fixed by the protocol; tests
/// compress them to keep runs fast.
#[derive(Debug, Clone, Copy)]
pub struct ServerTiming {
	/// Cadence of `session_keepalive` messages, also advertised to clients as
	/// `keepalive_timeout_seconds` in the welcome.
	pub keepalive_interval: Duration,
	/// Cadence of protocol pings.
	pub ping_interval: Duration,
	/// Strict mode: how long a connection may exist without a subscription.
	pub must_subscribe_window: Duration,
	/// Read-loop deadline; any inbound frame (pongs included) resets it.
	pub inactivity_timeout: Duration,
	/// How long a draining instance waits before force-closing stragglers.
	pub reconnect_grace: Duration,
}

impl Default for ServerTiming {
	fn default() -> Self {
		Self {
			keepalive_interval: Duration::from_secs(10),
			ping_interval: Duration::from_secs(5),
			must_subscribe_window: Duration::from_secs(10),
			inactivity_timeout: Duration::from_secs(10),
			reconnect_grace: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	timing: FileTimingSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	control_bind: Option<String>,
	admin_client_id: Option<String>,
	strict_subscriptions: Option<bool>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTimingSettings {
	keepalive_interval_secs: Option<u64>,
	ping_interval_secs: Option<u64>,
	must_subscribe_window_secs: Option<u64>,
	inactivity_timeout_secs: Option<u64>,
	reconnect_grace_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerTiming::default();

		let timing = ServerTiming {
			keepalive_interval: file
				.timing
				.keepalive_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.keepalive_interval),
			ping_interval: file
				.timing
				.ping_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.ping_interval),
			must_subscribe_window: file
				.timing
				.must_subscribe_window_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.must_subscribe_window),
			inactivity_timeout: file
				.timing
				.inactivity_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.inactivity_timeout),
			reconnect_grace: file
				.timing
				.reconnect_grace_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.reconnect_grace),
		};

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				control_bind: file
					.server
					.control_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_CONTROL_BIND.to_string()),
				admin_client_id: file
					.server
					.admin_client_id
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_ADMIN_CLIENT_ID.to_string()),
				strict_subscriptions: file.server.strict_subscriptions.unwrap_or(false),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			timing,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("MOCKSUB_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MOCKSUB_CONTROL_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.control_bind = v;
			info!("server config: control_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MOCKSUB_ADMIN_CLIENT_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.admin_client_id = v;
			info!("server config: admin_client_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MOCKSUB_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MOCKSUB_STRICT_SUBSCRIPTIONS")
		&& let Some(strict) = parse_env_bool(&v)
	{
		cfg.server.strict_subscriptions = strict;
		info!(strict, "server config: strict_subscriptions overridden by env");
	}

	if let Ok(v) = std::env::var("MOCKSUB_KEEPALIVE_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timing.keepalive_interval = Duration::from_secs(secs);
		info!(secs, "server timing: keepalive_interval overridden by env");
	}

	if let Ok(v) = std::env::var("MOCKSUB_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timing.ping_interval = Duration::from_secs(secs);
		info!(secs, "server timing: ping_interval overridden by env");
	}

	if let Ok(v) = std::env::var("MOCKSUB_MUST_SUBSCRIBE_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timing.must_subscribe_window = Duration::from_secs(secs);
		info!(secs, "server timing: must_subscribe_window overridden by env");
	}

	if let Ok(v) = std::env::var("MOCKSUB_INACTIVITY_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timing.inactivity_timeout = Duration::from_secs(secs);
		info!(secs, "server timing: inactivity_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("MOCKSUB_RECONNECT_GRACE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.timing.reconnect_grace = Duration::from_secs(secs);
		info!(secs, "server timing: reconnect_grace overridden by env");
	}

	if cfg.timing.ping_interval >= cfg.timing.inactivity_timeout {
		warn!(
			ping_secs = cfg.timing.ping_interval.as_secs(),
			inactivity_secs = cfg.timing.inactivity_timeout.as_secs(),
			"server timing: ping_interval >= inactivity_timeout; idle clients may be timed out between pongs"
		);
	}
}
