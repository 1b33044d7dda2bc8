#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use mocksub_server::config;
use mocksub_server::server::manager::{Manager, ManagerSettings};
use mocksub_server::server::{control, http};
use mocksub_server::util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: mocksub_server [--bind ws://host:port] [--control-bind host:port] [--strict] [--config path]\n\
\n\
Options:\n\
\t--bind          Public websocket endpoint (default: ws://127.0.0.1:8080)\n\
\t               Format: ws://host:port\n\
\t--control-bind  Control socket bind address (default: 127.0.0.1:8181)\n\
\t--strict        Close idle unsubscribed clients and only deliver to matching subscriptions\n\
\t--config        Config file path (default: ~/.mocksub/config.toml)\n\
\t--help          Show this help\n\
"
	);
	std::process::exit(2)
}

struct CliArgs {
	bind: Option<String>,
	control_bind: Option<String>,
	strict: bool,
	config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs {
		bind: None,
		control_bind: None,
		strict: false,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--control-bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--control-bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.control_bind = Some(v);
			}
			"--strict" => {
				args.strict = true;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mocksub_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("mocksub_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	// Command line wins over file and env.
	if let Some(bind) = args.bind {
		cfg.server.bind = bind;
	}
	if let Some(control_bind) = args.control_bind {
		cfg.server.control_bind = control_bind;
	}
	if args.strict {
		cfg.server.strict_subscriptions = true;
	}

	init_metrics(cfg.server.metrics_bind.as_deref());

	let public_endpoint = WsEndpoint::parse(&cfg.server.bind).map_err(|e| anyhow::anyhow!(e))?;
	let public_addr = public_endpoint.to_socket_addr_if_ip_literal().map_err(|e| anyhow::anyhow!(e))?;
	let control_addr: SocketAddr = cfg
		.server
		.control_bind
		.parse()
		.context("invalid control bind address (expected host:port)")?;

	let manager = Manager::new(ManagerSettings {
		public_endpoint: public_endpoint.clone(),
		timing: cfg.timing,
		strict_subscriptions: cfg.server.strict_subscriptions,
		admin_client_id: cfg.server.admin_client_id.clone(),
	});

	let public_listener = TcpListener::bind(public_addr)
		.await
		.with_context(|| format!("binding public listener on {public_addr}"))?;
	let control_listener = TcpListener::bind(control_addr)
		.await
		.with_context(|| format!("binding control listener on {control_addr}"))?;
	info!(
		ws = %public_endpoint.ws_url("ws"),
		control = %control_addr,
		strict = cfg.server.strict_subscriptions,
		"mock eventsub server ready"
	);

	let public = tokio::spawn(http::serve_public(public_listener, Arc::clone(&manager)));
	let control = tokio::spawn(control::serve_control(control_listener, Arc::clone(&manager)));

	tokio::select! {
		res = public => res.context("public listener task")??,
		res = control => res.context("control listener task")??,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown signal received");
		}
	}

	Ok(())
}
