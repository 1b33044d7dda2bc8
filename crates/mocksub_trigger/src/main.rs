#![forbid(unsafe_code)]

mod control;
mod forward;
mod store;

use anyhow::Context as _;
use chrono::Utc;
use mocksub_domain::{SessionId, TransportKind};
use mocksub_events::{ResolvedTopic, Topic, TriggerParams};
use mocksub_protocol::control::{
	ControlRequest, ControlResponse, OP_CLOSE_CONNECTION, OP_FORWARD_EVENT, OP_RECONNECT, OP_SET_SUBSCRIPTION_STATUS,
	VAR_CLOSE_REASON, VAR_CONNECTION_NAME, VAR_SUBSCRIPTION_ID, VAR_SUBSCRIPTION_STATUS,
};
use mocksub_protocol::messages::NotificationPayload;

use crate::control::send_control_request;
use crate::forward::WebhookForwarder;
use crate::store::{EventStore, StoredEvent};

/// Matches the server's default control bind.
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8181";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: mocksub_trigger <command> [options]\n\
\n\
Commands:\n\
\ttrigger <topic>       Generate an event and deliver it, e.g. `trigger follow`\n\
\tretrigger             Resend a stored event (needs --id)\n\
\treconnect             Start a reconnect handoff on the server\n\
\tclose                 Close one websocket connection (needs --session or --connection, and --reason)\n\
\tsubscription-status   Override a subscription's status (needs --subscription and --status)\n\
\n\
Options:\n\
\t--control <host:port>      Control socket address (default: {DEFAULT_CONTROL_ADDR})\n\
\t--session <id>             Scope delivery to the session's connection\n\
\t--connection <name>        Scope delivery to a connection by name\n\
\t--from-user <id>           User id acting in the event (follower, cheerer, raider)\n\
\t--to-user <id>             Broadcaster user id the event targets\n\
\t--version <v>              Subscription version for the topic\n\
\t--forward-address <url>    POST the event to this webhook instead of the mock server\n\
\t--secret <secret>          HMAC secret for the webhook signature header\n\
\t--id <event-id>            Stored event id to resend (retrigger)\n\
\t--reason <code>            Close code, e.g. 4001 (close)\n\
\t--subscription <id>        Subscription id (subscription-status)\n\
\t--status <status>          New status, e.g. user_removed (subscription-status)\n\
\t--help                     Show this help\n\
"
	);
	std::process::exit(2)
}

enum Command {
	Trigger { topic: String },
	Retrigger,
	Reconnect,
	Close,
	SubscriptionStatus,
}

struct CliArgs {
	control: String,
	session: Option<String>,
	connection: Option<String>,
	from_user: Option<String>,
	to_user: Option<String>,
	version: Option<String>,
	forward_address: Option<String>,
	secret: Option<String>,
	event_id: Option<String>,
	reason: Option<String>,
	subscription: Option<String>,
	status: Option<String>,
}

fn parse_args() -> (Command, CliArgs) {
	let mut it = std::env::args().skip(1);
	let Some(command_name) = it.next() else { usage_and_exit() };
	if matches!(command_name.as_str(), "--help" | "-h") {
		usage_and_exit();
	}

	let mut args = CliArgs {
		control: DEFAULT_CONTROL_ADDR.to_string(),
		session: None,
		connection: None,
		from_user: None,
		to_user: None,
		version: None,
		forward_address: None,
		secret: None,
		event_id: None,
		reason: None,
		subscription: None,
		status: None,
	};
	let mut positional: Option<String> = None;

	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--control" => args.control = it.next().unwrap_or_else(|| usage_and_exit()),
			"--session" => args.session = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--connection" => args.connection = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--from-user" => args.from_user = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--to-user" => args.to_user = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--version" => args.version = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--forward-address" => args.forward_address = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--secret" => args.secret = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--id" => args.event_id = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--reason" => args.reason = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--subscription" => args.subscription = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--status" => args.status = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			other if !other.starts_with('-') && positional.is_none() => {
				positional = Some(other.to_string());
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let command = match command_name.as_str() {
		"trigger" => {
			let Some(topic) = positional.take() else {
				eprintln!("trigger needs a topic, e.g. `mocksub_trigger trigger follow`");
				usage_and_exit();
			};
			Command::Trigger { topic }
		}
		"retrigger" => Command::Retrigger,
		"reconnect" => Command::Reconnect,
		"close" => Command::Close,
		"subscription-status" => Command::SubscriptionStatus,
		other => {
			eprintln!("Unknown command: {other}");
			usage_and_exit();
		}
	};
	if let Some(stray) = positional {
		eprintln!("Unexpected argument: {stray}");
		usage_and_exit();
	}

	(command, args)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (command, args) = parse_args();

	let code = match command {
		Command::Trigger { topic } => run_trigger(&topic, &args).await?,
		Command::Retrigger => run_retrigger(&args).await?,
		Command::Reconnect => run_reconnect(&args).await?,
		Command::Close => run_close(&args).await?,
		Command::SubscriptionStatus => run_subscription_status(&args).await?,
	};
	std::process::exit(code)
}

async fn run_trigger(topic: &str, args: &CliArgs) -> anyhow::Result<i32> {
	let transport = if args.forward_address.is_some() {
		TransportKind::Webhook
	} else {
		TransportKind::Websocket
	};
	let resolved = Topic::lookup(topic, transport, args.version.as_deref())?;
	let payload = resolved.build(&trigger_params(args, transport))?;

	// Stored before delivery so retrigger can resend an event whose send failed.
	record_event(topic, &resolved, &payload)?;
	deliver(args, &payload).await
}

async fn run_retrigger(args: &CliArgs) -> anyhow::Result<i32> {
	let Some(event_id) = &args.event_id else {
		eprintln!("retrigger needs --id <event-id>");
		usage_and_exit();
	};

	let store = EventStore::open_default()?;
	let Some(stored) = store.get(event_id) else {
		anyhow::bail!("no stored event with id {event_id}");
	};

	let mut refreshed = stored.clone();
	refreshed.stored_at = Utc::now();
	store.insert(refreshed)?;

	deliver(args, &stored.payload).await
}

async fn run_reconnect(args: &CliArgs) -> anyhow::Result<i32> {
	finish(send_control_request(&args.control, &ControlRequest::new(OP_RECONNECT)).await?)
}

async fn run_close(args: &CliArgs) -> anyhow::Result<i32> {
	let Some(scope) = connection_scope(args)? else {
		eprintln!("close needs --session <id> or --connection <name>");
		usage_and_exit();
	};
	let Some(reason) = &args.reason else {
		eprintln!("close needs --reason <code>");
		usage_and_exit();
	};

	let request = ControlRequest::new(OP_CLOSE_CONNECTION)
		.with_variable(VAR_CONNECTION_NAME, scope)
		.with_variable(VAR_CLOSE_REASON, reason.clone());
	finish(send_control_request(&args.control, &request).await?)
}

async fn run_subscription_status(args: &CliArgs) -> anyhow::Result<i32> {
	let Some(subscription) = &args.subscription else {
		eprintln!("subscription-status needs --subscription <id>");
		usage_and_exit();
	};
	let Some(status) = &args.status else {
		eprintln!("subscription-status needs --status <status>");
		usage_and_exit();
	};

	let request = ControlRequest::new(OP_SET_SUBSCRIPTION_STATUS)
		.with_variable(VAR_SUBSCRIPTION_ID, subscription.clone())
		.with_variable(VAR_SUBSCRIPTION_STATUS, status.clone());
	finish(send_control_request(&args.control, &request).await?)
}

/// Fill generator params from the command line, leaving untouched fields on
/// their random defaults.
fn trigger_params(args: &CliArgs, transport: TransportKind) -> TriggerParams {
	let mut params = TriggerParams::new(transport);
	if let Some(id) = &args.from_user {
		params.from_user_id = id.clone();
	}
	if let Some(id) = &args.to_user {
		params.to_user_id = id.clone();
	}
	if let Some(session) = &args.session {
		params.session_id = Some(session.clone());
	}
	if let Some(address) = &args.forward_address {
		params.callback = Some(address.clone());
	}
	params
}

fn record_event(trigger: &str, resolved: &ResolvedTopic, payload: &NotificationPayload) -> anyhow::Result<()> {
	let store = EventStore::open_default()?;
	store.insert(StoredEvent {
		event_id: payload.subscription.id.clone(),
		trigger: trigger.to_string(),
		version: resolved.version.clone(),
		stored_at: Utc::now(),
		payload: payload.clone(),
	})
}

/// Send the event out: to a webhook when `--forward-address` was given,
/// otherwise to the mock server over the control socket.
async fn deliver(args: &CliArgs, payload: &NotificationPayload) -> anyhow::Result<i32> {
	if let Some(address) = &args.forward_address {
		WebhookForwarder::new()
			.forward(address, args.secret.as_deref(), payload)
			.await?;
		println!("forwarded event {} to {address}", payload.subscription.id);
		return Ok(0);
	}

	let body = serde_json::to_string(payload).context("encoding event payload")?;
	let mut request = ControlRequest::new(OP_FORWARD_EVENT).with_body(body);
	if let Some(scope) = connection_scope(args)? {
		request = request.with_variable(VAR_CONNECTION_NAME, scope);
	}
	let response = send_control_request(&args.control, &request).await?;
	if response.is_success() {
		println!("event {}: {}", payload.subscription.id, response.detail);
		return Ok(i32::from(response.code.as_u8()));
	}
	finish(response)
}

/// Resolve the connection the request is scoped to. `--connection` is used
/// as given; `--session` contributes its connection part.
fn connection_scope(args: &CliArgs) -> anyhow::Result<Option<String>> {
	if let Some(name) = &args.connection {
		return Ok(Some(name.clone()));
	}
	if let Some(session) = &args.session {
		let parsed = SessionId::parse(session).with_context(|| format!("invalid --session value: {session}"))?;
		return Ok(Some(parsed.connection().to_string()));
	}
	Ok(None)
}

/// Print the server's answer and adopt its result code as the process exit
/// code.
fn finish(response: ControlResponse) -> anyhow::Result<i32> {
	if response.is_success() {
		println!("{}", response.detail);
	} else {
		eprintln!("{}: {}", response.code.label(), response.detail);
	}
	Ok(i32::from(response.code.as_u8()))
}
