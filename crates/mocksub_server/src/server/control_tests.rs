#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mocksub_protocol::control::{
	ControlCode, ControlRequest, OP_CLOSE_CONNECTION, OP_FORWARD_EVENT, OP_RECONNECT, OP_SET_SUBSCRIPTION_STATUS,
	VAR_CLOSE_REASON, VAR_CONNECTION_NAME, VAR_SUBSCRIPTION_ID, VAR_SUBSCRIPTION_STATUS,
};
use serde_json::json;

use crate::config::ServerTiming;
use crate::server::control::dispatch;
use crate::server::manager::{Manager, ManagerSettings};
use crate::util::endpoint::WsEndpoint;

fn manager() -> Arc<Manager> {
	Manager::new(ManagerSettings {
		public_endpoint: WsEndpoint {
			host: "127.0.0.1".to_string(),
			port: 9900,
		},
		timing: ServerTiming {
			reconnect_grace: Duration::from_millis(50),
			..ServerTiming::default()
		},
		strict_subscriptions: true,
		admin_client_id: "mocksub-cli".to_string(),
	})
}

#[tokio::test]
async fn unknown_operation_is_rejected_without_side_effects() {
	let manager = manager();
	let response = dispatch(&manager, ControlRequest::new("Explode")).await;

	assert_eq!(response.code, ControlCode::InvalidOperation);
	assert_eq!(manager.instance_count(), 1);
	assert!(!manager.handoff_in_progress());
}

#[tokio::test]
async fn reconnect_succeeds_once_then_fails_while_in_flight() {
	let manager = manager();

	let first = dispatch(&manager, ControlRequest::new(OP_RECONNECT)).await;
	assert_eq!(first.code, ControlCode::Success);
	assert!(
		first.detail.contains(manager.primary().id()),
		"detail should name the new primary, got: {}",
		first.detail
	);

	let second = dispatch(&manager, ControlRequest::new(OP_RECONNECT)).await;
	assert_eq!(second.code, ControlCode::FailedOnServer);
}

#[tokio::test]
async fn forward_event_requires_a_body_and_a_parsable_payload() {
	let manager = manager();

	let missing = dispatch(&manager, ControlRequest::new(OP_FORWARD_EVENT)).await;
	assert_eq!(missing.code, ControlCode::MissingArgument);

	let garbage = dispatch(&manager, ControlRequest::new(OP_FORWARD_EVENT).with_body("{not json")).await;
	assert_eq!(garbage.code, ControlCode::FailedOnServer);
}

#[tokio::test]
async fn close_connection_validates_arguments_before_acting() {
	let manager = manager();

	let no_name = dispatch(&manager, ControlRequest::new(OP_CLOSE_CONNECTION)).await;
	assert_eq!(no_name.code, ControlCode::MissingArgument);

	let no_reason = dispatch(
		&manager,
		ControlRequest::new(OP_CLOSE_CONNECTION).with_variable(VAR_CONNECTION_NAME, "d27e05af"),
	)
	.await;
	assert_eq!(no_reason.code, ControlCode::MissingArgument);

	let bad_reason = dispatch(
		&manager,
		ControlRequest::new(OP_CLOSE_CONNECTION)
			.with_variable(VAR_CONNECTION_NAME, "d27e05af")
			.with_variable(VAR_CLOSE_REASON, "9999"),
	)
	.await;
	assert_eq!(bad_reason.code, ControlCode::FailedOnServer);

	let unknown_conn = dispatch(
		&manager,
		ControlRequest::new(OP_CLOSE_CONNECTION)
			.with_variable(VAR_CONNECTION_NAME, "d27e05af")
			.with_variable(VAR_CLOSE_REASON, "4001"),
	)
	.await;
	assert_eq!(unknown_conn.code, ControlCode::FailedOnServer);
}

#[tokio::test]
async fn set_subscription_status_overrides_a_registry_record() {
	let manager = manager();
	let record = manager
		.primary()
		.registry
		.create(
			"client-a",
			"channel.cheer",
			"1",
			json!({"broadcaster_user_id": "123"}),
			"conn1",
			Utc::now(),
		)
		.expect("subscription created");

	let missing_status = dispatch(
		&manager,
		ControlRequest::new(OP_SET_SUBSCRIPTION_STATUS).with_variable(VAR_SUBSCRIPTION_ID, record.id.as_str()),
	)
	.await;
	assert_eq!(missing_status.code, ControlCode::MissingArgument);

	let bad_status = dispatch(
		&manager,
		ControlRequest::new(OP_SET_SUBSCRIPTION_STATUS)
			.with_variable(VAR_SUBSCRIPTION_ID, record.id.as_str())
			.with_variable(VAR_SUBSCRIPTION_STATUS, "vaporized"),
	)
	.await;
	assert_eq!(bad_status.code, ControlCode::FailedOnServer);

	let ok = dispatch(
		&manager,
		ControlRequest::new(OP_SET_SUBSCRIPTION_STATUS)
			.with_variable(VAR_SUBSCRIPTION_ID, record.id.as_str())
			.with_variable(VAR_SUBSCRIPTION_STATUS, "user_removed"),
	)
	.await;
	assert_eq!(ok.code, ControlCode::Success);

	let listed = manager.primary().registry.list("client-a", false);
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].status.as_str(), "user_removed");

	let unknown_id = dispatch(
		&manager,
		ControlRequest::new(OP_SET_SUBSCRIPTION_STATUS)
			.with_variable(VAR_SUBSCRIPTION_ID, "no-such-id")
			.with_variable(VAR_SUBSCRIPTION_STATUS, "enabled"),
	)
	.await;
	assert_eq!(unknown_id.code, ControlCode::FailedOnServer);
}
