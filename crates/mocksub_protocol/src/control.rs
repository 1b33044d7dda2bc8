#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation names understood by the control socket.
pub const OP_RECONNECT: &str = "Reconnect";
pub const OP_FORWARD_EVENT: &str = "ForwardEvent";
pub const OP_CLOSE_CONNECTION: &str = "CloseConnection";
pub const OP_SET_SUBSCRIPTION_STATUS: &str = "SetSubscriptionStatus";

/// Well-known variable names.
pub const VAR_CONNECTION_NAME: &str = "ConnectionName";
pub const VAR_CLOSE_REASON: &str = "CloseReason";
pub const VAR_SUBSCRIPTION_ID: &str = "SubscriptionID";
pub const VAR_SUBSCRIPTION_STATUS: &str = "SubscriptionStatus";

/// One request on the control socket: an operation name, an optional opaque
/// body, and a string-to-string variable map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
	pub op: String,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub body: Option<String>,
	#[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
	pub variables: BTreeMap<String, String>,
}

impl ControlRequest {
	pub fn new(op: &str) -> Self {
		Self {
			op: op.to_string(),
			body: None,
			variables: BTreeMap::new(),
		}
	}

	pub fn with_body(mut self, body: impl Into<String>) -> Self {
		self.body = Some(body.into());
		self
	}

	pub fn with_variable(mut self, name: &str, value: impl Into<String>) -> Self {
		self.variables.insert(name.to_string(), value.into());
		self
	}

	/// Look up a variable, treating whitespace-only values as absent.
	pub fn variable(&self, name: &str) -> Option<&str> {
		self.variables
			.get(name)
			.map(String::as_str)
			.filter(|v| !v.trim().is_empty())
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown control result code: {0}")]
pub struct UnknownControlCode(pub u8);

/// Result codes on control responses. Serialized as their numeric value so
/// non-Rust tooling can match on them without a name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ControlCode {
	Success,
	InvalidOperation,
	FailedOnServer,
	MissingArgument,
}

impl ControlCode {
	pub const fn as_u8(self) -> u8 {
		match self {
			ControlCode::Success => 0,
			ControlCode::InvalidOperation => 1,
			ControlCode::FailedOnServer => 2,
			ControlCode::MissingArgument => 3,
		}
	}

	pub const fn label(self) -> &'static str {
		match self {
			ControlCode::Success => "success",
			ControlCode::InvalidOperation => "invalid operation",
			ControlCode::FailedOnServer => "failed on server",
			ControlCode::MissingArgument => "missing argument",
		}
	}
}

impl From<ControlCode> for u8 {
	fn from(code: ControlCode) -> u8 {
		code.as_u8()
	}
}

impl TryFrom<u8> for ControlCode {
	type Error = UnknownControlCode;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(ControlCode::Success),
			1 => Ok(ControlCode::InvalidOperation),
			2 => Ok(ControlCode::FailedOnServer),
			3 => Ok(ControlCode::MissingArgument),
			other => Err(UnknownControlCode(other)),
		}
	}
}

/// Response to a control request: a result code plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
	pub code: ControlCode,
	pub detail: String,
}

impl ControlResponse {
	pub fn success(detail: impl Into<String>) -> Self {
		Self {
			code: ControlCode::Success,
			detail: detail.into(),
		}
	}

	pub fn invalid_operation(detail: impl Into<String>) -> Self {
		Self {
			code: ControlCode::InvalidOperation,
			detail: detail.into(),
		}
	}

	pub fn failed(detail: impl Into<String>) -> Self {
		Self {
			code: ControlCode::FailedOnServer,
			detail: detail.into(),
		}
	}

	pub fn missing_argument(detail: impl Into<String>) -> Self {
		Self {
			code: ControlCode::MissingArgument,
			detail: detail.into(),
		}
	}

	pub fn is_success(&self) -> bool {
		self.code == ControlCode::Success
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_roundtrip_as_numbers() {
		for code in [
			ControlCode::Success,
			ControlCode::InvalidOperation,
			ControlCode::FailedOnServer,
			ControlCode::MissingArgument,
		] {
			let json = serde_json::to_string(&code).unwrap();
			assert_eq!(json, code.as_u8().to_string());
			let back: ControlCode = serde_json::from_str(&json).unwrap();
			assert_eq!(back, code);
		}
	}

	#[test]
	fn unknown_code_is_rejected() {
		let err = serde_json::from_str::<ControlCode>("7").unwrap_err();
		assert!(err.to_string().contains("unknown control result code"));
	}

	#[test]
	fn empty_variables_are_omitted() {
		let req = ControlRequest::new(OP_RECONNECT);
		let json = serde_json::to_value(&req).unwrap();
		let obj = json.as_object().unwrap();
		assert!(!obj.contains_key("variables"));
		assert!(!obj.contains_key("body"));
		assert_eq!(obj["op"], OP_RECONNECT);
	}

	#[test]
	fn variable_lookup_ignores_blank_values() {
		let req = ControlRequest::new(OP_CLOSE_CONNECTION)
			.with_variable(VAR_CONNECTION_NAME, "d27e05af")
			.with_variable(VAR_CLOSE_REASON, "   ");

		assert_eq!(req.variable(VAR_CONNECTION_NAME), Some("d27e05af"));
		assert_eq!(req.variable(VAR_CLOSE_REASON), None);
		assert_eq!(req.variable("Nope"), None);
	}

	#[test]
	fn request_roundtrip_with_body() {
		let req = ControlRequest::new(OP_FORWARD_EVENT)
			.with_body(r#"{"subscription":{},"event":{}}"#)
			.with_variable(VAR_CONNECTION_NAME, "d27e05af");

		let json = serde_json::to_string(&req).unwrap();
		let back: ControlRequest = serde_json::from_str(&json).unwrap();
		assert_eq!(back, req);
	}
}
