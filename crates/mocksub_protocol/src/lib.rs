#![forbid(unsafe_code)]

pub mod control;
pub mod framing;
pub mod messages;

pub use control::{ControlCode, ControlRequest, ControlResponse};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use messages::{
	KeepaliveMessage, MessageMetadata, NotificationMessage, NotificationPayload, SessionMessage, SubscriptionData,
	TransportData, peek_message_type,
};
