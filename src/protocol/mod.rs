//! Task message protocol
//!
//! Envelope validation and the codec that turns deliveries in protocol v1,
//! protocol v2 or an opaque shape into [`TaskInvocation`]s.

pub mod codec;
pub mod envelope;
pub mod invocation;

pub use codec::{OutgoingTask, ProtocolCodec};
pub use envelope::{validate_content, Envelope, CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON};
pub use invocation::{ProtocolVersion, RetryPolicy, TaskHeaders, TaskInvocation, TimeLimit};
