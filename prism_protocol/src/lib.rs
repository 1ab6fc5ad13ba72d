//! JSON-framed wire protocol and the dual per-connection state machines
//! (spec §4.4, §4.5, components C4 and C5).

pub mod framing;
pub mod inbound;
pub mod outbound;
pub mod wire;

pub use framing::{FrameCodec, InboundFrame};
pub use inbound::{handle_connection, ForwardEnqueuer, SessionError};
pub use outbound::{run_job, OutboundJob, OutboundOutcome};
