//! Control plane for an external interactive coding-agent subprocess.
//!
//! The agent binary is treated as an opaque capability: it accepts prompts
//! and tool-result replies on stdin and emits newline-delimited events on
//! stdout. This crate guards its one-reply-per-turn question protocol,
//! enriches the raw event stream with timing/diff/subagent metadata, and
//! mediates execute/continue/interrupt/kill per session.

pub mod enricher;
pub mod errors;
pub mod events;
pub mod markers;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod turn;

pub use enricher::*;
pub use errors::*;
pub use events::*;
pub use markers::*;
pub use protocol::*;
pub use session::*;
pub use transport::*;
pub use turn::*;
