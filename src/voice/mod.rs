//! # Realtime Voice
//!
//! The voice session relay: browser commands in, provider frames out, provider
//! events normalized and folded back into browser events.
//!
//! ## Module Structure:
//! - `protocol`: wire types for both sides of the relay
//! - `events`: provider event normalization
//! - `transcript`: partial user/assistant text
//! - `tools`: tool-call assembly and tool result payloads
//! - `upstream`: the provider WebSocket connection
//! - `coordinator`: the per-connection session state machine
//! - `session`: keeps the history across coordinator restarts

pub mod coordinator;
pub mod events;
pub mod protocol;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod tools;
pub mod transcript;
pub mod upstream;

pub use coordinator::{Coordinator, Downstream, VoiceSettings};
pub use protocol::{ClientCommand, ClientEvent};
pub use session::VoiceSession;
pub use upstream::{RealtimeClient, UpstreamNotice};
