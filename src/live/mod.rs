//! # Realtime Voice Session
//!
//! The live pipeline binding capture, the remote voice service and playback:
//!
//! ```text
//! microphone → capture → codec (encode) → session (send) → [remote service]
//!            → session (receive) → codec (decode) → scheduler (play)
//! ```
//!
//! ## Modules:
//! - **error**: tagged `Permission | Decode | Transport` errors
//! - **protocol**: JSON messages of the realtime service
//! - **transport**: WebSocket channel and the connector seam
//! - **session**: the state machine and its driver task
//! - **hub**: the process-wide session owner used by the HTTP layer

pub mod error;
pub mod hub;
pub mod protocol;
pub mod session;
pub mod transport;
