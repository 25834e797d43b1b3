//! # Audio Module
//!
//! Everything between raw samples and the realtime voice channel.
//!
//! ## Key Components:
//! - **Codec**: PCM16LE <-> base64 <-> float buffers
//! - **Scheduler**: gapless playback cursor plus the active source set
//! - **Outputs**: the platform playback capability the scheduler drives
//! - **Capture**: microphone (or file) frames encoded into outbound packets
//! - **Reorder**: releases concurrently decoded chunks in arrival order
//!
//! ## Audio Formats:
//! - **Outbound**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Inbound**: 24kHz, 16-bit PCM, mono, little-endian

pub mod buffer; // Planar float buffers
pub mod capture; // Capture sources and the encode pipeline
pub mod codec; // PCM16 and base64 conversions
#[cfg(feature = "device")]
pub mod device; // cpal input/output
pub mod output; // AudioOutput trait and headless outputs
pub mod reorder; // Sequence-ordered release
pub mod scheduler; // Playback cursor and active sources
