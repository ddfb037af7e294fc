//! warroom - realtime voice session client for a generative-AI live backend.
//!
//! Microphone audio is captured at 16 kHz, encoded as base64 PCM16 and
//! streamed over a WebSocket; the model's 24 kHz audio replies are decoded
//! and scheduled back-to-back on the speaker.

pub mod audio;
pub mod config;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod session;

pub use config::Config;
pub use error::SessionError;
pub use session::{LiveSession, SessionEvent, SessionState};
