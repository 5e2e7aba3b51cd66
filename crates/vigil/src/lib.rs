//! Vigil - per-camera capture supervisor
//!
//! One `CaptureSession` per camera: it opens the stream with back-off,
//! pumps decoded frames into analytics, publishes a live-view buffer,
//! serves snapshots and HLS playlists over an embedded HTTP server and
//! talks to its supervisor through bounded mailboxes.
//!
//! The decode layer, analytics pipeline, data manager and clip store are
//! collaborators behind the traits in [`pipeline`]. The `test-source`
//! feature provides synthetic implementations that need no camera.

// Core modules
mod command;
mod error;
mod frame;

pub use command::*;
pub use error::SessionError;
pub use frame::{classify, FrameClass, FrameFlags, VideoFrame};

pub mod config;
pub mod fps;
pub mod live_view;
pub mod logging;
pub mod mailbox;
pub mod pipeline;
pub mod profiles;
pub mod session;
pub mod system;
pub mod web;

pub use config::{LiveSettings, SessionConfig, Timing};
pub use mailbox::{events, mailbox, ControlSender, EventReceiver, EventSender, Mailbox, Polled};
pub use session::{retry_delay, CaptureSession, Collaborators, SessionState, SessionStats};

// Synthetic decode layer and collaborators
#[cfg(feature = "test-source")]
pub mod synthetic;
