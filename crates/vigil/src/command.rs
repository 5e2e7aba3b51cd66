//! Control protocol between a capture session and its supervisor
//!
//! `ControlMessage` flows supervisor -> session and is drained by the
//! session's dispatcher once per main-loop iteration. `SessionEvent` flows
//! session -> supervisor. Both are closed enums with named fields and
//! serialize with serde so the worker binary can bridge them across the
//! process boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A string wrapper that redacts its contents in Debug output.
///
/// Camera URIs routinely embed credentials; they are held in this wrapper so
/// a stray `{:?}` never leaks them into a log. Serializes transparently.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedactedString(pub String);

impl RedactedString {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"***\"")
    }
}

impl From<String> for RedactedString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RedactedString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reason string reported upstream when the system volume is nearly full
pub const LOW_DISK_SPACE_REASON: &str = "Low disk space on system volume";

/// Messages delivered to a running session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Stop the session. When `response` is set it is echoed back upstream
    /// as `SessionEvent::QuitResponse` after teardown.
    Quit { response: Option<String> },
    /// Start publishing frames into the live-view buffer
    EnableLiveView,
    /// Stop publishing and unmap the live-view buffer
    DisableLiveView,
    /// Ask the decode layer to flush recorded video
    FlushVideo { until_ms: Option<u64> },
    /// Rename the camera (decode layer name and analytics pipeline path)
    RenameCamera { name: String },
    /// Live-view geometry and requested frame rate
    SetMmapParams(MmapParams),
    /// Clock display preferences used for timestamp overlays
    SetTimePrefs { use_12hr_time: bool, use_us_date: bool },
    /// Clip merge threshold for the clip store
    SetClipMergeThreshold { threshold_secs: u32 },
    /// A single named video setting
    SetVideoSetting(VideoSetting),
    /// Log filter directives (`tracing_subscriber::EnvFilter` syntax)
    SetDebugConfig { directives: String },
    /// Audio volume for the live stream (0-100)
    SetAudioVolume { volume: u32 },
    /// The camera's URI changed (e.g. after network discovery)
    CameraUriUpdated { uri: RedactedString },
    /// The analytics service moved to a new port
    AnalyticsPortChanged { port: u16 },
    /// Mark time ranges (ms) as saved so the clip store keeps them
    AddSavedTimes { ranges: Vec<(u64, u64)> },
    /// Acknowledgement for `SessionEvent::CanTerminate`
    CanTerminate,
}

/// Parameters for the live-view buffer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MmapParams {
    /// Whether the large (active) view is requested
    pub large_view: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Named video settings the supervisor can change at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoSetting {
    /// Live stream bitrate cap in kbps
    MaxBitrate(u32),
    /// Burn a timestamp into live stream frames
    EnableTimestamp(bool),
    /// Live stream maximum vertical resolution
    MaxResolution(u32),
    /// Start live streams with a short first segment
    EnableFastStart(bool),
    /// Thumbnail resolution for the data manager
    ThumbnailResolution(u32, u32),
}

impl VideoSetting {
    /// Settings that only take effect on the next live stream (re)start
    pub fn is_live_stream_setting(&self) -> bool {
        !matches!(self, VideoSetting::ThumbnailResolution(..))
    }
}

/// Messages a session sends to its supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The source opened; `frame_size` is the negotiated processing size
    StreamOpenSucceeded {
        camera: String,
        frame_size: (u32, u32),
    },
    /// An open attempt failed; `reason` is set for non-network causes
    StreamOpenFailed {
        camera: String,
        reason: Option<String>,
    },
    /// Analytics finished processing up to `processed_ms`
    ProcessedData { camera: String, processed_ms: u64 },
    /// Periodic keep-alive
    Ping { camera: String },
    /// The process exceeded its memory limit and is quitting
    MemoryLimitExceeded { camera: String, rss_bytes: u64 },
    /// The embedded HTTP server is listening on a new port
    PortChanged { camera: String, port: u16 },
    /// The session is ready to be terminated once pending saves are done
    CanTerminate { camera: String },
    /// The supervisor may now kill this process
    Terminate { camera: String },
    /// A recorded file could not be moved to the archive
    FileMoveFailed { camera: String, target: String },
    /// Rename acknowledgement
    CameraRenamed { old: String, new: String },
    /// Initial frame buffer size to use for the next incarnation
    FrameSizeUpdated { camera: String, size: u32 },
    /// Echo of `ControlMessage::Quit { response }`
    QuitResponse { token: String },
}

/// Strip user-info (credentials) from a camera URI so it can be logged.
pub fn sanitize_uri(uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) => {
            if !parsed.username().is_empty() || parsed.password().is_some() {
                let _ = parsed.set_username("");
                let _ = parsed.set_password(None);
            }
            parsed.to_string()
        }
        Err(_) => match uri.rfind('@') {
            Some(at) => uri[at + 1..].to_string(),
            None => uri.to_string(),
        },
    }
}

/// Whether a URI names a locally attached device rather than a network stream.
pub fn is_local_uri(uri: &str) -> bool {
    uri.starts_with("device:")
}
