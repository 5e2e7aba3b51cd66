//! Session configuration
//!
//! Everything a session needs is carried in one explicitly constructed
//! `SessionConfig`; no component looks up preferences on its own.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::RedactedString;

/// Name of the folder (under the user directory) that holds live-stream playlists
pub const REMOTE_FOLDER: &str = "remote";

/// Configuration for one camera's capture session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Camera location name
    pub camera: String,
    /// Source URI; empty while the camera is not discoverable
    pub uri: RedactedString,
    /// Directory for in-progress recordings
    pub tmp_dir: PathBuf,
    /// Directory for finished recordings
    pub archive_dir: PathBuf,
    /// Per-user data directory (live view files, playlists)
    pub user_dir: PathBuf,
    /// Maximum live-view resolution; sizes the live-view buffer body
    pub record_size: (u32, u32),
    /// Minimum free space on the tmp volume, in MB
    pub min_free_space_mb: u64,
    /// Resident memory limit, in MB (None = unlimited)
    pub memory_limit_mb: Option<u64>,
    /// Live stream and overlay settings
    pub live: LiveSettings,
    /// Clip merge threshold handed to the clip store
    pub clip_merge_threshold_secs: u32,
    /// Initial frame buffer size hint for the decode layer
    pub init_frame_size: u32,
    /// Tmp file names whose move to the archive is still pending
    pub pending_moves: Vec<String>,
    /// Force local/network source handling (None = detect from the URI)
    pub local_source: Option<bool>,
    /// Address for the embedded HTTP server
    pub http_bind: SocketAddr,
    /// Time constants
    pub timing: Timing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            camera: "camera".into(),
            uri: RedactedString::default(),
            tmp_dir: PathBuf::from("/var/lib/vigil/tmp"),
            archive_dir: PathBuf::from("/var/lib/vigil/archive"),
            user_dir: PathBuf::from("/var/lib/vigil"),
            record_size: (320, 240),
            min_free_space_mb: 1024,
            memory_limit_mb: None,
            live: LiveSettings::default(),
            clip_merge_threshold_secs: 0,
            init_frame_size: 0,
            pending_moves: Vec::new(),
            local_source: None,
            http_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            timing: Timing::default(),
        }
    }
}

impl SessionConfig {
    /// Path of this camera's live-view buffer file
    pub fn live_view_path(&self) -> PathBuf {
        self.user_dir.join("live").join(format!("{}.live", self.camera))
    }

    /// Directory holding generated playlists and segments
    pub fn remote_dir(&self) -> PathBuf {
        self.user_dir.join(REMOTE_FOLDER)
    }

    /// Base name for this camera's playlists.
    ///
    /// Characters outside `[A-Za-z0-9_]` are replaced so the name survives
    /// URL paths and the `<base>-<profile>` grammar (no `-` in the base).
    pub fn playlist_base(&self) -> String {
        self.camera
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    }
}

/// Live stream settings; changes to the first four apply on the next stream start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Bitrate cap in kbps
    pub max_bitrate: u32,
    pub enable_timestamp: bool,
    /// Maximum vertical resolution
    pub max_resolution: u32,
    pub enable_fast_start: bool,
    pub use_12hr_time: bool,
    pub use_us_date: bool,
    pub thumbnail_resolution: (u32, u32),
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            max_bitrate: 512,
            enable_timestamp: true,
            max_resolution: 480,
            enable_fast_start: true,
            use_12hr_time: true,
            use_us_date: true,
            thumbnail_resolution: (240, 135),
        }
    }
}

/// Time constants for the session. Defaults are the production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Back-off table in seconds, indexed by attempt and clamped to the last entry
    pub retry_secs: Vec<u64>,
    /// Open attempts tolerated (with sufficient disk space) before giving up
    pub max_retries: u32,
    /// Minimum back-off when the URI is empty
    pub empty_uri_min_secs: u64,
    /// No frame for this long means the stream is lost
    pub frame_timeout: Duration,
    /// How long a playlist request waits for its file to appear
    pub playlist_wait: Duration,
    pub playlist_poll: Duration,
    /// Longest gap between progress notifications (media time)
    pub max_notify_silence_ms: u64,
    /// Idle time after which a streaming profile is torn down
    pub profile_idle_timeout: Duration,
    pub ping_interval: Duration,
    /// Start-up frames of a local device kept out of analytics
    pub local_frames_to_skip: u32,
    pub free_space_check_interval: Duration,
    /// Inter-frame gap (wall clock or media time) worth a warning
    pub frame_warning_ms: u64,
    pub memory_check_interval: Duration,
    pub web_shutdown_timeout: Duration,
    /// Sleep after a tick that produced no frame
    pub idle_sleep: Duration,
    /// Upper bound on the data manager flush during teardown
    pub flush_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            retry_secs: vec![0, 20, 20, 20, 60],
            max_retries: 10,
            empty_uri_min_secs: 10,
            frame_timeout: Duration::from_millis(15_000),
            playlist_wait: Duration::from_millis(5_000),
            playlist_poll: Duration::from_millis(200),
            max_notify_silence_ms: 1_000,
            profile_idle_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(120),
            local_frames_to_skip: 25,
            free_space_check_interval: Duration::from_secs(30),
            frame_warning_ms: 1_000,
            memory_check_interval: Duration::from_secs(15 * 60),
            web_shutdown_timeout: Duration::from_secs(5),
            idle_sleep: Duration::from_millis(40),
            flush_timeout: Duration::from_secs(2),
        }
    }
}
