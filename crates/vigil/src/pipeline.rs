//! Collaborators the session orchestrates but does not implement
//!
//! The decode layer, the analytics pipeline, the data manager and the clip
//! store are native or out-of-process components. The session only relies
//! on the interfaces below.

use anyhow::Result;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;

use crate::command::MmapParams;
use crate::config::LiveSettings;
use crate::frame::VideoFrame;

/// Overlay flags for live stream timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampFlags(pub u8);

impl TimestampFlags {
    pub const ENABLED: u8 = 0b001;
    pub const TWELVE_HOUR: u8 = 0b010;
    pub const US_DATE: u8 = 0b100;

    pub fn from_settings(live: &LiveSettings) -> Self {
        if !live.enable_timestamp {
            return Self(0);
        }
        let mut flags = Self::ENABLED;
        if live.use_12hr_time {
            flags |= Self::TWELVE_HOUR;
        }
        if live.use_us_date {
            flags |= Self::US_DATE;
        }
        Self(flags)
    }

    pub fn is_enabled(&self) -> bool {
        self.0 & Self::ENABLED != 0
    }
}

/// Largest snapshot edge, in pixels, the decode layer is asked to render
pub const MAX_SNAPSHOT_DIMENSION: u32 = 4096;

/// Options handed to the decode layer when opening a source
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub init_frame_size: u32,
    pub live: LiveSettings,
}

/// The decode layer: demuxes and decodes the camera stream.
///
/// Shared between the session's main loop and HTTP handler tasks, so every
/// method takes `&self`; implementations synchronize internally. Callers that
/// touch the current frame from another task hold the session's stream guard.
pub trait StreamReader: Send + Sync {
    /// External-facing camera name
    fn location_name(&self) -> String;
    fn set_location_name(&self, name: &str);

    /// Open the source. Errors are transient; the caller retries.
    fn open(&self, uri: &str, options: &OpenOptions) -> Result<()>;
    /// Close the source and finish any in-progress recording
    fn close(&self);
    /// False once the source has stopped delivering (EOF, disconnect)
    fn is_running(&self) -> bool;

    /// Newest decoded frame, if one arrived since the last call. Never blocks.
    fn next_frame(&self) -> Option<VideoFrame>;
    /// Frame size negotiated for processing
    fn proc_size(&self) -> (u32, u32);
    /// Frame buffer size hint for the next incarnation
    fn initial_frame_buffer_size(&self) -> u32;
    /// Newest frame re-encoded as a JPEG at the given size, each edge at
    /// most [`MAX_SNAPSHOT_DIMENSION`]
    fn newest_frame_jpeg(&self, width: u32, height: u32) -> Result<Bytes>;

    fn enable_live_stream(
        &self,
        profile: u32,
        playlist: &Path,
        timestamps: TimestampFlags,
        start_index: u64,
    ) -> Result<()>;
    fn disable_live_stream(&self, profile: u32);
    fn set_live_stream_limits(&self, max_resolution: u32, max_bitrate: u32) -> Result<()>;

    fn flush(&self, until_ms: Option<u64>);
    fn set_mmap_params(&self, params: MmapParams);
    fn set_audio_volume(&self, volume: u32);

    /// Archive targets of recordings whose background move failed since the
    /// last call
    fn take_failed_moves(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The analytics pipeline for one camera
pub trait AnalyticsPipeline: Send {
    fn process_frame(&mut self, frame: &VideoFrame, ms: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn update_video_path(&mut self, camera: &str);
}

/// Creates an analytics pipeline each time the source (re)opens
pub trait PipelineFactory: Send {
    fn create(&mut self, camera: &str) -> Box<dyn AnalyticsPipeline>;
}

impl<F> PipelineFactory for F
where
    F: FnMut(&str) -> Box<dyn AnalyticsPipeline> + Send,
{
    fn create(&mut self, camera: &str) -> Box<dyn AnalyticsPipeline> {
        self(camera)
    }
}

/// Consumer of frame timestamps and analytics results
pub trait DataManager: Send {
    /// Report a frame; `frame` is `None` for interpolation-only frames
    fn report_frame(&mut self, ms: u64, frame: Option<&VideoFrame>);
    /// Objects recorded since the previous call (resets the count)
    fn take_new_object_count(&mut self) -> u32;
    /// Media time up to which processing has finished
    fn finished_timestamp(&self) -> u64;
    fn flush(&mut self, timeout: Duration) -> Result<()>;
    fn reset(&mut self);
    fn terminate(&mut self);
    fn set_thumbnail_resolution(&mut self, width: u32, height: u32);
    fn set_analytics_port(&mut self, port: u16);
}

/// Clip bookkeeping shared with the decode layer
pub trait ClipStore: Send {
    fn set_merge_threshold(&mut self, camera: &str, threshold_secs: u32);
    fn mark_times_saved(&mut self, camera: &str, ranges: &[(u64, u64)]);
}
