//! Synthetic collaborators for running a session without a camera
//!
//! `TestStreamReader` produces gradient frames at a fixed rate once opened
//! and writes playlist files for live streams it is asked to start, so the
//! HTTP routes have something to serve.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::command::MmapParams;
use crate::frame::VideoFrame;
use crate::pipeline::{
    AnalyticsPipeline, ClipStore, DataManager, OpenOptions, PipelineFactory, StreamReader, TimestampFlags,
    MAX_SNAPSHOT_DIMENSION,
};

/// Configuration for the synthetic decode layer
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    pub name: String,
    /// Frames per second
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Open attempts that fail before one succeeds
    pub fail_opens: u32,
    /// Every Nth frame is a dummy frame (0 = never)
    pub dummy_interval: u64,
    /// Stop delivering (and report not running) after this many frames
    pub stop_after: Option<u64>,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            name: "test".into(),
            fps: 15,
            width: 320,
            height: 240,
            fail_opens: 0,
            dummy_interval: 0,
            stop_after: None,
        }
    }
}

#[derive(Debug, Default)]
struct SourceState {
    name: String,
    fail_opens: u32,
    opened_at: Option<Instant>,
    delivered: u64,
    newest: Option<VideoFrame>,
    live: BTreeMap<u32, PathBuf>,
    limits: Option<(u32, u32)>,
    mmap: Option<MmapParams>,
    volume: u32,
    failed_moves: Vec<String>,
}

/// Decode layer that synthesizes frames
#[derive(Debug)]
pub struct TestStreamReader {
    config: TestSourceConfig,
    state: Mutex<SourceState>,
}

impl TestStreamReader {
    pub fn new(config: TestSourceConfig) -> Self {
        let state = SourceState {
            name: config.name.clone(),
            fail_opens: config.fail_opens,
            volume: 100,
            ..Default::default()
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Profiles currently streaming
    pub fn live_profiles(&self) -> Vec<u32> {
        self.state().live.keys().copied().collect()
    }

    /// Last limits set with `set_live_stream_limits`
    pub fn live_stream_limits(&self) -> Option<(u32, u32)> {
        self.state().limits
    }

    pub fn frames_delivered(&self) -> u64 {
        self.state().delivered
    }

    pub fn mmap_params(&self) -> Option<MmapParams> {
        self.state().mmap
    }

    pub fn audio_volume(&self) -> u32 {
        self.state().volume
    }

    /// Pretend a finished recording could not be archived to `target`
    pub fn report_failed_move(&self, target: &str) {
        self.state().failed_moves.push(target.to_string());
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.config.fps.max(1) as u64)
    }

    fn render(&self, index: u64) -> VideoFrame {
        let ms = index * 1000 / self.config.fps.max(1) as u64;
        if self.config.dummy_interval > 0 && index % self.config.dummy_interval == self.config.dummy_interval - 1 {
            return VideoFrame::dummy(ms);
        }

        let (w, h) = (self.config.width.max(1), self.config.height.max(1));
        let shift = (index * 4) as u8;
        let img = RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([
                (x * 255 / w) as u8,
                (y * 255 / h) as u8,
                shift,
            ])
        });
        VideoFrame::rgb(ms, w, h, Bytes::from(img.into_raw()))
    }
}

impl StreamReader for TestStreamReader {
    fn location_name(&self) -> String {
        self.state().name.clone()
    }

    fn set_location_name(&self, name: &str) {
        self.state().name = name.to_string();
    }

    fn open(&self, uri: &str, options: &OpenOptions) -> Result<()> {
        let mut state = self.state();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            bail!("test source refused to open ({} failures left)", state.fail_opens);
        }
        info!(
            uri,
            fps = self.config.fps,
            init_frame_size = options.init_frame_size,
            "Test source opened"
        );
        state.opened_at = Some(Instant::now());
        state.delivered = 0;
        state.newest = None;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state();
        if state.opened_at.take().is_some() {
            info!(frames = state.delivered, "Test source closed");
        }
        state.live.clear();
    }

    fn is_running(&self) -> bool {
        let state = self.state();
        let exhausted = self
            .config
            .stop_after
            .map_or(false, |limit| state.delivered >= limit);
        state.opened_at.is_some() && !exhausted
    }

    fn next_frame(&self) -> Option<VideoFrame> {
        let (index, opened_at) = {
            let state = self.state();
            (state.delivered, state.opened_at?)
        };
        if self.config.stop_after.map_or(false, |limit| index >= limit) {
            return None;
        }
        let due = opened_at + self.frame_interval() * index as u32;
        if Instant::now() < due {
            return None;
        }

        let frame = self.render(index);
        let mut state = self.state();
        state.delivered += 1;
        if !frame.is_dummy() {
            state.newest = Some(frame.clone());
        }
        if state.delivered % 300 == 0 {
            debug!("Test source: {} frames generated", state.delivered);
        }
        Some(frame)
    }

    fn proc_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn initial_frame_buffer_size(&self) -> u32 {
        self.config.width * self.config.height * 3
    }

    fn newest_frame_jpeg(&self, width: u32, height: u32) -> Result<Bytes> {
        if width == 0 || height == 0 || width.max(height) > MAX_SNAPSHOT_DIMENSION {
            bail!("snapshot size {}x{} out of range", width, height);
        }
        let Some(frame) = self.state().newest.clone() else {
            bail!("no frame decoded yet");
        };
        let img = RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())
            .context("frame payload does not match its size")?;
        let scaled = imageops::resize(&img, width, height, FilterType::Triangle);

        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new(&mut out).encode_image(&scaled)?;
        Ok(Bytes::from(out.into_inner()))
    }

    fn enable_live_stream(
        &self,
        profile: u32,
        playlist: &Path,
        timestamps: TimestampFlags,
        start_index: u64,
    ) -> Result<()> {
        if let Some(dir) = playlist.parent() {
            fs::create_dir_all(dir)?;
        }
        let stem = playlist
            .file_stem()
            .and_then(|s| s.to_str())
            .context("playlist has no file name")?;

        let body = if profile == 0 {
            // Master playlist: one variant per further profile
            let variants: String = self
                .state()
                .live
                .keys()
                .filter(|&&p| p != 0)
                .map(|p| format!("#EXT-X-STREAM-INF:BANDWIDTH=512000\n{}-{}.m3u8\n", stem, p))
                .collect();
            format!("#EXTM3U\n{}", variants)
        } else {
            let mut body = format!(
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{}\n",
                start_index
            );
            for index in start_index..start_index + 3 {
                body.push_str(&format!("#EXTINF:2.0,\n{}-{}{}.ts\n", stem, profile % 10, index));
            }
            body
        };
        fs::write(playlist, body).with_context(|| format!("writing {}", playlist.display()))?;

        info!(profile, timestamps = timestamps.0, start_index, "Test live stream started");
        self.state().live.insert(profile, playlist.to_path_buf());
        Ok(())
    }

    fn disable_live_stream(&self, profile: u32) {
        if self.state().live.remove(&profile).is_some() {
            info!(profile, "Test live stream stopped");
        }
    }

    fn set_live_stream_limits(&self, max_resolution: u32, max_bitrate: u32) -> Result<()> {
        self.state().limits = Some((max_resolution, max_bitrate));
        Ok(())
    }

    fn flush(&self, until_ms: Option<u64>) {
        debug!(?until_ms, "Test source flush");
    }

    fn set_mmap_params(&self, params: MmapParams) {
        self.state().mmap = Some(params);
    }

    fn set_audio_volume(&self, volume: u32) {
        self.state().volume = volume;
    }

    fn take_failed_moves(&self) -> Vec<String> {
        std::mem::take(&mut self.state().failed_moves)
    }
}

/// Data manager that finishes every frame as soon as it is reported
#[derive(Debug, Default)]
pub struct ImmediateDataManager {
    finished_ms: u64,
    frames: u64,
    thumbnail: (u32, u32),
    analytics_port: Option<u16>,
}

impl ImmediateDataManager {
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn thumbnail_resolution(&self) -> (u32, u32) {
        self.thumbnail
    }

    pub fn analytics_port(&self) -> Option<u16> {
        self.analytics_port
    }
}

impl DataManager for ImmediateDataManager {
    fn report_frame(&mut self, ms: u64, frame: Option<&VideoFrame>) {
        if frame.is_some() {
            self.frames += 1;
            self.finished_ms = self.finished_ms.max(ms);
        }
    }

    fn take_new_object_count(&mut self) -> u32 {
        0
    }

    fn finished_timestamp(&self) -> u64 {
        self.finished_ms
    }

    fn flush(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        self.finished_ms = 0;
    }

    fn terminate(&mut self) {
        debug!(frames = self.frames, "Data manager terminated");
    }

    fn set_thumbnail_resolution(&mut self, width: u32, height: u32) {
        self.thumbnail = (width, height);
    }

    fn set_analytics_port(&mut self, port: u16) {
        self.analytics_port = Some(port);
    }
}

/// Analytics pipeline that only counts frames
#[derive(Debug)]
pub struct CountingPipeline {
    camera: String,
    frames: u64,
}

impl CountingPipeline {
    pub fn new(camera: &str) -> Self {
        Self {
            camera: camera.to_string(),
            frames: 0,
        }
    }

    /// Factory creating a fresh counting pipeline per stream open
    pub fn factory() -> Box<dyn PipelineFactory> {
        Box::new(|camera: &str| -> Box<dyn AnalyticsPipeline> { Box::new(CountingPipeline::new(camera)) })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl AnalyticsPipeline for CountingPipeline {
    fn process_frame(&mut self, _frame: &VideoFrame, _ms: u64) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        debug!(camera = %self.camera, frames = self.frames, "Pipeline flushed");
        Ok(())
    }

    fn update_video_path(&mut self, camera: &str) {
        self.camera = camera.to_string();
    }
}

/// Clip store kept in memory
#[derive(Debug, Default)]
pub struct MemoryClipStore {
    thresholds: HashMap<String, u32>,
    saved: HashMap<String, Vec<(u64, u64)>>,
}

impl MemoryClipStore {
    pub fn merge_threshold(&self, camera: &str) -> Option<u32> {
        self.thresholds.get(camera).copied()
    }

    pub fn saved_times(&self, camera: &str) -> &[(u64, u64)] {
        self.saved.get(camera).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl ClipStore for MemoryClipStore {
    fn set_merge_threshold(&mut self, camera: &str, threshold_secs: u32) {
        self.thresholds.insert(camera.to_string(), threshold_secs);
    }

    fn mark_times_saved(&mut self, camera: &str, ranges: &[(u64, u64)]) {
        self.saved
            .entry(camera.to_string())
            .or_default()
            .extend_from_slice(ranges);
    }
}
