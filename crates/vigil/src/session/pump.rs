//! Frame pump

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{CaptureSession, SessionState};
use crate::command::{ControlMessage, SessionEvent};
use crate::error::SessionError;
use crate::frame::{classify, FrameClass, VideoFrame};

impl CaptureSession {
    /// Pull and route one frame. Returns whether a frame arrived.
    ///
    /// A missing frame from a stopped source, or no frame for longer than
    /// the frame timeout, reconnects; that is the only error path.
    pub(crate) async fn process_frame(&mut self) -> Result<bool, SessionError> {
        let frame = self.reader.next_frame();
        let now = Instant::now();

        if let Some(previous) = self.last_tick {
            let gap_ms = now.duration_since(previous).as_millis() as u64;
            if gap_ms > self.config.timing.frame_warning_ms {
                warn!(camera = %self.camera, gap_ms, "Large inter-frame delay");
            }
        }
        self.last_tick = Some(now);

        let Some(frame) = frame else {
            if !self.reader.is_running() {
                warn!(camera = %self.camera, "Stream not running");
                self.reconnect().await?;
            } else if now.duration_since(self.last_frame_at) > self.config.timing.frame_timeout {
                warn!(
                    camera = %self.camera,
                    since_last_ms = now.duration_since(self.last_frame_at).as_millis() as u64,
                    "Stream timeout"
                );
                self.reconnect().await?;
            }
            return Ok(false);
        };

        self.last_frame_at = now;
        self.last_ms = frame.ms;

        if self.live_view_enabled {
            if !self.live_view.is_open() {
                self.open_live_view().await;
            }
            if let Err(e) = self.live_view.publish(&frame) {
                debug!("Live view publish failed: {}", e);
            }
        }

        let class = classify(
            self.local_source,
            self.initial_skipped,
            self.config.timing.local_frames_to_skip,
            &frame,
        );
        match class {
            FrameClass::Skipped => {
                self.initial_skipped += 1;
                self.frames_skipped += 1;
            }
            FrameClass::Interpolated => {
                self.frames_interpolated += 1;
                self.data_manager.report_frame(frame.ms, None);
            }
            FrameClass::Processed => self.process_analytics_frame(&frame),
        }

        self.check_memory(now).await;
        Ok(true)
    }

    fn process_analytics_frame(&mut self, frame: &VideoFrame) {
        self.frames_processed += 1;
        self.total_processed += 1;
        self.data_manager.report_frame(frame.ms, Some(frame));

        if let Some(previous) = self.last_analytics_ms {
            let diff = frame.ms as i64 - previous as i64;
            if diff <= 0 || diff >= self.config.timing.frame_warning_ms as i64 {
                warn!(previous, current = frame.ms, diff, "Timestamp anomaly");
            }
        }
        self.last_analytics_ms = Some(frame.ms);

        if let Some(pipeline) = self.pipeline.as_mut() {
            if let Err(e) = pipeline.process_frame(frame, frame.ms) {
                error!(camera = %self.camera, "Analytics failed: {:#}", e);
                self.running = false;
                return;
            }
        }

        self.objects_since_notify += self.data_manager.take_new_object_count();

        let processed_ms = self.data_manager.finished_timestamp();
        if processed_ms > self.finished_ms {
            self.finished_ms = processed_ms;
            let silence_ms = processed_ms.saturating_sub(self.last_notify_ms);
            if self.objects_since_notify > 0 || silence_ms > self.config.timing.max_notify_silence_ms {
                self.events.emit(SessionEvent::ProcessedData {
                    camera: self.camera.clone(),
                    processed_ms,
                });
                self.objects_since_notify = 0;
                self.last_notify_ms = processed_ms;
            }
        }
    }

    /// Tear down the stream but keep the HTTP server, then reopen.
    async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Reconnecting;
        self.reconnects += 1;
        self.cleanup(false, false).await;
        self.open_stream().await
    }

    async fn check_memory(&mut self, now: Instant) {
        if now.duration_since(self.last_memory_check) <= self.config.timing.memory_check_interval {
            return;
        }

        let rss = (self.probes.rss_bytes)();
        let limit = self.config.memory_limit_mb.map(|mb| mb * 1024 * 1024);
        match (rss, limit) {
            (Some(rss_bytes), Some(limit)) if rss_bytes > limit => {
                error!(
                    camera = %self.camera,
                    rss_mb = rss_bytes / (1024 * 1024),
                    "Quitting camera process due to excessive memory consumption"
                );
                self.events.emit(SessionEvent::MemoryLimitExceeded {
                    camera: self.camera.clone(),
                    rss_bytes,
                });
                self.terminate_on_exit = true;
                self.handle_message(ControlMessage::Quit { response: None }).await;
            }
            (Some(rss_bytes), _) => {
                info!(camera = %self.camera, rss_mb = rss_bytes / (1024 * 1024), "Memory usage");
                self.last_memory_check = now;
            }
            (None, _) => self.last_memory_check = now,
        }
    }

    /// Flush and drop the analytics pipeline.
    ///
    /// When any analytics frame went through it, the data manager is flushed
    /// too and a final progress notification goes upstream.
    pub(crate) fn flush_pipeline(&mut self) {
        let Some(mut pipeline) = self.pipeline.take() else {
            return;
        };

        if self.last_analytics_ms.is_some() {
            info!(camera = %self.camera, "Flushing the pipeline");
            if let Err(e) = pipeline.flush() {
                error!(camera = %self.camera, "Pipeline flush failed: {:#}", e);
                self.running = false;
            }
            if let Err(e) = self.data_manager.flush(self.config.timing.flush_timeout) {
                error!(camera = %self.camera, "Data manager flush failed: {:#}", e);
            }
            info!("... finished flushing");
            self.events.emit(SessionEvent::ProcessedData {
                camera: self.camera.clone(),
                processed_ms: self.last_ms,
            });
        }

        self.data_manager.reset();
        info!(
            camera = %self.camera,
            processed = self.frames_processed,
            interpolated = self.frames_interpolated,
            "Stream reader reset"
        );
        self.frames_processed = 0;
        self.frames_interpolated = 0;
    }
}
