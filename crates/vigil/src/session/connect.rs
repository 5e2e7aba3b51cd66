//! Connection manager: open the source with back-off

use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use super::{CaptureSession, SessionState};
use crate::command::{SessionEvent, LOW_DISK_SPACE_REASON};
use crate::config::Timing;
use crate::error::SessionError;
use crate::pipeline::OpenOptions;

/// Back-off before the next open attempt.
///
/// `attempt` indexes the retry table, clamped to its last entry. An empty
/// URI (camera not discovered yet) never waits less than the configured
/// minimum.
pub fn retry_delay(attempt: u32, uri_empty: bool, timing: &Timing) -> Duration {
    let table = &timing.retry_secs;
    let index = (attempt as usize).min(table.len().saturating_sub(1));
    let mut secs = table.get(index).copied().unwrap_or(0);
    if uri_empty {
        secs = secs.max(timing.empty_uri_min_secs);
    }
    Duration::from_secs(secs)
}

impl CaptureSession {
    /// Open the source, retrying until it opens or the session should stop.
    ///
    /// Returns `Ok` with `running` cleared when a quit arrived during
    /// back-off, and `TooManyFailures` once the retry limit is exceeded while
    /// disk space is fine. Low disk space skips the open attempt but counts
    /// toward the same limit.
    pub(crate) async fn open_stream(&mut self) -> Result<(), SessionError> {
        info!(camera = %self.camera, "Beginning stream open");
        self.flush_pipeline();
        self.last_tick = None;
        self.last_analytics_ms = None;

        let mut retry: u32 = 0;
        let mut space_ok = self.check_free_space();

        while !(space_ok && self.try_open()) {
            info!(camera = %self.camera, "Open failed");

            if retry > 0 {
                self.events.emit(SessionEvent::StreamOpenFailed {
                    camera: self.reader.location_name(),
                    reason: (!space_ok).then(|| LOW_DISK_SPACE_REASON.to_string()),
                });
            }

            let delay = retry_delay(retry, self.uri.is_empty(), &self.config.timing);
            info!(secs = delay.as_secs(), "Sleeping before next open attempt");

            let uri_changed = self.wait_during_backoff(delay).await;
            if !self.running {
                return Ok(());
            }

            if uri_changed {
                retry = 0;
            } else {
                retry += 1;
            }

            space_ok = self.check_free_space();
            if space_ok && retry > self.config.timing.max_retries {
                return Err(SessionError::TooManyFailures { retries: retry });
            }
        }

        info!(camera = %self.camera, "Stream open successful");
        *self.shared.stream_opened.lock().await = true;
        self.state = SessionState::Running;

        self.events.emit(SessionEvent::StreamOpenSucceeded {
            camera: self.reader.location_name(),
            frame_size: self.reader.proc_size(),
        });

        // No frame yet must not count as a timeout on the first tick
        self.last_frame_at = Instant::now();
        self.initial_skipped = 0;
        self.pipeline = Some(self.pipelines.create(&self.camera));
        Ok(())
    }

    fn try_open(&mut self) -> bool {
        let options = OpenOptions {
            init_frame_size: self.config.init_frame_size,
            live: self.live.clone(),
        };
        match self.reader.open(self.uri.as_str(), &options) {
            Ok(()) => true,
            Err(e) => {
                warn!(camera = %self.camera, "Stream open error: {:#}", e);
                false
            }
        }
    }

    /// Sleep out a back-off while handling control messages.
    ///
    /// Returns early when a message stops the session or changes the URI;
    /// the return value tells whether the URI changed.
    async fn wait_during_backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let before = self.uri.clone();

        loop {
            match timeout_at(deadline, self.mailbox.next()).await {
                Ok(Some(msg)) => {
                    self.handle_message(msg).await;
                    if !self.running {
                        return false;
                    }
                    if self.uri != before {
                        info!(camera = %self.camera, "URI changed, retrying now");
                        return true;
                    }
                }
                Ok(None) => {
                    warn!(camera = %self.camera, "Control mailbox closed during back-off");
                    self.running = false;
                    return false;
                }
                Err(_) => return false,
            }
        }
    }

    /// Whether the tmp volume still has the configured minimum free
    pub(crate) fn check_free_space(&mut self) -> bool {
        self.last_free_space_check = Instant::now();
        let ok = (self.probes.free_space_ok)(&self.config.tmp_dir, self.config.min_free_space_mb);
        if !ok {
            warn!(
                path = %self.config.tmp_dir.display(),
                min_mb = self.config.min_free_space_mb,
                "Not enough free space"
            );
        }
        ok
    }
}
