//! One camera's capture session
//!
//! `CaptureSession` owns the main loop: it opens the source with back-off,
//! pumps frames into the analytics pipeline, drains the control mailbox,
//! runs the live-stream lifecycle check and periodically rechecks disk
//! space. The embedded HTTP server runs alongside it on its own tasks and
//! shares the stream guard and the profile table through [`WebState`].
//!
//! State machine: Opening -> Running -> (Reconnecting <-> Running) ->
//! ShuttingDown -> Closed.

mod connect;
mod dispatch;
mod live;
mod pump;

#[cfg(test)]
mod tests;

pub use connect::retry_delay;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::command::{is_local_uri, RedactedString, SessionEvent, LOW_DISK_SPACE_REASON};
use crate::config::{LiveSettings, SessionConfig};
use crate::error::SessionError;
use crate::live_view::LiveViewPublisher;
use crate::logging::LogControl;
use crate::mailbox::{EventSender, Mailbox, Polled};
use crate::pipeline::{AnalyticsPipeline, ClipStore, DataManager, PipelineFactory, StreamReader};
use crate::profiles::remove_all_playlists;
use crate::system::{cleanup_tmp_storage, HostProbes};
use crate::web::{WebServer, WebState};

/// External components a session drives
pub struct Collaborators {
    pub reader: Arc<dyn StreamReader>,
    pub pipelines: Box<dyn PipelineFactory>,
    pub data_manager: Box<dyn DataManager>,
    pub clip_store: Arc<Mutex<Box<dyn ClipStore>>>,
    /// Runtime log filter control; `SetDebugConfig` is ignored without it
    pub log_control: Option<LogControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Running,
    Reconnecting,
    ShuttingDown,
    Closed,
}

/// Counters for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    /// Analytics frames since the pipeline was last flushed
    pub frames_processed: u64,
    /// Dummy frames since the pipeline was last flushed
    pub frames_interpolated: u64,
    /// Start-up frames kept out of analytics, over the whole session
    pub frames_skipped: u64,
    /// Analytics frames over the whole session
    pub total_processed: u64,
    pub reconnects: u32,
    /// Media time up to which the data manager has finished
    pub finished_ms: u64,
}

pub struct CaptureSession {
    config: SessionConfig,
    camera: String,
    uri: RedactedString,
    local_source: bool,
    live: LiveSettings,
    video_settings_changed: bool,

    state: SessionState,
    running: bool,
    /// Set when the session stops on its own; the final teardown then runs
    /// the can-terminate handshake.
    terminate_on_exit: bool,
    /// Tokens of quit messages to echo once teardown is done
    quit_responses: Vec<String>,

    reader: Arc<dyn StreamReader>,
    pipelines: Box<dyn PipelineFactory>,
    pipeline: Option<Box<dyn AnalyticsPipeline>>,
    data_manager: Box<dyn DataManager>,
    clip_store: Arc<Mutex<Box<dyn ClipStore>>>,
    log_control: Option<LogControl>,
    probes: HostProbes,

    mailbox: Mailbox,
    events: EventSender,

    shared: Arc<WebState>,
    web: Option<WebServer>,

    live_view: LiveViewPublisher,
    live_view_enabled: bool,

    // Frame pump bookkeeping
    last_tick: Option<Instant>,
    last_frame_at: Instant,
    last_ms: u64,
    last_analytics_ms: Option<u64>,
    initial_skipped: u32,
    frames_processed: u64,
    frames_interpolated: u64,
    frames_skipped: u64,
    total_processed: u64,
    finished_ms: u64,
    last_notify_ms: u64,
    objects_since_notify: u32,
    reconnects: u32,

    last_ping: Option<Instant>,
    last_free_space_check: Instant,
    last_memory_check: Instant,
}

impl CaptureSession {
    /// Build a session. Zeroes the live-view buffer and clears leftover tmp
    /// files before anything else runs.
    pub fn new(
        config: SessionConfig,
        collaborators: Collaborators,
        mailbox: Mailbox,
        events: EventSender,
    ) -> Self {
        let Collaborators {
            reader,
            pipelines,
            mut data_manager,
            clip_store,
            log_control,
        } = collaborators;

        let live_view = LiveViewPublisher::new(config.live_view_path(), config.record_size);
        if let Err(e) = live_view.clear_file() {
            warn!(path = %live_view.path().display(), "Couldn't clear live view buffer: {}", e);
        }

        cleanup_tmp_storage(&config.tmp_dir.join(&config.camera), &config.pending_moves);

        let (thumb_w, thumb_h) = config.live.thumbnail_resolution;
        data_manager.set_thumbnail_resolution(thumb_w, thumb_h);

        let shared = Arc::new(WebState::new(reader.clone(), &config));
        let local_source = config
            .local_source
            .unwrap_or_else(|| is_local_uri(config.uri.as_str()));
        let now = Instant::now();

        info!(camera = %config.camera, pid = std::process::id(), "Camera capture initialized");

        Self {
            camera: config.camera.clone(),
            uri: config.uri.clone(),
            local_source,
            live: config.live.clone(),
            video_settings_changed: true,
            state: SessionState::Opening,
            running: false,
            terminate_on_exit: false,
            quit_responses: Vec::new(),
            reader,
            pipelines,
            pipeline: None,
            data_manager,
            clip_store,
            log_control,
            probes: HostProbes::default(),
            mailbox,
            events,
            shared,
            web: None,
            live_view,
            live_view_enabled: false,
            last_tick: None,
            last_frame_at: now,
            last_ms: 0,
            last_analytics_ms: None,
            initial_skipped: 0,
            frames_processed: 0,
            frames_interpolated: 0,
            frames_skipped: 0,
            total_processed: 0,
            finished_ms: 0,
            last_notify_ms: 0,
            objects_since_notify: 0,
            reconnects: 0,
            last_ping: None,
            last_free_space_check: now,
            last_memory_check: now,
            config,
        }
    }

    /// Replace the host probes (disk space, memory)
    pub fn with_probes(mut self, probes: HostProbes) -> Self {
        self.probes = probes;
        self
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// State shared with the HTTP handlers
    pub fn web_state(&self) -> Arc<WebState> {
        self.shared.clone()
    }

    /// Port of the embedded HTTP server, while it runs
    pub fn web_port(&self) -> Option<u16> {
        self.web.as_ref().map(|w| w.port())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            frames_processed: self.frames_processed,
            frames_interpolated: self.frames_interpolated,
            frames_skipped: self.frames_skipped,
            total_processed: self.total_processed,
            reconnects: self.reconnects,
            finished_ms: self.finished_ms,
        }
    }

    /// Run until quit, a fatal condition or the supervisor going away.
    ///
    /// Teardown always runs before returning. Fatal conditions are returned
    /// so the owning process can exit and be restarted.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let result = self.run_loop().await;
        if result.is_err() {
            self.terminate_on_exit = true;
        }

        self.running = false;
        info!(camera = %self.camera, "Beginning camera shutdown");
        self.cleanup(self.terminate_on_exit, true).await;
        self.drain_after_shutdown().await;
        for token in std::mem::take(&mut self.quit_responses) {
            self.events.emit(SessionEvent::QuitResponse { token });
        }
        self.state = SessionState::Closed;
        info!(camera = %self.camera, "Camera capture finished");
        result
    }

    async fn run_loop(&mut self) -> Result<(), SessionError> {
        self.running = true;
        self.state = SessionState::Opening;
        self.clip_store
            .lock()
            .await
            .set_merge_threshold(&self.camera, self.config.clip_merge_threshold_secs);

        self.open_stream().await?;
        if !self.running {
            return Ok(());
        }

        self.start_web().await?;

        while self.running {
            let now = Instant::now();
            let ping_due = self
                .last_ping
                .map_or(true, |last| now.duration_since(last) > self.config.timing.ping_interval);
            if ping_due {
                self.last_ping = Some(now);
                self.events.emit(SessionEvent::Ping {
                    camera: self.reader.location_name(),
                });
            }

            if !self.process_frame().await? && self.running {
                tokio::time::sleep(self.config.timing.idle_sleep).await;
            }

            self.drain_mailbox().await;
            if !self.running {
                break;
            }

            self.check_live_stream().await;
            self.report_failed_moves();

            if now.duration_since(self.last_free_space_check) > self.config.timing.free_space_check_interval
                && !self.check_free_space()
            {
                self.events.emit(SessionEvent::StreamOpenFailed {
                    camera: self.reader.location_name(),
                    reason: Some(LOW_DISK_SPACE_REASON.to_string()),
                });
                return Err(SessionError::OutOfSpace {
                    path: self.config.tmp_dir.clone(),
                });
            }
        }
        Ok(())
    }

    async fn start_web(&mut self) -> Result<(), SessionError> {
        let server = WebServer::start(self.shared.clone(), self.config.http_bind)
            .await
            .map_err(SessionError::Server)?;
        self.events.emit(SessionEvent::PortChanged {
            camera: self.camera.clone(),
            port: server.port(),
        });
        self.web = Some(server);
        Ok(())
    }

    /// Pass failed archive moves from the decode layer upstream
    pub(crate) fn report_failed_moves(&self) {
        for target in self.reader.take_failed_moves() {
            warn!(camera = %self.camera, target = %target, "Recording could not be archived");
            self.events.file_move_failed(&self.camera, &target);
        }
    }

    /// Handle everything queued in the mailbox without waiting
    async fn drain_mailbox(&mut self) {
        while self.running {
            match self.mailbox.try_next() {
                Polled::Message(msg) => self.handle_message(msg).await,
                Polled::Empty => break,
                Polled::Closed => {
                    warn!(camera = %self.camera, "Control mailbox closed, stopping");
                    self.running = false;
                }
            }
        }
    }

    /// Messages that arrived during teardown still get their side effects,
    /// quit tokens in particular.
    async fn drain_after_shutdown(&mut self) {
        while let Polled::Message(msg) = self.mailbox.try_next() {
            self.handle_message(msg).await;
        }
    }

    /// Release every resource tied to the current stream.
    ///
    /// `is_shutdown` also stops the HTTP server and runs at most once; a
    /// second shutdown cleanup only logs. `allow_terminate` runs the
    /// can-terminate handshake before the decode layer is closed.
    pub(crate) async fn cleanup(&mut self, allow_terminate: bool, is_shutdown: bool) {
        *self.shared.stream_opened.lock().await = false;

        if is_shutdown {
            if self.shared.cleaning_up.swap(true, Ordering::AcqRel) {
                warn!(camera = %self.camera, "Cleanup already in progress");
                return;
            }
            self.state = SessionState::ShuttingDown;
            if let Some(web) = self.web.take() {
                info!("Shutting down the web server...");
                if web.shutdown(self.config.timing.web_shutdown_timeout).await {
                    info!("Web server down");
                } else {
                    warn!("Web server is NOT down yet");
                }
            }
        }

        self.events.emit(SessionEvent::FrameSizeUpdated {
            camera: self.reader.location_name(),
            size: self.reader.initial_frame_buffer_size(),
        });

        self.close_live_view().await;
        self.flush_pipeline();
        self.data_manager.terminate();

        if allow_terminate {
            self.terminate_handshake().await;
        }

        self.reader.close();
        info!(camera = %self.camera, "Stream reader closed");
        self.report_failed_moves();

        if let Err(e) = remove_all_playlists(&self.shared.remote_dir, &self.shared.playlist_base) {
            warn!(camera = %self.camera, "Couldn't remove playlists: {}", e);
        }
    }
}
