//! Control message dispatcher and the terminate handshake

use tracing::{debug, error, info, warn};

use super::CaptureSession;
use crate::command::{is_local_uri, sanitize_uri, ControlMessage, SessionEvent, VideoSetting};

impl CaptureSession {
    /// Handle one control message. Never fails; problems are logged.
    ///
    /// A quit only stops the loop and records its response token. The
    /// teardown itself happens once, when `run` unwinds.
    pub(crate) async fn handle_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Quit { response } => {
                info!(camera = %self.camera, "Quit message received");
                self.running = false;
                if let Some(token) = response {
                    self.quit_responses.push(token);
                }
            }
            ControlMessage::CanTerminate => {
                debug!(camera = %self.camera, "Ignoring stray can-terminate");
            }
            other => self.apply(other).await,
        }
    }

    async fn apply(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Quit { .. } | ControlMessage::CanTerminate => {}
            ControlMessage::EnableLiveView => {
                if !self.live_view_enabled {
                    info!(camera = %self.camera, "Live view enabled");
                    self.live_view_enabled = true;
                }
            }
            ControlMessage::DisableLiveView => {
                if self.live_view_enabled {
                    info!(camera = %self.camera, "Live view disabled");
                    self.live_view_enabled = false;
                }
                self.close_live_view().await;
            }
            ControlMessage::FlushVideo { until_ms } => {
                debug!(?until_ms, "Flushing video");
                self.reader.flush(until_ms);
            }
            ControlMessage::RenameCamera { name } => {
                let old = std::mem::replace(&mut self.camera, name.clone());
                info!(%old, new = %name, "Camera renamed");
                self.reader.set_location_name(&name);
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.update_video_path(&name);
                }
                self.events.emit(SessionEvent::CameraRenamed { old, new: name });
            }
            ControlMessage::SetMmapParams(params) => {
                debug!(
                    large_view = params.large_view,
                    width = params.width,
                    height = params.height,
                    fps = params.fps,
                    "mmap params"
                );
                self.live_view.set_request_fps(params.fps as f32);
                self.live_view.set_view_size(params.width, params.height);
                self.reader.set_mmap_params(params);
            }
            ControlMessage::SetTimePrefs {
                use_12hr_time,
                use_us_date,
            } => {
                // Applies to live streams started from now on
                self.live.use_12hr_time = use_12hr_time;
                self.live.use_us_date = use_us_date;
            }
            ControlMessage::SetClipMergeThreshold { threshold_secs } => {
                debug!(threshold_secs, "Modifying clip merge threshold");
                self.clip_store
                    .lock()
                    .await
                    .set_merge_threshold(&self.camera, threshold_secs);
            }
            ControlMessage::SetVideoSetting(setting) => self.apply_video_setting(setting),
            ControlMessage::SetDebugConfig { directives } => match &self.log_control {
                Some(control) => {
                    if let Err(e) = control.apply(&directives) {
                        error!("Couldn't apply log config: {:#}", e);
                    }
                }
                None => debug!("No log control, ignoring debug config"),
            },
            ControlMessage::SetAudioVolume { volume } => self.reader.set_audio_volume(volume),
            ControlMessage::CameraUriUpdated { uri } => {
                if self.uri != uri {
                    info!(
                        camera = %self.camera,
                        uri = %sanitize_uri(uri.as_str()),
                        "Camera URI had been updated"
                    );
                    self.uri = uri;
                    if self.config.local_source.is_none() {
                        self.local_source = is_local_uri(self.uri.as_str());
                    }
                }
            }
            ControlMessage::AnalyticsPortChanged { port } => {
                info!(port, "Analytics port changed");
                self.data_manager.set_analytics_port(port);
            }
            ControlMessage::AddSavedTimes { ranges } => {
                debug!(count = ranges.len(), "Add saved times");
                self.clip_store
                    .lock()
                    .await
                    .mark_times_saved(&self.camera, &ranges);
            }
        }
    }

    fn apply_video_setting(&mut self, setting: VideoSetting) {
        let live = &mut self.live;
        let changed = match setting {
            VideoSetting::MaxBitrate(kbps) => replace_if_changed(&mut live.max_bitrate, kbps),
            VideoSetting::EnableTimestamp(on) => replace_if_changed(&mut live.enable_timestamp, on),
            VideoSetting::MaxResolution(lines) => replace_if_changed(&mut live.max_resolution, lines),
            VideoSetting::EnableFastStart(on) => replace_if_changed(&mut live.enable_fast_start, on),
            VideoSetting::ThumbnailResolution(width, height) => {
                live.thumbnail_resolution = (width, height);
                self.data_manager.set_thumbnail_resolution(width, height);
                false
            }
        };
        if changed && setting.is_live_stream_setting() {
            debug!(?setting, "Live stream setting changed");
            self.video_settings_changed = true;
        }
    }

    /// Ask the supervisor for permission to go away, then tell it to.
    ///
    /// Waits without a timeout. Messages other than the acknowledgement are
    /// still applied; a closed mailbox counts as permission.
    pub(crate) async fn terminate_handshake(&mut self) {
        info!(camera = %self.camera, "Requesting permission to terminate");
        self.events.emit(SessionEvent::CanTerminate {
            camera: self.camera.clone(),
        });

        loop {
            match self.mailbox.next().await {
                Some(ControlMessage::CanTerminate) => break,
                Some(msg) => self.handle_message(msg).await,
                None => {
                    warn!(camera = %self.camera, "Mailbox closed while waiting to terminate");
                    break;
                }
            }
        }

        self.events.emit(SessionEvent::Terminate {
            camera: self.camera.clone(),
        });
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
