//! Live view buffer and live-stream lifecycle

use tracing::{error, info, warn};

use super::CaptureSession;
use crate::pipeline::TimestampFlags;
use crate::profiles::{remove_playlist, MASTER_PROFILE};

impl CaptureSession {
    /// Start or stop live streams according to the profile table.
    ///
    /// The only place profile state changes outside of HTTP registration.
    /// Nothing happens while no profile is registered.
    pub(crate) async fn check_live_stream(&mut self) {
        let plan = self.shared.profiles.plan_lifecycle().await;
        if plan.is_empty() {
            return;
        }

        for (profile, playlist) in &plan.expire {
            info!(profile, playlist = %playlist.display(), "Live stream timeout");
            self.reader.disable_live_stream(*profile);
            if let Err(e) = remove_playlist(playlist) {
                warn!(playlist = %playlist.display(), "Couldn't remove playlist: {}", e);
            }
        }

        let timestamps = TimestampFlags::from_settings(&self.live);
        let start_index = self.shared.profiles.max_segment_index().await;
        for (profile, playlist) in &plan.activate {
            if *profile == MASTER_PROFILE {
                self.update_video_settings();
            }
            if let Err(e) = self
                .reader
                .enable_live_stream(*profile, playlist, timestamps, start_index)
            {
                error!(profile, playlist = %playlist.display(), "Error starting live stream: {:#}", e);
            }
        }
    }

    /// Push changed bitrate and resolution limits to the decode layer
    fn update_video_settings(&mut self) {
        if !self.video_settings_changed {
            return;
        }
        match self
            .reader
            .set_live_stream_limits(self.live.max_resolution, self.live.max_bitrate)
        {
            Ok(()) => self.video_settings_changed = false,
            Err(e) => error!("Error setting live stream limits: {:#}", e),
        }
    }

    pub(crate) async fn open_live_view(&mut self) {
        let _guard = self.shared.stream_opened.lock().await;
        if let Err(e) = self.live_view.open() {
            warn!(path = %self.live_view.path().display(), "Couldn't open live view buffer: {}", e);
        }
    }

    pub(crate) async fn close_live_view(&mut self) {
        let _guard = self.shared.stream_opened.lock().await;
        self.live_view.close();
    }
}
