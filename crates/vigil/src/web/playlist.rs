//! `GET /<base>[-<profile>].m3u8`
//!
//! Every request keeps its profile alive; once requests stop the session's
//! lifecycle check tears the stream down.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{error, info};

use super::{no_cache, WebState};
use crate::config::REMOTE_FOLDER;
use crate::profiles::{rewrite_playlist, PlaylistName};

pub(crate) async fn serve(state: &WebState, path: &str) -> Response {
    let Some(name) = PlaylistName::parse(path, &state.playlist_base) else {
        error!(
            path,
            base = %state.playlist_base,
            "Failed to serve playlist request; expecting derivatives of the base name"
        );
        return StatusCode::NOT_FOUND.into_response();
    };

    let playlist = name.playlist_path(&state.remote_dir);
    let started = state
        .profiles
        .register_or_refresh(name.profile, playlist.clone())
        .await;

    let start = Instant::now();
    if !started {
        // A new stream needs a moment before the decode layer writes its
        // first playlist.
        while start.elapsed() < state.playlist_wait
            && !tokio::fs::try_exists(&playlist).await.unwrap_or(false)
        {
            tokio::time::sleep(state.playlist_poll).await;
        }
    }

    let body = match tokio::fs::read_to_string(&playlist).await {
        Ok(body) => body,
        Err(_) => {
            info!(
                playlist = %playlist.display(),
                waited_ms = start.elapsed().as_millis() as u64,
                "Playlist not available"
            );
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let (body, first_index) = rewrite_playlist(&body, REMOTE_FOLDER);
    if let Some(index) = first_index {
        state.profiles.observe_segment_index(index).await;
    }

    let mut response = ([(header::CONTENT_TYPE, "application/x-mpegurl")], body).into_response();
    no_cache(&mut response);
    response
}
