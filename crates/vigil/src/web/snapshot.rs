//! `GET /image.jpg`

use std::io::Cursor;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use super::{no_cache, WebState};
use crate::pipeline::MAX_SNAPSHOT_DIMENSION;

pub(crate) const DEFAULT_WIDTH: u32 = 320;
pub(crate) const DEFAULT_HEIGHT: u32 = 240;

#[derive(Debug, Deserialize)]
pub(crate) struct ImageQuery {
    width: Option<u32>,
    height: Option<u32>,
    /// Render a placeholder instead of asking the decode layer
    dummy: Option<String>,
}

/// 404 with the `NO IMAGE` reason phrase, so clients can tell "keep
/// polling" apart from a route that does not exist.
pub(crate) fn no_image(reason: impl Into<String>) -> Response {
    let mut response = (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        reason.into(),
    )
        .into_response();
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"NO IMAGE"));
    response
}

pub(crate) async fn image(State(state): State<Arc<WebState>>, Query(query): Query<ImageQuery>) -> Response {
    let width = query.width.unwrap_or(DEFAULT_WIDTH);
    let height = query.height.unwrap_or(DEFAULT_HEIGHT);
    if width == 0 || height == 0 {
        return (StatusCode::BAD_REQUEST, "width and height must be positive").into_response();
    }
    if width > MAX_SNAPSHOT_DIMENSION || height > MAX_SNAPSHOT_DIMENSION {
        return (
            StatusCode::BAD_REQUEST,
            format!("width and height must not exceed {}", MAX_SNAPSHOT_DIMENSION),
        )
            .into_response();
    }

    let jpeg = if query.dummy.is_some() {
        match tokio::task::spawn_blocking(move || render_dummy(width, height)).await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => return no_image(format!("dummy image failed: {}", e)),
            Err(e) => return no_image(format!("dummy image failed: {}", e)),
        }
    } else {
        // The guard stays held across the encode so the session cannot close
        // the decode layer underneath it.
        let guard = state.stream_opened.clone().lock_owned().await;
        if !*guard {
            return no_image("stream reader not opened");
        }
        let reader = state.reader.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            reader.newest_frame_jpeg(width, height)
        })
        .await;
        match result {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                debug!("Frame retrieval failed: {:#}", e);
                return no_image(format!("frame retrieval failed: {}", e));
            }
            Err(e) => return no_image(format!("frame retrieval failed: {}", e)),
        }
    };

    let mut response = ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response();
    no_cache(&mut response);
    response
}

/// Black image with 255 random green lines
pub(crate) fn render_dummy(width: u32, height: u32) -> image::ImageResult<Bytes> {
    let mut img = RgbImage::new(width, height);
    let mut rng = rand::thread_rng();
    for shade in 0..255u8 {
        let from = (rng.gen_range(0..width), rng.gen_range(0..height));
        let to = (rng.gen_range(0..width), rng.gen_range(0..height));
        draw_line(&mut img, from, to, Rgb([0, shade, 0]));
    }

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new(&mut out).encode_image(&img)?;
    Ok(Bytes::from(out.into_inner()))
}

/// Bresenham line; both endpoints must lie inside the image.
fn draw_line(img: &mut RgbImage, from: (u32, u32), to: (u32, u32), color: Rgb<u8>) {
    let (mut x, mut y) = (from.0 as i64, from.1 as i64);
    let (x1, y1) = (to.0 as i64, to.1 as i64);
    let dx = (x1 - x).abs();
    let dy = -(y1 - y).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sy = if y < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        img.put_pixel(x as u32, y as u32, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
