//! Live-view snapshot buffer
//!
//! A file-backed region holding the newest frame for local viewers. The
//! session writes it; viewers read it concurrently and must tolerate torn
//! reads, which they detect through the footer.
//!
//! Layout (little-endian):
//!
//! | offset      | size    | field                                  |
//! |-------------|---------|----------------------------------------|
//! | 0           | 8       | frame id (u64, never 0 while publishing) |
//! | 8           | 4       | width (u32)                            |
//! | 12          | 4       | height (u32)                           |
//! | 16          | 4       | request fps (f32)                      |
//! | 20          | 4       | capture fps (f32)                      |
//! | 24          | 8       | reserved                               |
//! | 32          | W*H*3   | RGB body, sized for the configured size |
//! | 32 + W*H*3  | 4 + 4   | footer: width, height                  |
//!
//! An all-zero header means nothing is being published. Frames larger than
//! the requested view are scaled down before they are written.

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::fps::FpsTracker;
use crate::frame::VideoFrame;

pub const HEADER_LEN: usize = 32;
pub const FOOTER_LEN: usize = 8;

/// Total region size for a body of `width x height` RGB pixels
pub fn region_len(width: u32, height: u32) -> usize {
    HEADER_LEN + width as usize * height as usize * 3 + FOOTER_LEN
}

/// A frame read back from the buffer
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub request_fps: f32,
    pub capture_fps: f32,
    pub rgb: Bytes,
}

/// Result of reading the buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Nothing is being published
    Closed,
    /// The newest frame is the one the caller already has
    Unchanged,
    /// The read raced a write or the region is malformed; ask again
    Retry { last_id: u64 },
    Frame(LiveFrame),
}

fn le_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn le_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

fn le_f32(bytes: &[u8], at: usize) -> Option<f32> {
    Some(f32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

/// Decode a region previously read in full.
///
/// `last_id` is the id of the frame the caller already holds (0 for none).
pub fn read_snapshot(bytes: &[u8], last_id: u64) -> Snapshot {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return Snapshot::Retry { last_id };
    };
    if header.iter().all(|&b| b == 0) {
        return Snapshot::Closed;
    }
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Snapshot::Retry { last_id };
    }

    let (Some(id), Some(width), Some(height), Some(request_fps), Some(capture_fps)) = (
        le_u64(bytes, 0),
        le_u32(bytes, 8),
        le_u32(bytes, 12),
        le_f32(bytes, 16),
        le_f32(bytes, 20),
    ) else {
        return Snapshot::Retry { last_id };
    };

    if id == 0 {
        return Snapshot::Retry { last_id };
    }
    if id == last_id {
        return Snapshot::Unchanged;
    }

    let body_capacity = bytes.len() - HEADER_LEN - FOOTER_LEN;
    let footer_at = HEADER_LEN + body_capacity;
    let footer = (le_u32(bytes, footer_at), le_u32(bytes, footer_at + 4));
    if footer != (Some(width), Some(height)) {
        return Snapshot::Retry { last_id };
    }

    let body_len = width as usize * height as usize * 3;
    if body_len == 0 || body_len > body_capacity {
        return Snapshot::Retry { last_id };
    }

    Snapshot::Frame(LiveFrame {
        id,
        width,
        height,
        request_fps,
        capture_fps,
        rgb: Bytes::copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + body_len]),
    })
}

/// Read the buffer file at `path`. A missing file reads as `Closed`.
pub fn read_file(path: &Path, last_id: u64) -> io::Result<Snapshot> {
    match fs::read(path) {
        Ok(bytes) => Ok(read_snapshot(&bytes, last_id)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Snapshot::Closed),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn write_at(mut file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Writer side of the live-view buffer
pub struct LiveViewPublisher {
    path: PathBuf,
    width: u32,
    height: u32,
    /// Largest frame written; never bigger than the body
    view: (u32, u32),
    file: Option<File>,
    frame_id: u64,
    request_fps: f32,
    fps: FpsTracker,
}

impl LiveViewPublisher {
    /// `record_size` fixes the body size for the lifetime of the publisher.
    pub fn new(path: impl Into<PathBuf>, record_size: (u32, u32)) -> Self {
        Self {
            path: path.into(),
            width: record_size.0,
            height: record_size.1,
            view: record_size,
            file: None,
            frame_id: 0,
            request_fps: 0.0,
            fps: FpsTracker::new(Duration::from_secs(1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_len(&self) -> usize {
        region_len(self.width, self.height)
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Zero the whole region, creating it if needed.
    ///
    /// Called before anything else touches the buffer so a viewer never sees
    /// a frame left by a previous process.
    pub fn clear_file(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        file.set_len(self.byte_len() as u64)?;
        Ok(())
    }

    /// Map the region for writing. Any previous mapping is closed first.
    pub fn open(&mut self) -> io::Result<()> {
        self.close();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.set_len(self.byte_len() as u64)?;
        write_at(&file, &[0u8; HEADER_LEN], 0)?;

        self.file = Some(file);
        self.fps.reset();
        info!(path = %self.path.display(), "Opened live view buffer");
        Ok(())
    }

    /// Stop publishing. The header is zeroed so viewers see `Closed`.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = write_at(&file, &[0u8; HEADER_LEN], 0) {
                error!(path = %self.path.display(), "Failed to clear live view header: {}", e);
            }
            debug!(path = %self.path.display(), "Closed live view buffer");
        }
    }

    pub fn set_request_fps(&mut self, fps: f32) {
        self.request_fps = fps;
    }

    pub fn view_size(&self) -> (u32, u32) {
        self.view
    }

    /// Size viewers asked for. Clamped to the body; zero restores the
    /// configured size.
    pub fn set_view_size(&mut self, width: u32, height: u32) {
        self.view = if width == 0 || height == 0 {
            (self.width, self.height)
        } else {
            (width.min(self.width), height.min(self.height))
        };
        debug!(width = self.view.0, height = self.view.1, "Live view size");
    }

    /// Publish a frame. Returns `false` when nothing was written (closed,
    /// dummy or malformed frame).
    pub fn publish(&mut self, frame: &VideoFrame) -> io::Result<bool> {
        if self.file.is_none()
            || frame.is_dummy()
            || frame.width == 0
            || frame.height == 0
            || frame.pixels.len() != frame.rgb_len()
        {
            return Ok(false);
        }
        let Some((width, height, pixels)) = self.fit(frame) else {
            return Ok(false);
        };
        let Some(file) = self.file.as_ref() else {
            return Ok(false);
        };

        self.fps.record();
        self.frame_id = self.frame_id.wrapping_add(1).max(1);

        // Body and footer first; the header is what viewers key on.
        let body_capacity = self.width as usize * self.height as usize * 3;
        write_at(file, &pixels, HEADER_LEN as u64)?;
        let mut footer = [0u8; FOOTER_LEN];
        footer[..4].copy_from_slice(&width.to_le_bytes());
        footer[4..].copy_from_slice(&height.to_le_bytes());
        write_at(file, &footer, (HEADER_LEN + body_capacity) as u64)?;

        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(&self.frame_id.to_le_bytes());
        header[8..12].copy_from_slice(&width.to_le_bytes());
        header[12..16].copy_from_slice(&height.to_le_bytes());
        header[16..20].copy_from_slice(&self.request_fps.to_le_bytes());
        header[20..24].copy_from_slice(&self.fps.fps().to_le_bytes());
        write_at(file, &header, 0)?;

        Ok(true)
    }

    /// Pixels to write for `frame`, scaled down to the view when larger.
    fn fit<'a>(&self, frame: &'a VideoFrame) -> Option<(u32, u32, Cow<'a, [u8]>)> {
        let (view_w, view_h) = self.view;
        if frame.width <= view_w && frame.height <= view_h {
            return Some((frame.width, frame.height, Cow::Borrowed(&frame.pixels[..])));
        }
        let source = RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())?;
        let scaled = imageops::resize(&source, view_w, view_h, FilterType::Triangle);
        Some((view_w, view_h, Cow::Owned(scaled.into_raw())))
    }
}

impl Drop for LiveViewPublisher {
    fn drop(&mut self) {
        self.close();
    }
}
