//! Decoded frame types and per-frame classification

use bytes::Bytes;

/// Frame flags for metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Frame kept for playback continuity but not meant for analytics
    pub const DUMMY: u8 = 0b0000_0001;

    /// Check if this is a dummy frame
    pub fn is_dummy(&self) -> bool {
        self.0 & Self::DUMMY != 0
    }

    /// Set the dummy flag
    pub fn set_dummy(&mut self) {
        self.0 |= Self::DUMMY;
    }

    /// Create flags with dummy set
    pub fn dummy() -> Self {
        Self(Self::DUMMY)
    }
}

/// A decoded video frame handed out by the decode layer.
///
/// `pixels` is packed RGB24, `width * height * 3` bytes. Dummy frames may
/// carry an empty payload.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Media timestamp in milliseconds
    pub ms: u64,
    pub width: u32,
    pub height: u32,
    pub flags: FrameFlags,
    pub pixels: Bytes,
}

impl VideoFrame {
    /// Create an RGB frame
    pub fn rgb(ms: u64, width: u32, height: u32, pixels: Bytes) -> Self {
        Self {
            ms,
            width,
            height,
            flags: FrameFlags::default(),
            pixels,
        }
    }

    /// Create a dummy frame (no pixel data)
    pub fn dummy(ms: u64) -> Self {
        Self {
            ms,
            width: 0,
            height: 0,
            flags: FrameFlags::dummy(),
            pixels: Bytes::new(),
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.flags.is_dummy()
    }

    /// Size of an RGB24 payload for the frame's dimensions
    pub fn rgb_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// What the frame pump does with a delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Start-up frame from a local device; kept out of analytics
    Skipped,
    /// Dummy frame; only its timestamp reaches the data manager
    Interpolated,
    /// Regular frame; forwarded to the data manager and analytics
    Processed,
}

/// Classify a delivered frame.
///
/// Local devices need a few frames for auto-exposure and white balance to
/// settle, so the first `skip_limit` frames of a local source are skipped
/// regardless of their flags.
pub fn classify(local_source: bool, skipped_so_far: u32, skip_limit: u32, frame: &VideoFrame) -> FrameClass {
    if local_source && skipped_so_far < skip_limit {
        FrameClass::Skipped
    } else if frame.is_dummy() {
        FrameClass::Interpolated
    } else {
        FrameClass::Processed
    }
}
