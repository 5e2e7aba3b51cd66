//! Streaming profile bookkeeping
//!
//! Each HLS consumer is a profile keyed by a small integer; profile 0 is the
//! master playlist that refers to the others. HTTP handlers register and
//! refresh profiles, the session's lifecycle check activates and expires
//! them. Both go through [`StreamingProfiles`], which guards the table with
//! its own lock, separate from the stream-open guard.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Master playlist profile
pub const MASTER_PROFILE: u32 = 0;

/// Extension of playlist files written by the decode layer
pub const PLAYLIST_EXTENSION: &str = "m3u8local";

/// One live-stream consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingProfile {
    /// Playlist file the decode layer writes for this profile
    pub playlist: PathBuf,
    pub last_access: Instant,
    /// False until the lifecycle check has asked the decode layer to start it
    pub started: bool,
}

/// What one lifecycle check decided
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LifecyclePlan {
    /// Profiles to (re)start, in table order
    pub activate: Vec<(u32, PathBuf)>,
    /// Profiles to stop and whose files to remove
    pub expire: Vec<(u32, PathBuf)>,
}

impl LifecyclePlan {
    pub fn is_empty(&self) -> bool {
        self.activate.is_empty() && self.expire.is_empty()
    }
}

/// Profile state, without locking
#[derive(Debug)]
pub struct ProfileTable {
    profiles: BTreeMap<u32, StreamingProfile>,
    max_segment_index: u64,
    idle_timeout: Duration,
}

impl ProfileTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            profiles: BTreeMap::new(),
            max_segment_index: 0,
            idle_timeout,
        }
    }

    /// Register a new profile or bump the last access of a known one.
    ///
    /// A known profile keeps its `started` flag; only the lifecycle check
    /// flips it. Returns that flag (false for a new profile).
    pub fn register_or_refresh(&mut self, id: u32, playlist: PathBuf, now: Instant) -> bool {
        let started = match self.profiles.get(&id) {
            Some(existing) => existing.started,
            None => {
                info!(profile = id, playlist = %playlist.display(), "Enabling live stream");
                false
            }
        };
        self.profiles.insert(
            id,
            StreamingProfile {
                playlist,
                last_access: now,
                started,
            },
        );
        started
    }

    /// Decide which profiles start and which expire.
    ///
    /// Profiles not yet started are activated. Idle profiles are expired,
    /// except the master: it is refreshed while any other profile remains and
    /// expired only when it is the last one left. Expired profiles are
    /// removed from the table here; the caller stops them.
    pub fn plan_lifecycle(&mut self, now: Instant) -> LifecyclePlan {
        let mut plan = LifecyclePlan::default();
        let mut master_idle = None;

        for (&id, profile) in self.profiles.iter_mut() {
            if !profile.started {
                plan.activate.push((id, profile.playlist.clone()));
                profile.started = true;
                profile.last_access = now;
            } else if now.saturating_duration_since(profile.last_access) > self.idle_timeout {
                if id == MASTER_PROFILE {
                    master_idle = Some(profile.playlist.clone());
                } else {
                    plan.expire.push((id, profile.playlist.clone()));
                }
            }
        }

        if let Some(playlist) = master_idle {
            if plan.expire.len() + 1 == self.profiles.len() {
                plan.expire.push((MASTER_PROFILE, playlist));
            } else if let Some(master) = self.profiles.get_mut(&MASTER_PROFILE) {
                master.last_access = now;
                plan.activate.push((MASTER_PROFILE, playlist));
            }
        }

        for (id, _) in &plan.expire {
            self.profiles.remove(id);
        }

        if self.profiles.is_empty() && plan.activate.is_empty() {
            self.max_segment_index = 0;
        }

        plan
    }

    /// Raise the segment index counter if `index` is beyond it
    pub fn observe_segment_index(&mut self, index: u64) {
        if index > self.max_segment_index {
            self.max_segment_index = index;
        }
    }

    pub fn max_segment_index(&self) -> u64 {
        self.max_segment_index
    }

    pub fn get(&self, id: u32) -> Option<&StreamingProfile> {
        self.profiles.get(&id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// The profile table behind its own lock
#[derive(Debug)]
pub struct StreamingProfiles {
    table: Mutex<ProfileTable>,
}

impl StreamingProfiles {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(ProfileTable::new(idle_timeout)),
        }
    }

    pub async fn register_or_refresh(&self, id: u32, playlist: PathBuf) -> bool {
        self.table
            .lock()
            .await
            .register_or_refresh(id, playlist, Instant::now())
    }

    pub async fn plan_lifecycle(&self) -> LifecyclePlan {
        self.table.lock().await.plan_lifecycle(Instant::now())
    }

    pub async fn observe_segment_index(&self, index: u64) {
        self.table.lock().await.observe_segment_index(index);
    }

    pub async fn max_segment_index(&self) -> u64 {
        self.table.lock().await.max_segment_index()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}

/// A playlist request resolved to its profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistName {
    pub profile: u32,
    /// Requested file name without the `.m3u8` extension
    pub stem: String,
}

impl PlaylistName {
    /// Resolve a request path against the camera's playlist base.
    ///
    /// `/<base>.m3u8` is the master profile, `/<base>-<digits>.m3u8` is that
    /// profile. Anything else is rejected.
    pub fn parse(path: &str, base: &str) -> Option<Self> {
        let file = path.rsplit('/').next()?;
        let stem = file.strip_suffix(".m3u8")?;
        if stem.is_empty() {
            return None;
        }

        let profile = if stem == base {
            MASTER_PROFILE
        } else {
            let (prefix, digits) = stem.split_once('-')?;
            if prefix != base || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()?
        };

        Some(Self {
            profile,
            stem: stem.to_string(),
        })
    }

    /// Backing playlist file under the remote folder
    pub fn playlist_path(&self, remote_dir: &Path) -> PathBuf {
        remote_dir.join(format!("{}.{}", self.stem, PLAYLIST_EXTENSION))
    }
}

/// Segment index encoded in a segment file name.
///
/// Names look like `<base>-<profile digit><index>.ts`.
fn segment_index(line: &str) -> Option<u64> {
    let stem = line.strip_suffix(".ts")?;
    let (_, digits) = stem.rsplit_once('-')?;
    if digits.len() < 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits[1..].parse().ok()
}

/// Rewrite a playlist for serving.
///
/// Segment lines become `/<remote_folder>/<line>`, playlist lines become
/// `./<line>`, everything else passes through. Also returns the index of
/// the first segment line that carries one.
pub fn rewrite_playlist(body: &str, remote_folder: &str) -> (String, Option<u64>) {
    let mut out = String::with_capacity(body.len() + 64);
    let mut first_index = None;

    for line in body.lines() {
        let line = line.trim_end();
        if line.ends_with(".ts") {
            if first_index.is_none() {
                first_index = segment_index(line);
            }
            out.push('/');
            out.push_str(remote_folder);
            out.push('/');
            out.push_str(line);
        } else if line.ends_with(".m3u8") {
            out.push_str("./");
            out.push_str(line);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    (out, first_index)
}

/// Remove files in `dir` whose name starts with `prefix` and ends with `suffix`
fn remove_matching(dir: &Path, prefix: &str, suffix: &str) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(prefix) && name.ends_with(suffix) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %entry.path().display(), "Failed to remove: {}", e),
            }
        }
    }
    Ok(removed)
}

/// Remove a playlist file and the segments sharing its base name
pub fn remove_playlist(playlist: &Path) -> io::Result<()> {
    info!(playlist = %playlist.display(), "Removing playlist");
    match fs::remove_file(playlist) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let (Some(dir), Some(stem)) = (playlist.parent(), playlist.file_stem().and_then(|s| s.to_str()))
    else {
        return Ok(());
    };
    let removed = remove_matching(dir, stem, ".ts")?;
    debug!(playlist = %playlist.display(), removed, "Removed segments");
    Ok(())
}

/// Remove every playlist and segment for a camera
pub fn remove_all_playlists(dir: &Path, base: &str) -> io::Result<usize> {
    info!(dir = %dir.display(), base, "Removing all playlists");
    if !dir.exists() {
        return Ok(0);
    }
    let segments = remove_matching(dir, base, ".ts")?;
    let playlists = remove_matching(dir, base, &format!(".{}", PLAYLIST_EXTENSION))?;
    Ok(segments + playlists)
}
