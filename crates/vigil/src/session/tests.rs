use super::*;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tempfile::TempDir;

use crate::command::{ControlMessage, MmapParams, VideoSetting};
use crate::frame::VideoFrame;
use crate::live_view::{read_file, Snapshot};
use crate::mailbox::{events, mailbox, ControlSender, EventReceiver};
use crate::pipeline::{OpenOptions, TimestampFlags};

#[derive(Default)]
struct ReaderLog {
    name: String,
    fail_opens: u32,
    uris: Vec<String>,
    closes: u32,
    running: bool,
    frames: VecDeque<VideoFrame>,
    enabled: Vec<(u32, u64)>,
    disabled: Vec<u32>,
    limits: Vec<(u32, u32)>,
    volume: Option<u32>,
    flushes: Vec<Option<u64>>,
    failed_moves: Vec<String>,
}

/// Decode layer driven entirely by the test
struct ScriptedReader(StdMutex<ReaderLog>);

impl ScriptedReader {
    fn new(fail_opens: u32) -> Arc<Self> {
        Arc::new(Self(StdMutex::new(ReaderLog {
            name: "porch".into(),
            fail_opens,
            ..Default::default()
        })))
    }

    fn log(&self) -> std::sync::MutexGuard<'_, ReaderLog> {
        self.0.lock().unwrap()
    }

    fn push(&self, frame: VideoFrame) {
        self.log().frames.push_back(frame);
    }
}

impl StreamReader for ScriptedReader {
    fn location_name(&self) -> String {
        self.log().name.clone()
    }
    fn set_location_name(&self, name: &str) {
        self.log().name = name.to_string();
    }
    fn open(&self, uri: &str, _options: &OpenOptions) -> anyhow::Result<()> {
        let mut log = self.log();
        log.uris.push(uri.to_string());
        if log.fail_opens > 0 {
            log.fail_opens -= 1;
            bail!("connection refused");
        }
        log.running = true;
        Ok(())
    }
    fn close(&self) {
        let mut log = self.log();
        log.closes += 1;
        log.running = false;
    }
    fn is_running(&self) -> bool {
        self.log().running
    }
    fn next_frame(&self) -> Option<VideoFrame> {
        self.log().frames.pop_front()
    }
    fn proc_size(&self) -> (u32, u32) {
        (320, 240)
    }
    fn initial_frame_buffer_size(&self) -> u32 {
        4096
    }
    fn newest_frame_jpeg(&self, _width: u32, _height: u32) -> anyhow::Result<Bytes> {
        Ok(Bytes::from_static(b"\xff\xd8"))
    }
    fn enable_live_stream(
        &self,
        profile: u32,
        _playlist: &Path,
        _timestamps: TimestampFlags,
        start_index: u64,
    ) -> anyhow::Result<()> {
        self.log().enabled.push((profile, start_index));
        Ok(())
    }
    fn disable_live_stream(&self, profile: u32) {
        self.log().disabled.push(profile);
    }
    fn set_live_stream_limits(&self, max_resolution: u32, max_bitrate: u32) -> anyhow::Result<()> {
        self.log().limits.push((max_resolution, max_bitrate));
        Ok(())
    }
    fn flush(&self, until_ms: Option<u64>) {
        self.log().flushes.push(until_ms);
    }
    fn set_mmap_params(&self, _params: MmapParams) {}
    fn set_audio_volume(&self, volume: u32) {
        self.log().volume = Some(volume);
    }
    fn take_failed_moves(&self) -> Vec<String> {
        std::mem::take(&mut self.log().failed_moves)
    }
}

#[derive(Default)]
struct DataLog {
    reports: Vec<(u64, bool)>,
    finished: u64,
    new_objects: u32,
    flushes: u32,
    resets: u32,
    terminates: u32,
    thumbnail: Option<(u32, u32)>,
    port: Option<u16>,
}

/// Finishes every analytics frame as soon as it is reported
struct RecordingDataManager(Arc<StdMutex<DataLog>>);

impl DataManager for RecordingDataManager {
    fn report_frame(&mut self, ms: u64, frame: Option<&VideoFrame>) {
        let mut log = self.0.lock().unwrap();
        log.reports.push((ms, frame.is_some()));
        if frame.is_some() {
            log.finished = log.finished.max(ms);
        }
    }
    fn take_new_object_count(&mut self) -> u32 {
        std::mem::take(&mut self.0.lock().unwrap().new_objects)
    }
    fn finished_timestamp(&self) -> u64 {
        self.0.lock().unwrap().finished
    }
    fn flush(&mut self, _timeout: Duration) -> anyhow::Result<()> {
        self.0.lock().unwrap().flushes += 1;
        Ok(())
    }
    fn reset(&mut self) {
        self.0.lock().unwrap().resets += 1;
    }
    fn terminate(&mut self) {
        self.0.lock().unwrap().terminates += 1;
    }
    fn set_thumbnail_resolution(&mut self, width: u32, height: u32) {
        self.0.lock().unwrap().thumbnail = Some((width, height));
    }
    fn set_analytics_port(&mut self, port: u16) {
        self.0.lock().unwrap().port = Some(port);
    }
}

struct CountingPipeline {
    frames: Arc<AtomicU64>,
    paths: Arc<StdMutex<Vec<String>>>,
}

impl AnalyticsPipeline for CountingPipeline {
    fn process_frame(&mut self, _frame: &VideoFrame, _ms: u64) -> anyhow::Result<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn update_video_path(&mut self, camera: &str) {
        self.paths.lock().unwrap().push(camera.to_string());
    }
}

struct RecordingClips(Arc<StdMutex<Vec<String>>>);

impl ClipStore for RecordingClips {
    fn set_merge_threshold(&mut self, camera: &str, threshold_secs: u32) {
        self.0
            .lock()
            .unwrap()
            .push(format!("threshold {} {}", camera, threshold_secs));
    }
    fn mark_times_saved(&mut self, camera: &str, ranges: &[(u64, u64)]) {
        self.0
            .lock()
            .unwrap()
            .push(format!("saved {} {:?}", camera, ranges));
    }
}

struct Harness {
    session: CaptureSession,
    control: ControlSender,
    events: EventReceiver,
    reader: Arc<ScriptedReader>,
    data: Arc<StdMutex<DataLog>>,
    analysed: Arc<AtomicU64>,
    paths: Arc<StdMutex<Vec<String>>>,
    clips: Arc<StdMutex<Vec<String>>>,
    dir: TempDir,
}

fn config(dir: &Path) -> SessionConfig {
    SessionConfig {
        camera: "porch".into(),
        uri: "rtsp://10.0.0.4/live".into(),
        tmp_dir: dir.join("tmp"),
        user_dir: dir.join("user"),
        record_size: (4, 4),
        local_source: Some(false),
        ..Default::default()
    }
}

fn probes(space_ok: impl Fn() -> bool + Send + Sync + 'static, rss: Option<u64>) -> HostProbes {
    HostProbes {
        free_space_ok: Arc::new(move |_: &Path, _: u64| space_ok()),
        rss_bytes: Arc::new(move || rss),
    }
}

fn plenty_of_space() -> HostProbes {
    probes(|| true, None)
}

fn harness(tweak: impl FnOnce(&mut SessionConfig), reader: Arc<ScriptedReader>, host: HostProbes) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    tweak(&mut config);

    let data = Arc::new(StdMutex::new(DataLog::default()));
    let analysed = Arc::new(AtomicU64::new(0));
    let paths = Arc::new(StdMutex::new(Vec::new()));
    let clips = Arc::new(StdMutex::new(Vec::new()));

    let (frames, video_paths) = (analysed.clone(), paths.clone());
    let pipelines = move |_camera: &str| -> Box<dyn AnalyticsPipeline> {
        Box::new(CountingPipeline {
            frames: frames.clone(),
            paths: video_paths.clone(),
        })
    };

    let clip_store: Box<dyn ClipStore> = Box::new(RecordingClips(clips.clone()));
    let collaborators = Collaborators {
        reader: reader.clone(),
        pipelines: Box::new(pipelines),
        data_manager: Box::new(RecordingDataManager(data.clone())),
        clip_store: Arc::new(Mutex::new(clip_store)),
        log_control: None,
    };

    let (control, mailbox) = mailbox(64);
    let (event_tx, events) = events(1024);
    let session = CaptureSession::new(config, collaborators, mailbox, event_tx).with_probes(host);

    Harness {
        session,
        control,
        events,
        reader,
        data,
        analysed,
        paths,
        clips,
        dir,
    }
}

fn frame(ms: u64) -> VideoFrame {
    VideoFrame::rgb(ms, 4, 4, Bytes::from(vec![(ms % 251) as u8; 48]))
}

/// Plays the supervisor: acknowledges the terminate handshake and
/// optionally quits as soon as the stream opens. Resolves to every event
/// once the session is dropped.
fn supervise(
    mut events: EventReceiver,
    control: ControlSender,
    quit_on_open: bool,
) -> tokio::task::JoinHandle<Vec<SessionEvent>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            match &event {
                SessionEvent::CanTerminate { .. } => {
                    let _ = control.send(ControlMessage::CanTerminate).await;
                }
                SessionEvent::StreamOpenSucceeded { .. } if quit_on_open => {
                    let _ = control.send(ControlMessage::Quit { response: None }).await;
                }
                _ => {}
            }
            seen.push(event);
        }
        seen
    })
}

fn open_failures(events: &[SessionEvent]) -> Vec<Option<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StreamOpenFailed { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn eleven_failed_opens_is_fatal() {
    let Harness {
        mut session,
        control,
        events,
        reader,
        dir: _dir,
        ..
    } = harness(|_| {}, ScriptedReader::new(u32::MAX), plenty_of_space());
    let supervisor = supervise(events, control, false);

    let start = Instant::now();
    let result = session.run().await;
    assert!(matches!(result, Err(SessionError::TooManyFailures { retries: 11 })));
    assert_eq!(reader.log().uris.len(), 11);
    // 0 + 20 * 3 + 60 * 7 seconds of back-off
    assert_eq!(start.elapsed().as_secs(), 480);
    assert_eq!(session.state(), SessionState::Closed);

    drop(session);
    let seen = supervisor.await.unwrap();
    // The first failure is not reported
    assert_eq!(open_failures(&seen), vec![None; 10]);
    let tail: Vec<_> = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::CanTerminate { .. } | SessionEvent::Terminate { .. }))
        .collect();
    assert_eq!(tail.len(), 2, "fatal errors run the terminate handshake");
}

#[tokio::test(start_paused = true)]
async fn low_space_skips_open_and_reports_reason() {
    let checks = Arc::new(AtomicU32::new(0));
    let counter = checks.clone();
    let host = probes(move || counter.fetch_add(1, Ordering::SeqCst) >= 3, None);
    let Harness {
        mut session,
        control,
        events,
        reader,
        dir: _dir,
        ..
    } = harness(|_| {}, ScriptedReader::new(0), host);
    let supervisor = supervise(events, control, true);

    session.run().await.unwrap();
    assert_eq!(reader.log().uris.len(), 1, "no open attempts while space is short");

    drop(session);
    let seen = supervisor.await.unwrap();
    assert_eq!(
        open_failures(&seen),
        vec![Some(LOW_DISK_SPACE_REASON.to_string()); 2]
    );
    assert!(seen
        .iter()
        .any(|e| matches!(e, SessionEvent::StreamOpenSucceeded { frame_size: (320, 240), .. })));
}

#[tokio::test(start_paused = true)]
async fn low_space_alone_never_gives_up() {
    let host = probes(|| false, None);
    let Harness {
        mut session,
        control,
        reader,
        events: _events,
        dir: _dir,
        ..
    } = harness(|_| {}, ScriptedReader::new(0), host);

    let quit = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        control.send(ControlMessage::Quit { response: None }).await.unwrap();
    });

    session.run().await.unwrap();
    quit.await.unwrap();
    assert!(reader.log().uris.is_empty());
}

#[tokio::test(start_paused = true)]
async fn quit_during_backoff_echoes_response() {
    let mut h = harness(|_| {}, ScriptedReader::new(u32::MAX), plenty_of_space());
    h.control
        .send(ControlMessage::Quit {
            response: Some("bye".into()),
        })
        .await
        .unwrap();

    h.session.run().await.unwrap();
    assert_eq!(h.reader.log().uris.len(), 1);
    assert!(h.session.web_port().is_none());

    let seen = h.events.drain();
    assert!(matches!(seen.first(), Some(SessionEvent::FrameSizeUpdated { size: 4096, .. })));
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::QuitResponse { token: "bye".into() })
    );
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::CanTerminate { .. })));
}

#[tokio::test(start_paused = true)]
async fn uri_change_cuts_backoff_short() {
    let Harness {
        mut session,
        control,
        events,
        reader,
        dir: _dir,
        ..
    } = harness(|c| c.uri = RedactedString::default(), ScriptedReader::new(2), plenty_of_space());
    control
        .send(ControlMessage::CameraUriUpdated {
            uri: "rtsp://admin:pw@10.0.0.7/live".into(),
        })
        .await
        .unwrap();
    let supervisor = supervise(events, control, true);

    let start = Instant::now();
    session.run().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(
        reader.log().uris,
        vec!["", "rtsp://admin:pw@10.0.0.7/live", "rtsp://admin:pw@10.0.0.7/live"]
    );

    drop(session);
    let seen = supervisor.await.unwrap();
    assert!(open_failures(&seen).is_empty(), "attempt counter restarts on a new URI");
}

#[tokio::test(start_paused = true)]
async fn low_space_while_running_is_fatal() {
    let checks = Arc::new(AtomicU32::new(0));
    let counter = checks.clone();
    let host = probes(move || counter.fetch_add(1, Ordering::SeqCst) == 0, None);
    let Harness {
        mut session,
        control,
        events,
        dir: _dir,
        ..
    } = harness(
        |c| c.timing.frame_timeout = Duration::from_secs(3600),
        ScriptedReader::new(0),
        host,
    );
    let supervisor = supervise(events, control, false);

    let start = Instant::now();
    let result = session.run().await;
    assert!(matches!(result, Err(SessionError::OutOfSpace { .. })));
    assert!(start.elapsed() >= Duration::from_secs(30));

    drop(session);
    let seen = supervisor.await.unwrap();
    assert_eq!(
        open_failures(&seen),
        vec![Some(LOW_DISK_SPACE_REASON.to_string())]
    );
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::PortChanged { .. })));
    assert!(matches!(seen.last(), Some(SessionEvent::Terminate { .. })));
}

#[tokio::test(start_paused = true)]
async fn local_source_skips_warmup_frames() {
    let mut h = harness(|c| c.local_source = Some(true), ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();

    for i in 0..26 {
        h.reader.push(frame(i * 40));
    }
    for _ in 0..25 {
        assert!(h.session.process_frame().await.unwrap());
    }
    let stats = h.session.stats();
    assert_eq!((stats.frames_skipped, stats.frames_processed, stats.frames_interpolated), (25, 0, 0));
    assert!(h.data.lock().unwrap().reports.is_empty());

    assert!(h.session.process_frame().await.unwrap());
    let stats = h.session.stats();
    assert_eq!((stats.frames_skipped, stats.frames_processed), (25, 1));
    assert_eq!(h.analysed.load(Ordering::SeqCst), 1);
    assert_eq!(h.data.lock().unwrap().reports, vec![(1000, true)]);
}

#[tokio::test(start_paused = true)]
async fn dummy_frames_only_report_timestamps() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();

    h.reader.push(frame(0));
    h.reader.push(VideoFrame::dummy(40));
    h.session.process_frame().await.unwrap();
    h.session.process_frame().await.unwrap();

    let stats = h.session.stats();
    assert_eq!((stats.frames_processed, stats.frames_interpolated), (1, 1));
    assert_eq!(h.data.lock().unwrap().reports, vec![(0, true), (40, false)]);
    assert_eq!(h.analysed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn progress_notified_on_objects_or_silence() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.events.drain();

    for ms in [0, 500, 1000, 1600] {
        h.reader.push(frame(ms));
        h.session.process_frame().await.unwrap();
    }
    h.data.lock().unwrap().new_objects = 2;
    h.reader.push(frame(1700));
    h.session.process_frame().await.unwrap();

    let progress: Vec<u64> = h
        .events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::ProcessedData { processed_ms, .. } => Some(processed_ms),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![1600, 1700]);
}

#[tokio::test(start_paused = true)]
async fn frame_timeout_reconnects() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.reader.push(frame(0));
    h.session.process_frame().await.unwrap();

    assert!(!h.session.process_frame().await.unwrap());
    assert_eq!(h.session.stats().reconnects, 0);

    tokio::time::advance(Duration::from_secs(16)).await;
    assert!(!h.session.process_frame().await.unwrap());

    let stats = h.session.stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.state, SessionState::Running);
    assert_eq!(stats.frames_processed, 0, "counters reset by the flush");
    assert_eq!(h.reader.log().uris.len(), 2);
    assert_eq!(h.reader.log().closes, 1);
    assert!(*h.session.shared.stream_opened.lock().await);
    assert!(!h.session.shared.is_cleaning_up());

    let data = h.data.lock().unwrap();
    assert_eq!(data.flushes, 1);
    assert_eq!(data.resets, 1);
    assert_eq!(data.terminates, 1);
}

#[tokio::test(start_paused = true)]
async fn stopped_source_reconnects() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();

    h.reader.log().running = false;
    assert!(!h.session.process_frame().await.unwrap());
    assert_eq!(h.session.stats().reconnects, 1);
    assert!(h.reader.is_running());
}
#[tokio::test(start_paused = true)]
async fn uri_update_reclassifies_local_source() {
    let mut h = harness(
        |c| {
            c.local_source = None;
            c.uri = RedactedString::default();
        },
        ScriptedReader::new(0),
        plenty_of_space(),
    );
    h.session.running = true;
    h.session
        .handle_message(ControlMessage::CameraUriUpdated { uri: "device:0".into() })
        .await;
    h.session.open_stream().await.unwrap();
    assert_eq!(h.reader.log().uris, vec!["device:0"]);

    for i in 0..5 {
        h.reader.push(frame(i * 40));
        assert!(h.session.process_frame().await.unwrap());
    }
    let stats = h.session.stats();
    assert_eq!((stats.frames_skipped, stats.frames_processed), (5, 0));

    // Back to a network camera: no more warm-up skipping
    h.session
        .handle_message(ControlMessage::CameraUriUpdated {
            uri: "rtsp://10.0.0.4/live".into(),
        })
        .await;
    h.reader.push(frame(200));
    assert!(h.session.process_frame().await.unwrap());
    let stats = h.session.stats();
    assert_eq!((stats.frames_skipped, stats.frames_processed), (5, 1));
}

#[tokio::test(start_paused = true)]
async fn configured_local_source_survives_uri_update() {
    let mut h = harness(|c| c.local_source = Some(false), ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session
        .handle_message(ControlMessage::CameraUriUpdated { uri: "device:0".into() })
        .await;
    h.session.open_stream().await.unwrap();

    h.reader.push(frame(0));
    assert!(h.session.process_frame().await.unwrap());
    let stats = h.session.stats();
    assert_eq!((stats.frames_skipped, stats.frames_processed), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn failed_archive_moves_are_reported() {
    let Harness {
        mut session,
        control,
        events,
        reader,
        dir: _dir,
        ..
    } = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    reader.log().failed_moves.push("2024/01/porch-0001.mp4".into());
    let supervisor = supervise(events, control, true);

    session.run().await.unwrap();
    assert!(reader.log().failed_moves.is_empty());

    drop(session);
    let seen = supervisor.await.unwrap();
    let failed: Vec<&SessionEvent> = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::FileMoveFailed { .. }))
        .collect();
    assert_eq!(
        failed,
        vec![&SessionEvent::FileMoveFailed {
            camera: "porch".into(),
            target: "2024/01/porch-0001.mp4".into(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn moves_failing_during_close_are_reported() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.events.drain();

    h.reader.log().failed_moves.push("clips/a.mp4".into());
    h.session.cleanup(false, false).await;
    assert!(h.events.drain().contains(&SessionEvent::FileMoveFailed {
        camera: "porch".into(),
        target: "clips/a.mp4".into(),
    }));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cleanup_runs_once() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.session.start_web().await.unwrap();
    assert!(h.session.web_port().is_some());

    h.session.cleanup(false, true).await;
    h.session.cleanup(false, true).await;

    assert!(h.session.web_port().is_none());
    assert!(h.session.shared.is_cleaning_up());
    assert_eq!(h.reader.log().closes, 1);
    let size_reports = h
        .events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::FrameSizeUpdated { .. }))
        .count();
    assert_eq!(size_reports, 1);
}

#[tokio::test(start_paused = true)]
async fn cleanup_removes_playlists() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    let remote = h.dir.path().join("user").join("remote");
    std::fs::create_dir_all(&remote).unwrap();
    for name in ["porch.m3u8local", "porch-1.m3u8local", "porch-10001.ts", "garage.m3u8local"] {
        std::fs::write(remote.join(name), "x").unwrap();
    }

    h.session.cleanup(false, false).await;

    let mut left: Vec<PathBuf> = std::fs::read_dir(&remote)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    left.sort();
    assert_eq!(left, vec![remote.join("garage.m3u8local")]);
}

#[tokio::test(start_paused = true)]
async fn memory_pressure_quits_with_handshake() {
    let mut h = harness(
        |c| c.memory_limit_mb = Some(1024),
        ScriptedReader::new(0),
        probes(|| true, Some(2 << 30)),
    );
    h.session.running = true;
    h.session.open_stream().await.unwrap();

    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    h.reader.push(frame(0));
    h.session.process_frame().await.unwrap();

    assert!(!h.session.running);
    assert!(h.session.terminate_on_exit);
    assert!(h
        .events
        .drain()
        .contains(&SessionEvent::MemoryLimitExceeded {
            camera: "porch".into(),
            rss_bytes: 2 << 30
        }));
}

#[tokio::test(start_paused = true)]
async fn memory_under_limit_keeps_running() {
    let mut h = harness(
        |c| c.memory_limit_mb = Some(1024),
        ScriptedReader::new(0),
        probes(|| true, Some(100 << 20)),
    );
    h.session.running = true;
    h.session.open_stream().await.unwrap();

    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    h.reader.push(frame(0));
    h.session.process_frame().await.unwrap();
    assert!(h.session.running);
}

#[tokio::test(start_paused = true)]
async fn handshake_applies_messages_until_acknowledged() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.control
        .send(ControlMessage::SetAudioVolume { volume: 30 })
        .await
        .unwrap();
    h.control
        .send(ControlMessage::Quit {
            response: Some("later".into()),
        })
        .await
        .unwrap();
    h.control.send(ControlMessage::CanTerminate).await.unwrap();

    h.session.terminate_handshake().await;

    assert_eq!(h.reader.log().volume, Some(30));
    assert_eq!(h.session.quit_responses, vec!["later".to_string()]);
    assert_eq!(
        h.events.drain(),
        vec![
            SessionEvent::CanTerminate { camera: "porch".into() },
            SessionEvent::Terminate { camera: "porch".into() },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn handshake_ends_when_mailbox_closes() {
    let Harness {
        mut session,
        control,
        mut events,
        dir: _dir,
        ..
    } = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    drop(control);

    session.terminate_handshake().await;
    assert!(matches!(events.drain().last(), Some(SessionEvent::Terminate { .. })));
}

#[tokio::test(start_paused = true)]
async fn dispatcher_applies_settings() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.events.drain();
    h.session.video_settings_changed = false;

    h.session.handle_message(ControlMessage::SetVideoSetting(VideoSetting::MaxBitrate(512))).await;
    assert!(!h.session.video_settings_changed, "unchanged value");
    h.session.handle_message(ControlMessage::SetVideoSetting(VideoSetting::MaxBitrate(800))).await;
    assert!(h.session.video_settings_changed);

    h.session
        .handle_message(ControlMessage::SetVideoSetting(VideoSetting::ThumbnailResolution(320, 180)))
        .await;
    assert_eq!(h.data.lock().unwrap().thumbnail, Some((320, 180)));

    h.session.handle_message(ControlMessage::AnalyticsPortChanged { port: 7001 }).await;
    assert_eq!(h.data.lock().unwrap().port, Some(7001));

    h.session.handle_message(ControlMessage::FlushVideo { until_ms: Some(9000) }).await;
    assert_eq!(h.reader.log().flushes, vec![Some(9000)]);

    h.session
        .handle_message(ControlMessage::SetTimePrefs {
            use_12hr_time: false,
            use_us_date: false,
        })
        .await;
    assert!(!h.session.live.use_12hr_time);

    h.session
        .handle_message(ControlMessage::SetClipMergeThreshold { threshold_secs: 5 })
        .await;
    h.session
        .handle_message(ControlMessage::AddSavedTimes {
            ranges: vec![(1000, 2000)],
        })
        .await;
    assert_eq!(
        *h.clips.lock().unwrap(),
        vec!["threshold porch 5".to_string(), "saved porch [(1000, 2000)]".to_string()]
    );

    h.session
        .handle_message(ControlMessage::RenameCamera { name: "yard".into() })
        .await;
    assert_eq!(h.reader.location_name(), "yard");
    assert_eq!(*h.paths.lock().unwrap(), vec!["yard".to_string()]);
    assert_eq!(
        h.events.drain(),
        vec![SessionEvent::CameraRenamed {
            old: "porch".into(),
            new: "yard".into()
        }]
    );

    h.session
        .handle_message(ControlMessage::CameraUriUpdated {
            uri: "rtsp://10.0.0.4/live".into(),
        })
        .await;
    assert_eq!(h.session.uri.as_str(), "rtsp://10.0.0.4/live");

    h.session
        .handle_message(ControlMessage::SetDebugConfig {
            directives: "vigil=debug".into(),
        })
        .await;
    assert!(h.session.running);
}

#[tokio::test(start_paused = true)]
async fn live_view_follows_enable_and_disable() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    let path = h.session.config.live_view_path();
    assert_eq!(read_file(&path, 0).unwrap(), Snapshot::Closed);

    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.session.handle_message(ControlMessage::EnableLiveView).await;
    h.reader.push(frame(40));
    h.session.process_frame().await.unwrap();

    match read_file(&path, 0).unwrap() {
        Snapshot::Frame(f) => {
            assert_eq!((f.id, f.width, f.height), (1, 4, 4));
            assert_eq!(f.rgb.len(), 48);
        }
        other => panic!("Expected a frame, got {:?}", other),
    }

    h.session.handle_message(ControlMessage::DisableLiveView).await;
    assert_eq!(read_file(&path, 0).unwrap(), Snapshot::Closed);
}

#[tokio::test(start_paused = true)]
async fn live_view_scales_frames_to_the_requested_size() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    let path = h.session.config.live_view_path();
    h.session.running = true;
    h.session.open_stream().await.unwrap();
    h.session.handle_message(ControlMessage::EnableLiveView).await;

    // Larger than the 4x4 record size
    h.reader.push(VideoFrame::rgb(40, 8, 6, Bytes::from(vec![77u8; 8 * 6 * 3])));
    assert!(h.session.process_frame().await.unwrap());
    match read_file(&path, 0).unwrap() {
        Snapshot::Frame(f) => {
            assert_eq!((f.id, f.width, f.height), (1, 4, 4));
            assert_eq!(f.rgb.len(), 48);
        }
        other => panic!("Expected a frame, got {:?}", other),
    }

    h.session
        .handle_message(ControlMessage::SetMmapParams(MmapParams {
            large_view: false,
            width: 2,
            height: 2,
            fps: 5,
        }))
        .await;
    h.reader.push(frame(80));
    assert!(h.session.process_frame().await.unwrap());
    match read_file(&path, 1).unwrap() {
        Snapshot::Frame(f) => {
            assert_eq!((f.id, f.width, f.height), (2, 2, 2));
            assert_eq!(f.request_fps, 5.0);
            assert_eq!(f.rgb.len(), 12);
        }
        other => panic!("Expected a frame, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn live_streams_start_and_expire() {
    let mut h = harness(|_| {}, ScriptedReader::new(0), plenty_of_space());
    let remote = h.session.config.remote_dir();
    std::fs::create_dir_all(&remote).unwrap();
    let master = remote.join("porch.m3u8local");
    let low = remote.join("porch-1.m3u8local");
    std::fs::write(&master, "#EXTM3U\n").unwrap();
    std::fs::write(&low, "#EXTM3U\n").unwrap();

    // Nothing registered: no-op
    h.session.check_live_stream().await;
    assert!(h.reader.log().enabled.is_empty());

    let profiles = &h.session.shared.profiles;
    profiles.register_or_refresh(0, master.clone()).await;
    profiles.register_or_refresh(1, low.clone()).await;
    profiles.observe_segment_index(12).await;

    h.session.check_live_stream().await;
    assert_eq!(h.reader.log().enabled, vec![(0, 12), (1, 12)]);
    assert_eq!(h.reader.log().limits, vec![(480, 512)]);
    assert!(!h.session.video_settings_changed);

    tokio::time::advance(Duration::from_secs(11)).await;
    h.session.check_live_stream().await;

    assert_eq!(h.reader.log().disabled, vec![1, 0]);
    assert!(!master.exists());
    assert!(!low.exists());
    assert!(h.session.shared.profiles.is_empty().await);
    assert_eq!(h.session.shared.profiles.max_segment_index().await, 0);
}

#[tokio::test(start_paused = true)]
async fn new_session_clears_stale_state() {
    let dir = tempfile::tempdir().unwrap();
    let tmp = dir.path().join("tmp").join("porch");
    std::fs::create_dir_all(&tmp).unwrap();
    std::fs::write(tmp.join("stale.ts"), "x").unwrap();
    std::fs::write(tmp.join("pending.mp4"), "x").unwrap();

    let live = dir.path().join("user").join("live");
    std::fs::create_dir_all(&live).unwrap();
    std::fs::write(live.join("porch.live"), vec![7u8; 64]).unwrap();

    let user = dir.path().to_path_buf();
    let h = harness(
        move |c| {
            c.tmp_dir = user.join("tmp");
            c.user_dir = user.join("user");
            c.pending_moves = vec!["pending.mp4".into()];
        },
        ScriptedReader::new(0),
        plenty_of_space(),
    );

    assert!(!tmp.join("stale.ts").exists());
    assert!(tmp.join("pending.mp4").exists());
    assert_eq!(read_file(&live.join("porch.live"), 0).unwrap(), Snapshot::Closed);
    assert_eq!(h.data.lock().unwrap().thumbnail, Some((240, 135)));
    assert_eq!(h.session.state(), SessionState::Opening);
}
