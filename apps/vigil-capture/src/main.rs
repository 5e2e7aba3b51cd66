//! Vigil Capture Binary
//!
//! Runs one capture session for one camera. Control messages arrive as JSON
//! lines on stdin, session events leave as JSON lines on stdout and logs go
//! to stderr. Closing stdin stops the session.
//!
//! ## Usage
//!
//! ```bash
//! # Synthetic camera (no hardware)
//! VIGIL_CAMERA=porch VIGIL_USER_DIR=/tmp/vigil vigil-capture --test-source
//!
//! # Everything from a JSON file (SessionConfig fields)
//! VIGIL_CONFIG=/etc/vigil/porch.json vigil-capture --test-source
//!
//! # Ask it to stop
//! echo '{"Quit":{"response":"bye"}}' | vigil-capture --test-source --camera porch
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use vigil::{
    events, mailbox, CaptureSession, Collaborators, ControlMessage, ControlSender, EventReceiver,
    SessionConfig,
};

/// Process configuration from environment/args
struct Config {
    session: SessionConfig,
    /// Use the synthetic decode layer instead of a real camera
    test_source: bool,
    /// Synthetic frame rate
    fps: u32,
}

impl Config {
    fn from_env() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let test_source = args.iter().any(|arg| arg == "--test-source");

        let mut session = match std::env::var("VIGIL_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read VIGIL_CONFIG {}", path))?;
                serde_json::from_str(&raw).with_context(|| format!("Invalid config in {}", path))?
            }
            Err(_) => SessionConfig::default(),
        };

        // Flags win over environment, which wins over the file
        if let Some(camera) = setting(&args, "--camera", "VIGIL_CAMERA") {
            session.camera = camera;
        }
        if let Some(uri) = setting(&args, "--uri", "VIGIL_URI") {
            session.uri = uri.into();
        }
        if let Some(dir) = setting(&args, "--tmp-dir", "VIGIL_TMP_DIR") {
            session.tmp_dir = PathBuf::from(dir);
        }
        if let Some(dir) = setting(&args, "--archive-dir", "VIGIL_ARCHIVE_DIR") {
            session.archive_dir = PathBuf::from(dir);
        }
        if let Some(dir) = setting(&args, "--user-dir", "VIGIL_USER_DIR") {
            session.user_dir = PathBuf::from(dir);
        }
        if let Some(mb) = parsed(&args, "--min-free-mb", "VIGIL_MIN_FREE_MB")? {
            session.min_free_space_mb = mb;
        }
        if let Some(mb) = parsed(&args, "--memory-limit-mb", "VIGIL_MEMORY_LIMIT_MB")? {
            session.memory_limit_mb = Some(mb);
        }
        if let Some(addr) = parsed(&args, "--http-bind", "VIGIL_HTTP_BIND")? {
            session.http_bind = addr;
        }

        let fps = parsed(&args, "--fps", "VIGIL_FPS")?.unwrap_or(15);

        Ok(Self {
            session,
            test_source,
            fps,
        })
    }
}

/// `--flag value` from the command line, else the environment variable
fn setting(args: &[String], flag: &str, env: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| std::env::var(env).ok())
}

fn parsed<T>(args: &[String], flag: &str, env: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    setting(args, flag, env)
        .map(|raw| raw.parse::<T>().with_context(|| format!("Invalid value for {}: {}", flag, raw)))
        .transpose()
}

#[cfg(feature = "test-source")]
fn collaborators(config: &Config, log_control: vigil::logging::LogControl) -> Result<Collaborators> {
    use std::sync::Arc;
    use vigil::pipeline::ClipStore;
    use vigil::synthetic::{
        CountingPipeline, ImmediateDataManager, MemoryClipStore, TestSourceConfig, TestStreamReader,
    };

    if !config.test_source {
        anyhow::bail!("No camera decode layer in this build; run with --test-source");
    }

    info!("Starting synthetic camera at {} fps", config.fps);
    let (width, height) = config.session.record_size;
    let reader = TestStreamReader::new(TestSourceConfig {
        name: config.session.camera.clone(),
        fps: config.fps,
        width,
        height,
        ..Default::default()
    });
    let clip_store: Box<dyn ClipStore> = Box::new(MemoryClipStore::default());

    Ok(Collaborators {
        reader: Arc::new(reader),
        pipelines: CountingPipeline::factory(),
        data_manager: Box::new(ImmediateDataManager::default()),
        clip_store: Arc::new(tokio::sync::Mutex::new(clip_store)),
        log_control: Some(log_control),
    })
}

#[cfg(not(feature = "test-source"))]
fn collaborators(_config: &Config, _log_control: vigil::logging::LogControl) -> Result<Collaborators> {
    anyhow::bail!("Test source not enabled. Rebuild with --features test-source");
}

/// Forward JSON control lines from stdin until EOF
async fn read_control(control: ControlSender) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<ControlMessage>(&line) {
                Ok(msg) => {
                    if control.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed control line: {}", e),
            },
            Ok(None) => {
                info!("Control input closed");
                break;
            }
            Err(e) => {
                warn!("Control input error: {}", e);
                break;
            }
        }
    }
}

/// Write session events to stdout as JSON lines until the session is gone
async fn write_events(mut events: EventReceiver) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    debug!("Event output finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_control = vigil::logging::init("vigil=info");

    let config = Config::from_env()?;

    info!("Vigil capture starting");
    info!("  Camera: {}", config.session.camera);
    info!("  URI: {}", vigil::sanitize_uri(config.session.uri.as_str()));
    info!("  Tmp dir: {:?}", config.session.tmp_dir);
    info!("  User dir: {:?}", config.session.user_dir);

    let collaborators = collaborators(&config, log_control)?;

    let (control, inbox) = mailbox(64);
    let (event_tx, event_rx) = events(256);

    tokio::spawn(read_control(control));
    let writer = tokio::spawn(write_events(event_rx));

    let mut session = CaptureSession::new(config.session, collaborators, inbox, event_tx);
    let result = session.run().await;
    let stats = session.stats();
    drop(session);

    match writer.await {
        Ok(Err(e)) => warn!("Event output failed: {:#}", e),
        Err(e) => warn!("Event writer panicked: {}", e),
        Ok(Ok(())) => {}
    }

    info!(
        processed = stats.total_processed,
        reconnects = stats.reconnects,
        "Vigil capture stopped"
    );
    if let Err(e) = result {
        error!("Capture session failed: {}", e);
        std::process::exit(1);
    }
    // The stdin reader may still be parked in a blocking read
    std::process::exit(0);
}
