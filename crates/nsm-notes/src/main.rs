//! nsm-notes entry point.
//!
//! A headless session client that keeps one plain-text note per session.
//! Lines typed on stdin are appended to the note and reported as unsaved
//! changes; the session manager decides when the note is saved.

use std::cell::RefCell;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use nsm_client::{
    CallbackError, ClientConfig, ErrorCode, MessagePriority, NsmClient, PollOutcome,
    nsm_url_from_env,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod notes;

use notes::Note;

const APP_NAME: &str = "nsm-notes";
const DEFAULT_CAPABILITIES: [&str; 4] = ["dirty", "optional-gui", "message", "progress"];

/// nsm-notes - plain-text notes kept by a session manager
#[derive(Parser, Debug)]
#[command(name = "nsm-notes")]
#[command(version, about, long_about = None)]
struct Args {
    /// Manager endpoint (defaults to `$NSM_URL`)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Config file (defaults to `~/.config/nsm-notes/config.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Name shown by the session manager
    #[arg(long)]
    name: Option<String>,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nsm={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("{APP_NAME}-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => ClientConfig::default_path(APP_NAME)?,
    };
    let mut config = ClientConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(name) = &args.name {
        config.pretty_name = Some(name.clone());
    }
    if config.pretty_name.is_none() {
        config.pretty_name = Some("Notes".to_string());
    }
    if config.capabilities.is_empty() {
        config.capabilities = DEFAULT_CAPABILITIES.map(String::from).to_vec();
    }
    Ok(config)
}

/// Forward stdin lines to the poll loop.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });
    rx
}

fn register_handlers(client: &mut NsmClient, note: &Rc<RefCell<Note>>) -> Result<()> {
    let notifier = client.notifier()?;

    let open_note = Rc::clone(note);
    let open_notifier = notifier.clone();
    client.on_open(move |request| {
        let mut note = open_note.borrow_mut();
        note.open(Path::new(&request.path)).map_err(|e| {
            CallbackError::with_code(
                ErrorCode::CreateFailed,
                format!("cannot open note: {e}"),
            )
        })?;
        info!("Opened note for {:?}", request.display_name);
        let greeting = format!("Opened {}", request.client_id);
        if let Err(e) = open_notifier.send_message(MessagePriority::Lowest, greeting) {
            warn!("{e}");
        }
        Ok(())
    });

    let save_note = Rc::clone(note);
    let save_notifier = notifier.clone();
    client.on_save(move || {
        if let Err(e) = save_notifier.send_progress(0.0) {
            warn!("{e}");
        }
        let mut note = save_note.borrow_mut();
        note.save()
            .map_err(|e| CallbackError::new(format!("cannot save note: {e}")))?;
        if let Err(e) = save_notifier.send_progress(1.0) {
            warn!("{e}");
        }
        if let Some(path) = note.path() {
            info!("Saved {} bytes to {}", note.content().len(), path.display());
        }
        Ok(())
    });

    client.on_session_is_loaded(|| {
        info!("Session loaded");
        Ok(())
    });

    let shown = notifier.clone();
    client.on_show_gui(move || {
        info!("Showing note view");
        shown.send_gui_shown().map_err(|e| CallbackError::new(e.to_string()))
    });

    let hidden = notifier;
    client.on_hide_gui(move || {
        info!("Hiding note view");
        hidden
            .send_gui_hidden()
            .map_err(|e| CallbackError::new(e.to_string()))
    });

    client.on_active(|active| {
        if active {
            info!("Session manager connected");
        } else {
            warn!("Session manager refused us");
        }
    });

    Ok(())
}

fn run(config: &ClientConfig, url: &str) -> Result<()> {
    let note = Rc::new(RefCell::new(Note::default()));

    let mut client = NsmClient::from_config(config).context("Invalid client config")?;
    client
        .init(url)
        .with_context(|| format!("Failed to connect to session manager at {url}"))?;
    register_handlers(&mut client, &note)?;
    client.handle_termination_signals()?;

    if let Err(e) = client.announce() {
        client.stop();
        return Err(e).context("Session manager did not accept the announce");
    }
    info!(
        "Registered with {} (capabilities {})",
        client.manager_name(),
        client.manager_capabilities().encode()
    );

    let lines = spawn_stdin_reader();
    let poll_interval = config.poll_interval();

    loop {
        match client.check_wait(poll_interval) {
            Ok(PollOutcome::Terminated) => break,
            Ok(PollOutcome::Idle | PollOutcome::Handled) => {}
            Err(e) => warn!("{e}"),
        }

        while let Ok(line) = lines.try_recv() {
            if note.borrow_mut().append(&line) {
                client.send_is_dirty()?;
            }
        }
    }

    if note.borrow().is_dirty() {
        warn!("Exiting with unsaved notes");
    }
    client.stop();
    info!("nsm-notes stopped");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging();

    let config = load_config(&args)?;
    let url = args
        .url
        .clone()
        .or_else(nsm_url_from_env)
        .context("NSM_URL is not set; nsm-notes must be launched by a session manager")?;

    info!("Starting nsm-notes...");
    run(&config, &url)
}
