//! shellcoach-attach — attach the current terminal to a lesson session
//!
//! Spawns the sandbox shell, opens a lesson, and bridges stdin/stdout to
//! the session. Slash commands (/hint, /skip, /reset, ...) are handled by
//! the driver; Ctrl+Q detaches.

use std::io::{stdout, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::sync::mpsc;

use shellcoach_core::{
    DriverEvent, LessonData, LessonDriver, LessonLoader, PtyShell, SessionConfig, SessionEvent,
    ShellSession,
};

#[derive(Parser, Debug)]
#[command(name = "shellcoach-attach")]
#[command(about = "Run a shellcoach lesson in the current terminal")]
#[command(version)]
struct Args {
    /// Lesson to open: 1-based number or slug. Defaults to the first.
    lesson: Option<String>,

    /// Config file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the lessons directory
    #[arg(long)]
    lessons_dir: Option<PathBuf>,

    /// Wipe the sandbox before seeding
    #[arg(long)]
    clean: bool,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("SHELLCOACH_LOG_LEVEL") {
        v
    } else {
        "warn".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn pick_lesson(lessons: &[LessonData], wanted: Option<&str>) -> Result<LessonData> {
    match wanted {
        None => Ok(lessons[0].clone()),
        Some(sel) => {
            if let Ok(n) = sel.parse::<usize>() {
                if n >= 1 && n <= lessons.len() {
                    return Ok(lessons[n - 1].clone());
                }
                bail!("lesson number {n} out of range (1..={})", lessons.len());
            }
            lessons
                .iter()
                .find(|l| l.slug == sel || l.id == sel)
                .cloned()
                .with_context(|| format!("no lesson with slug or id '{sel}'"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path),
        None => SessionConfig::default(),
    };
    if let Some(dir) = args.lessons_dir {
        config.lessons_dir = dir;
    }

    let loader = LessonLoader::new(&config.lessons_dir);
    let lessons = loader.load_all()?;
    if lessons.is_empty() {
        bail!("no lessons found in {}", config.lessons_dir.display());
    }
    let lesson = pick_lesson(&lessons, args.lesson.as_deref())?;

    let (shell, bytes_rx) = PtyShell::spawn(&config)?;
    let session = ShellSession::new(config.sandbox_root_str(), config.timing.clone());
    session.start(bytes_rx);
    let driver = LessonDriver::new(Arc::clone(&session), Arc::clone(&shell), config);
    driver.run();

    eprintln!("\x1b[90mBooting sandbox shell...\x1b[0m");
    driver.wait_shell_ready().await?;
    driver.enter_lesson(lesson, args.clean).await?;

    eprintln!("\x1b[32mAttached. /help lists commands; Ctrl+Q detaches.\x1b[0m");

    enable_raw_mode()?;
    let running = Arc::new(AtomicBool::new(true));
    let (input_tx, mut input_rx) = mpsc::channel::<String>(32);

    // Blocking keyboard reader; decoded keys go over the channel.
    let running_input = Arc::clone(&running);
    let input_handle = tokio::task::spawn_blocking(move || {
        while running_input.load(Ordering::SeqCst) {
            if !event::poll(std::time::Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            let Ok(Event::Key(key)) = event::read() else {
                continue;
            };

            // Ctrl+Q detaches; everything else goes to the session.
            if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('q') {
                running_input.store(false, Ordering::SeqCst);
                break;
            }

            let data = match key.code {
                KeyCode::Char(c) => {
                    if key.modifiers.contains(KeyModifiers::CONTROL) {
                        let byte = (c.to_ascii_lowercase() as u8).wrapping_sub(b'a').wrapping_add(1);
                        if (1..=26).contains(&byte) {
                            (byte as char).to_string()
                        } else {
                            continue;
                        }
                    } else {
                        c.to_string()
                    }
                }
                KeyCode::Enter => "\r".to_string(),
                KeyCode::Backspace => "\x7f".to_string(),
                KeyCode::Tab => "\t".to_string(),
                KeyCode::Esc => "\x1b".to_string(),
                KeyCode::Up => "\x1b[A".to_string(),
                KeyCode::Down => "\x1b[B".to_string(),
                KeyCode::Right => "\x1b[C".to_string(),
                KeyCode::Left => "\x1b[D".to_string(),
                KeyCode::Home => "\x1b[H".to_string(),
                KeyCode::End => "\x1b[F".to_string(),
                KeyCode::PageUp => "\x1b[5~".to_string(),
                KeyCode::PageDown => "\x1b[6~".to_string(),
                KeyCode::Delete => "\x1b[3~".to_string(),
                _ => continue,
            };

            if input_tx.blocking_send(data).is_err() {
                break;
            }
        }
    });

    let mut session_events = session.subscribe();
    let mut driver_events = driver.subscribe();

    let result: Result<()> = loop {
        tokio::select! {
            ev = session_events.recv() => match ev {
                Ok(SessionEvent::Display(text)) | Ok(SessionEvent::Message(text)) => {
                    let mut out = stdout();
                    out.write_all(text.as_bytes())?;
                    out.flush()?;
                }
                Ok(SessionEvent::Exit) => {
                    break Ok(());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break Ok(()),
            },
            dev = driver_events.recv() => match dev {
                Ok(DriverEvent::CloseRequested) | Ok(DriverEvent::OpenLessonPicker) => {
                    break Ok(());
                }
                Ok(DriverEvent::OpenLesson(n)) => {
                    match pick_lesson(&lessons, Some(&n.to_string())) {
                        Ok(next) => {
                            driver.leave_lesson().await;
                            driver.enter_lesson(next, false).await?;
                        }
                        Err(e) => eprintln!("\r\n\x1b[31m{e}\x1b[0m"),
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break Ok(()),
            },
            data = input_rx.recv() => match data {
                Some(data) => driver.handle_input(&data).await?,
                None => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                // Forward the interrupt to the running command.
                driver.handle_input("\x03").await?;
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    let _ = input_handle.await;
    disable_raw_mode()?;
    shell.shutdown();
    eprintln!("\n\x1b[33mDetached from shellcoach session.\x1b[0m");

    result
}
