//! Session channel
//!
//! Wraps the sandboxed shell process. Serial bytes flow both ways over the
//! PTY; file reads and writes go out-of-band through the filesystem the
//! child shares, so seed scripts and the startup file never echo.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::sentinel::generate_bashrc;
use crate::validate::SandboxProbe;

/// Serial + out-of-band operations the driver and validator need.
///
/// The probe queries inherited from [`SandboxProbe`] each send TWO serial
/// commands and therefore produce two sentinel pairs; callers must
/// pre-increment the parser's skip counter by 2 before invoking them.
pub trait SessionChannel: SandboxProbe + Send + Sync + 'static {
    /// Forward keystrokes or a command line to the shell's serial input.
    fn send_serial(&self, text: &str) -> Result<()>;

    /// Create or overwrite a file without going through the serial tty.
    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()>;
}

/// PTY-backed sandbox shell.
pub struct PtyShell {
    sandbox_root: PathBuf,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    running: Arc<AtomicBool>,
    rcfile: PathBuf,
    probe_poll: Duration,
    probe_timeout: Duration,
}

impl PtyShell {
    /// Spawn bash inside a PTY with the sentinel-instrumented rcfile.
    ///
    /// Returns the shell plus the raw serial byte stream for the pump.
    pub fn spawn(config: &SessionConfig) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>)> {
        std::fs::create_dir_all(&config.sandbox_root)
            .with_context(|| format!("creating sandbox root {}", config.sandbox_root.display()))?;

        // The rcfile goes out-of-band so its text never echoes.
        let rcfile =
            std::env::temp_dir().join(format!("shellcoach-bashrc-{}.sh", Uuid::new_v4()));
        let bashrc = generate_bashrc(
            &config.sandbox_root_str(),
            &config.user,
            &config.hostname,
        );
        std::fs::write(&rcfile, bashrc)
            .with_context(|| format!("writing rcfile {}", rcfile.display()))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("openpty failed: {e}"))?;

        let mut cmd = CommandBuilder::new(&config.shell);
        cmd.args(["-i", "--noprofile", "--rcfile"]);
        cmd.arg(&rcfile);
        cmd.cwd(&config.sandbox_root);
        cmd.env("HOME", &config.sandbox_root);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("spawning {} failed: {e}", config.shell))?;
        let pid = child.process_id();
        info!(pid = ?pid, shell = %config.shell, root = %config.sandbox_root.display(), "Sandbox shell spawned");

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("taking PTY writer: {e}"))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("cloning PTY reader: {e}"))?;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        // Blocking reads bridge into the async world over the channel.
        let running_for_read = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            while running_for_read.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "PTY read error");
                        break;
                    }
                }
            }
            running_for_read.store(false, Ordering::SeqCst);
            debug!("PTY reader exiting");
        });

        let shell = Arc::new(Self {
            sandbox_root: config.sandbox_root.clone(),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            running,
            rcfile,
            probe_poll: Duration::from_millis(config.timing.probe_poll_ms),
            probe_timeout: Duration::from_millis(config.timing.probe_timeout_ms),
        });

        Ok((shell, rx))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// Kill the child and drop the serial endpoints.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.lock_child().take() {
            let _ = child.kill();
        }
        *self.lock_writer() = None;
        let _ = std::fs::remove_file(&self.rcfile);
        info!("Sandbox shell shut down");
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn Write + Send>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_child(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn Child + Send + Sync>>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a probe command redirected to a temp file, read the file
    /// out-of-band once its contents settle, then delete it over serial.
    async fn run_probe(&self, command: &str) -> Result<String> {
        let tmp = std::env::temp_dir().join(format!(".shellcoach-probe-{}", Uuid::new_v4()));
        let tmp_str = tmp.to_string_lossy();

        self.send_serial(&format!("{command} > {tmp_str} 2>/dev/null\n"))?;
        let content = self.await_probe_file(&tmp).await;
        self.send_serial(&format!("rm -f {tmp_str}\n"))?;

        content
    }

    /// Poll the probe temp file until it exists and two consecutive reads
    /// agree; the redirection creates it before the probe finishes writing.
    async fn await_probe_file(&self, path: &Path) -> Result<String> {
        let deadline = tokio::time::Instant::now() + self.probe_timeout;
        let mut last: Option<String> = None;
        loop {
            tokio::time::sleep(self.probe_poll).await;
            if path.exists() {
                let current = std::fs::read_to_string(path).unwrap_or_default();
                if last.as_deref() == Some(current.as_str()) {
                    return Ok(current);
                }
                last = Some(current);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(last.unwrap_or_default());
            }
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SandboxProbe for PtyShell {
    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }

    async fn has_dir_with_file(&self, root: &str) -> Result<bool> {
        let out = self
            .run_probe(&format!(
                "find {} -mindepth 2 -maxdepth 2 -type f",
                shell_quote(root)
            ))
            .await?;
        Ok(!out.trim().is_empty())
    }

    async fn find_file_containing(&self, root: &str, needle: &str) -> Result<bool> {
        let out = self
            .run_probe(&format!(
                "grep -rl -- {} {}",
                shell_quote(needle),
                shell_quote(root)
            ))
            .await?;
        Ok(!out.trim().is_empty())
    }
}

impl SessionChannel for PtyShell {
    fn send_serial(&self, text: &str) -> Result<()> {
        let mut guard = self.lock_writer();
        let writer = guard.as_mut().ok_or_else(|| anyhow!("serial writer gone"))?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        debug!(len = text.len(), "Serial write");
        Ok(())
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), len = bytes.len(), "Out-of-band file write");
        Ok(())
    }
}

/// Single-quote a string for safe interpolation into a bash command line.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}
