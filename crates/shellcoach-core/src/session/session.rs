//! Shell session byte pump
//!
//! Owns the sentinel parser and the clocks around it. Raw serial bytes
//! come in over a channel; coalesced chunks go through the parser; the
//! results fan out over a broadcast as [`SessionEvent`]s.
//!
//! Event ordering mirrors the parser's contract: for one chunk, the
//! message block (if any) goes first, then every display segment, then
//! `Ready`, then the command events. The display gate only ever drops
//! `Display` events — system messages and commands are never gated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::config::TimingConfig;
use crate::sentinel::{ByteCoalescer, CommandResult, ParserFlush, SentinelParser};

/// Events emitted by the session pump.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Atomic system-message block; bypasses the display gate.
    Message(String),
    /// Raw serial bytes for the terminal, ANSI and all.
    Display(String),
    /// First `CMD_END` observed; the shell prompt is live.
    Ready,
    /// A completed, non-skipped capture.
    Command(CommandResult),
    /// The serial stream ended.
    Exit,
}

/// Parser + coalescer behind a broadcast fan-out.
pub struct ShellSession {
    parser: Mutex<SentinelParser>,
    event_tx: broadcast::Sender<SessionEvent>,
    display_enabled: AtomicBool,
    /// Bumped by `reset` so in-flight timers and pump state invalidate.
    epoch: AtomicU64,
    timing: TimingConfig,
}

impl ShellSession {
    pub fn new(default_cwd: impl Into<String>, timing: TimingConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            parser: Mutex::new(SentinelParser::new(default_cwd)),
            event_tx,
            display_enabled: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            timing,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn lock_parser(&self) -> MutexGuard<'_, SentinelParser> {
        self.parser.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========== Parser control surface ==========

    pub fn ready(&self) -> bool {
        self.lock_parser().ready()
    }

    pub fn cwd(&self) -> String {
        self.lock_parser().cwd().to_string()
    }

    pub fn skip_captures(&self) -> u32 {
        self.lock_parser().skip_captures()
    }

    pub fn mute_until_next_prompt(&self) {
        self.lock_parser().mute_until_next_prompt();
    }

    pub fn add_skip_captures(&self, n: u32) {
        self.lock_parser().add_skip_captures(n);
    }

    pub fn skip_next_capture(&self) {
        self.add_skip_captures(1);
    }

    pub fn set_display_enabled(&self, enabled: bool) {
        self.display_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn display_enabled(&self) -> bool {
        self.display_enabled.load(Ordering::SeqCst)
    }

    /// Queue a system message and arm the idle flush timer.
    pub fn queue_system_message(self: &Arc<Self>, text: impl Into<String>) {
        self.lock_parser().queue_system_message(text);

        let session = Arc::clone(self);
        let epoch = self.epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(session.timing.message_flush()).await;
            if session.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let block = session.lock_parser().flush_messages();
            if let Some(block) = block {
                let _ = session.event_tx.send(SessionEvent::Message(block));
            }
        });
    }

    /// Clear every field back to the boot state; cancels pending timers.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.lock_parser().reset();
        self.display_enabled.store(true, Ordering::SeqCst);
        debug!("Session parser reset");
    }

    /// Block until the first `CMD_END` arrives, bounded by `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.event_tx.subscribe();
        if self.ready() {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Ready) => return Ok(()),
                    Ok(SessionEvent::Exit) => return Err(anyhow!("shell exited before ready")),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.ready() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(anyhow!("session event channel closed"))
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow!("shell not ready within {:?}", timeout))?
    }

    // ========== Pump ==========

    /// Start the pump over a raw serial byte stream.
    pub fn start(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.pump(rx).await;
        });
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut coalescer = ByteCoalescer::new();
        let mut epoch = self.epoch.load(Ordering::SeqCst);
        let mut coalesce_deadline: Option<tokio::time::Instant> = None;
        let mut partial_deadline: Option<tokio::time::Instant> = None;

        loop {
            // A reset invalidates buffered pump state.
            let current_epoch = self.epoch.load(Ordering::SeqCst);
            if current_epoch != epoch {
                epoch = current_epoch;
                coalescer.reset();
                coalesce_deadline = None;
                partial_deadline = None;
            }

            let next = match (coalesce_deadline, partial_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let sleep_target = next
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(bytes) => {
                        for chunk in coalescer.extend(&bytes) {
                            self.dispatch_chunk(&chunk);
                        }
                        let now = tokio::time::Instant::now();
                        // Idle windows re-arm on every arrival.
                        coalesce_deadline = coalescer
                            .has_pending()
                            .then(|| now + self.timing.coalesce_idle());
                        partial_deadline = self
                            .has_partial()
                            .then(|| now + self.timing.partial_flush());
                    }
                    None => {
                        // Drain what's left before announcing the exit.
                        if let Some(chunk) = coalescer.take() {
                            self.dispatch_chunk(&chunk);
                        }
                        let flush = self.lock_parser().flush_partial();
                        self.emit(flush);
                        let _ = self.event_tx.send(SessionEvent::Exit);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(sleep_target), if next.is_some() => {
                    let now = tokio::time::Instant::now();
                    if coalesce_deadline.is_some_and(|d| d <= now) {
                        coalesce_deadline = None;
                        if let Some(chunk) = coalescer.take() {
                            self.dispatch_chunk(&chunk);
                        }
                        // The flushed chunk can itself buffer a partial.
                        if self.has_partial() && partial_deadline.is_none() {
                            partial_deadline = Some(now + self.timing.partial_flush());
                        }
                    }
                    if partial_deadline.is_some_and(|d| d <= now) {
                        partial_deadline = None;
                        let flush = self.lock_parser().flush_partial();
                        self.emit(flush);
                    }
                }
            }
        }
        debug!("Session pump exited");
    }

    fn has_partial(&self) -> bool {
        self.lock_parser().has_partial()
    }

    fn dispatch_chunk(&self, chunk: &[u8]) {
        let flush = self.lock_parser().process_output(chunk);
        self.emit(flush);
    }

    fn emit(&self, flush: ParserFlush) {
        if let Some(block) = flush.messages {
            let _ = self.event_tx.send(SessionEvent::Message(block));
        }
        if self.display_enabled.load(Ordering::SeqCst) {
            for segment in flush.display {
                let _ = self.event_tx.send(SessionEvent::Display(segment));
            }
        }
        if flush.became_ready {
            let _ = self.event_tx.send(SessionEvent::Ready);
        }
        for command in flush.commands {
            let _ = self.event_tx.send(SessionEvent::Command(command));
        }
    }
}
