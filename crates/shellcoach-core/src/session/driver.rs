//! Lesson driver
//!
//! Owns the lesson state and ties the pieces together: command events in
//! from the session, validation verdicts and XP out, seeding, slash
//! commands, and the system messages the student sees.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::lesson::{Exercise, LessonData};
use crate::progress::ProgressStore;
use crate::sentinel::CommandResult;
use crate::session::channel::{shell_quote, SessionChannel};
use crate::session::session::{SessionEvent, ShellSession};
use crate::validate::Validator;
use crate::xp::{calculate_xp, level_info};

/// Slash-command words intercepted before the shell sees them.
const SLASH_COMMANDS: [&str; 10] = [
    "help", "lessons", "lesson", "hint", "skip", "reset", "status", "sidebar", "close", "back",
];

/// Outward-facing notifications for whatever hosts the driver.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    ExercisePassed { exercise_id: String, xp: u32 },
    ExerciseFailed { exercise_id: String },
    ExerciseSkipped { exercise_id: String },
    LessonComplete { lesson_id: String },
    LevelUp { level: usize, title: &'static str },
    OpenLessonPicker,
    OpenLesson(u32),
    ToggleSidebar,
    CloseRequested,
}

#[derive(Default)]
struct LessonState {
    lesson: Option<LessonData>,
    current: usize,
    validating: bool,
}

/// Orchestrates one student session over a sandbox shell.
pub struct LessonDriver<C: SessionChannel> {
    session: Arc<ShellSession>,
    channel: Arc<C>,
    config: SessionConfig,
    validator: Validator,
    progress: Mutex<ProgressStore>,
    state: RwLock<LessonState>,
    input_line: StdMutex<String>,
    event_tx: broadcast::Sender<DriverEvent>,
}

impl<C: SessionChannel> LessonDriver<C> {
    pub fn new(session: Arc<ShellSession>, channel: Arc<C>, config: SessionConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let validator = Validator::new(config.sandbox_root_str());
        let progress = Mutex::new(ProgressStore::open(config.progress_path.clone()));
        Arc::new(Self {
            session,
            channel,
            config,
            validator,
            progress,
            state: RwLock::new(LessonState::default()),
            input_line: StdMutex::new(String::new()),
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    /// Wire command events from the session into the guard chain.
    pub fn run(self: &Arc<Self>) {
        let driver = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = driver.session.subscribe();
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Command(result)) => driver.handle_command(result).await,
                    Ok(SessionEvent::Exit) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Driver lagged behind session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Driver event loop exited");
        });
    }

    /// Await the shell prompt; exceeding the boot bound is fatal.
    pub async fn wait_shell_ready(&self) -> Result<()> {
        self.session
            .wait_ready(self.config.timing.boot_timeout())
            .await
    }

    // ========== Lesson lifecycle ==========

    /// Open a lesson: reset the parser, restore persisted completion,
    /// seed the sandbox, announce the current exercise.
    pub async fn enter_lesson(&self, mut lesson: LessonData, clean: bool) -> Result<()> {
        info!(lesson_id = %lesson.id, exercises = lesson.exercises.len(), "Entering lesson");
        self.session.reset();
        self.input_line.lock().unwrap_or_else(|e| e.into_inner()).clear();

        for ex in &mut lesson.exercises {
            ex.reset_runtime();
        }
        {
            let progress = self.progress.lock().await;
            for ex in &mut lesson.exercises {
                if progress.is_exercise_completed(&lesson.id, &ex.id) {
                    ex.completed = true;
                }
            }
        }
        let current = lesson
            .exercises
            .iter()
            .position(|ex| !ex.completed)
            .unwrap_or(lesson.exercises.len());

        {
            let mut st = self.state.write().await;
            st.lesson = Some(lesson);
            st.current = current;
            st.validating = false;
        }

        self.seed(clean).await?;
        self.announce_current().await;
        Ok(())
    }

    /// Leave the lesson: drop state and put the parser back to boot.
    pub async fn leave_lesson(&self) {
        let mut st = self.state.write().await;
        st.lesson = None;
        st.current = 0;
        st.validating = false;
        drop(st);
        self.session.reset();
    }

    /// Run every exercise's sandbox_setup silently, optionally after
    /// wiping the sandbox. The single serial invocation redirects to
    /// /dev/null and removes the script behind itself.
    async fn seed(&self, clean: bool) -> Result<()> {
        let root = self.config.sandbox_root_str();
        let (lines, uses_git) = {
            let st = self.state.read().await;
            let Some(lesson) = st.lesson.as_ref() else {
                return Ok(());
            };
            let mut lines: Vec<String> = Vec::new();
            if clean {
                lines.push(format!("cd {} && rm -rf ./* 2>/dev/null", shell_quote(&root)));
            }
            let mut uses_git = false;
            for ex in &lesson.exercises {
                if let Some(setup) = &ex.sandbox_setup {
                    for cmd in setup {
                        if cmd.contains("git") {
                            uses_git = true;
                        }
                        lines.push(format!("cd {} && {cmd}", shell_quote(&root)));
                    }
                }
            }
            (lines, uses_git)
        };

        if lines.is_empty() {
            // Nothing to run; just surface a fresh prompt. After a parser
            // reset the boot skip swallows this pair.
            if !self.session.ready() {
                self.channel.send_serial("\n")?;
            }
            return Ok(());
        }

        let script = lines.join("\n") + "\n";
        let path = seed_script_path();
        self.channel.write_file(&path, script.as_bytes())?;
        debug!(path = %path.display(), lines = lines.len(), clean = clean, "Seeding sandbox");

        // After a reset the parser's boot skip covers the seed pair; once
        // ready, the seed pair needs its own skip.
        if self.session.ready() {
            self.session.skip_next_capture();
        }
        self.session.set_display_enabled(false);
        let quoted = shell_quote(&path.to_string_lossy());
        self.channel
            .send_serial(&format!("bash {quoted} > /dev/null 2>&1; rm -f {quoted}\n"))?;
        tokio::time::sleep(self.config.timing.seed_drain(uses_git)).await;
        self.session.set_display_enabled(true);
        self.kick_prompt()?;
        Ok(())
    }

    // ========== Command validation ==========

    async fn handle_command(&self, result: CommandResult) {
        // Guard chain; each step short-circuits in this order.
        let exercise = {
            let mut st = self.state.write().await;
            let state = &mut *st;
            if state.validating {
                return;
            }
            let Some(lesson) = state.lesson.as_mut() else {
                return;
            };
            if state.current >= lesson.exercises.len() {
                return;
            }
            let ex = &mut lesson.exercises[state.current];
            if ex.completed {
                return;
            }
            // Bare Enter never counts as an attempt at an output exercise;
            // filesystem kinds still validate.
            if ex.validation_type.is_output_kind()
                && result.stdout.trim().is_empty()
                && result.exit_code == 0
            {
                return;
            }
            ex.attempts += 1;
            state.validating = true;
            ex.clone()
        };

        debug!(
            exercise_id = %exercise.id,
            kind = ?exercise.validation_type,
            attempt = exercise.attempts,
            "Validating command"
        );

        self.session.set_display_enabled(false);
        if exercise.validation_type.launches_probe() {
            // The probe issues two serial commands, each with a sentinel
            // pair that must not re-enter this handler.
            self.session.add_skip_captures(2);
        }
        let verdict = self
            .validator
            .validate(self.channel.as_ref(), &exercise, &result)
            .await;
        // Let trailing serial data drain under the muted display.
        tokio::time::sleep(self.config.timing.validation_drain()).await;
        self.session.set_display_enabled(true);

        let mut st = self.state.write().await;
        let state = &mut *st;
        state.validating = false;
        // The lesson may have been left while we validated.
        let Some(lesson) = state.lesson.as_mut() else {
            return;
        };
        let idx = state.current;
        let total = lesson.exercises.len();
        if idx >= total {
            return;
        }
        let lesson_id = lesson.id.clone();

        // In-flight bytes from the validated command must not interleave
        // with the queued messages below.
        self.session.mute_until_next_prompt();

        if verdict.passed {
            let ex = &mut lesson.exercises[idx];
            ex.completed = true;
            let xp = calculate_xp(ex.xp, ex.difficulty, ex.first_try, ex.hints_used);
            let ex_id = ex.id.clone();
            let (attempts, hints_used) = (ex.attempts, ex.hints_used);

            let (old_total, new_total) = {
                let mut progress = self.progress.lock().await;
                let old = progress.total_xp();
                progress.record_exercise(&lesson_id, &ex_id, xp, attempts, hints_used);
                (old, progress.total_xp())
            };

            info!(exercise_id = %ex_id, xp = xp, attempts = attempts, "Exercise passed");
            self.session
                .queue_system_message(format!("✓ {} (+{xp} XP)", verdict.message));

            let new_level = level_info(new_total);
            if new_level.level > level_info(old_total).level {
                self.session.queue_system_message(format!(
                    "★ LEVEL UP! You are now Lv.{} {}! ★",
                    new_level.level, new_level.title
                ));
                let _ = self.event_tx.send(DriverEvent::LevelUp {
                    level: new_level.level,
                    title: new_level.title,
                });
            }
            let _ = self.event_tx.send(DriverEvent::ExercisePassed {
                exercise_id: ex_id,
                xp,
            });

            state.current += 1;
            if state.current < total {
                let next = &lesson.exercises[state.current];
                self.session.queue_system_message(format!(
                    "--- Exercise {}/{}: {} ---",
                    state.current + 1,
                    total,
                    next.title
                ));
            } else {
                self.session
                    .queue_system_message("★ Lesson complete! /back to return to the lessons. ★");
                let _ = self
                    .event_tx
                    .send(DriverEvent::LessonComplete { lesson_id });
            }
        } else {
            let ex = &mut lesson.exercises[idx];
            ex.first_try = false;
            debug!(exercise_id = %ex.id, "Exercise attempt failed");
            self.session
                .queue_system_message(format!("✗ {} Try again!", verdict.message));
            let _ = self.event_tx.send(DriverEvent::ExerciseFailed {
                exercise_id: ex.id.clone(),
            });
        }
        drop(st);

        if let Err(e) = self.kick_prompt() {
            warn!(error = %e, "Prompt kick failed");
        }
    }

    /// Force bash to draw a fresh prompt; the resulting sentinel pair is
    /// pre-skipped so it never reaches the guard chain.
    fn kick_prompt(&self) -> Result<()> {
        self.session.skip_next_capture();
        self.channel.send_serial("\n")
    }

    // ========== Keyboard input ==========

    /// Forward keystrokes to the shell, intercepting recognized slash
    /// commands at Enter.
    pub async fn handle_input(&self, data: &str) -> Result<()> {
        let mut passthrough = String::new();
        for ch in data.chars() {
            match ch {
                '\r' | '\n' => {
                    let line = {
                        let mut buf = self.input_line.lock().unwrap_or_else(|e| e.into_inner());
                        std::mem::take(&mut *buf)
                    };
                    let trimmed = line.trim().to_string();
                    if recognized_slash(&trimmed).is_some() {
                        if !passthrough.is_empty() {
                            self.channel.send_serial(&passthrough)?;
                            passthrough.clear();
                        }
                        // Ctrl-U wipes the typed line, CR kicks a fresh
                        // prompt; the empty pair is pre-skipped.
                        self.session.skip_next_capture();
                        self.channel.send_serial("\x15\r")?;
                        self.dispatch_slash(&trimmed).await?;
                    } else {
                        passthrough.push(ch);
                    }
                }
                '\x7f' => {
                    self.input_line
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .pop();
                    passthrough.push(ch);
                }
                // Ctrl-C / Ctrl-U / Ctrl-W all abandon the typed line.
                '\x03' | '\x15' | '\x17' => {
                    self.input_line
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clear();
                    passthrough.push(ch);
                }
                c => {
                    if !c.is_control() {
                        self.input_line
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(c);
                    }
                    passthrough.push(c);
                }
            }
        }
        if !passthrough.is_empty() {
            self.channel.send_serial(&passthrough)?;
        }
        Ok(())
    }

    async fn dispatch_slash(&self, line: &str) -> Result<()> {
        let Some((word, args)) = recognized_slash(line) else {
            return Ok(());
        };
        debug!(command = %word, "Slash command");
        match word.as_str() {
            "help" => self.show_help(),
            "hint" => self.show_hint().await,
            "skip" => self.skip_exercise().await,
            "reset" => {
                self.seed(true).await?;
                self.session.queue_system_message("Sandbox reset.");
            }
            "status" => self.show_status().await,
            "lessons" | "back" => {
                let _ = self.event_tx.send(DriverEvent::OpenLessonPicker);
            }
            "lesson" => match args.parse::<u32>() {
                Ok(n) => {
                    let _ = self.event_tx.send(DriverEvent::OpenLesson(n));
                }
                Err(_) => self.session.queue_system_message("Usage: /lesson <number>"),
            },
            "sidebar" => {
                let _ = self.event_tx.send(DriverEvent::ToggleSidebar);
            }
            "close" => {
                let _ = self.event_tx.send(DriverEvent::CloseRequested);
            }
            _ => {}
        }
        Ok(())
    }

    fn show_help(&self) {
        self.session.queue_system_message(
            "Commands: /help /hint /skip /reset /status /lessons /lesson <N> /sidebar /close /back",
        );
    }

    /// Reveal the next hint, capped at the hint count.
    async fn show_hint(&self) {
        let mut st = self.state.write().await;
        let state = &mut *st;
        let Some(lesson) = state.lesson.as_mut() else {
            self.session.queue_system_message("No active exercise.");
            return;
        };
        if state.current >= lesson.exercises.len() {
            self.session.queue_system_message("No active exercise.");
            return;
        }
        let ex = &mut lesson.exercises[state.current];
        if ex.hints.is_empty() {
            self.session
                .queue_system_message("No hints available for this exercise.");
            return;
        }
        let idx = (ex.hints_used as usize).min(ex.hints.len() - 1);
        let msg = format!("Hint {}/{}: {}", idx + 1, ex.hints.len(), ex.hints[idx]);
        if (ex.hints_used as usize) < ex.hints.len() {
            ex.hints_used += 1;
        }
        self.session.queue_system_message(msg);
    }

    /// Advance without validation; no XP.
    async fn skip_exercise(&self) {
        {
            let mut st = self.state.write().await;
            let state = &mut *st;
            let Some(lesson) = state.lesson.as_ref() else {
                return;
            };
            if state.current >= lesson.exercises.len() {
                return;
            }
            let ex = &lesson.exercises[state.current];
            info!(exercise_id = %ex.id, "Exercise skipped");
            self.session
                .queue_system_message(format!("Skipped: {} (0 XP)", ex.title));
            let _ = self.event_tx.send(DriverEvent::ExerciseSkipped {
                exercise_id: ex.id.clone(),
            });
            state.current += 1;
        }
        self.announce_current().await;
    }

    async fn show_status(&self) {
        let (done, total) = {
            let st = self.state.read().await;
            match st.lesson.as_ref() {
                Some(lesson) => (
                    lesson.exercises.iter().filter(|ex| ex.completed).count(),
                    lesson.exercises.len(),
                ),
                None => (0, 0),
            }
        };
        let total_xp = self.progress.lock().await.total_xp();
        let level = level_info(total_xp);
        self.session.queue_system_message(format!(
            "Lesson progress: {done}/{total} exercises | Total XP: {total_xp} | Lv.{} {}",
            level.level, level.title
        ));
    }

    async fn announce_current(&self) {
        let st = self.state.read().await;
        let Some(lesson) = st.lesson.as_ref() else {
            return;
        };
        let total = lesson.exercises.len();
        if st.current < total {
            let ex = &lesson.exercises[st.current];
            self.session.queue_system_message(format!(
                "--- Exercise {}/{}: {} ---",
                st.current + 1,
                total,
                ex.title
            ));
        } else {
            self.session
                .queue_system_message("All exercises completed! /back to return.");
        }
    }

    // ========== Accessors for the host UI ==========

    pub async fn current_exercise(&self) -> Option<Exercise> {
        let st = self.state.read().await;
        let lesson = st.lesson.as_ref()?;
        lesson.exercises.get(st.current).cloned()
    }

    /// `(current_index, exercise_count)` of the open lesson.
    pub async fn exercise_position(&self) -> Option<(usize, usize)> {
        let st = self.state.read().await;
        let lesson = st.lesson.as_ref()?;
        Some((st.current, lesson.exercises.len()))
    }

    pub async fn total_xp(&self) -> u32 {
        self.progress.lock().await.total_xp()
    }
}

fn seed_script_path() -> PathBuf {
    std::env::temp_dir().join(format!(".shellcoach-seed-{}.sh", Uuid::new_v4()))
}

/// `("word", "args")` when the line is a recognized slash command.
fn recognized_slash(line: &str) -> Option<(String, &str)> {
    let rest = line.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let word = parts.next()?.to_ascii_lowercase();
    let args = parts.next().unwrap_or("").trim();
    if SLASH_COMMANDS.contains(&word.as_str()) {
        Some((word, args))
    } else {
        None
    }
}
