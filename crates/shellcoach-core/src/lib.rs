//! shellcoach-core — shell session controller for an interactive CLI tutor
//!
//! Sits between the raw serial byte stream of a sandboxed shell and the
//! rest of the application: extracts command executions via in-band
//! sentinels, validates them against exercise contracts, awards XP, and
//! advances the student through a lesson.
//!
//! # Architecture
//!
//! ```text
//! PtyShell ─ bytes ─▶ ByteCoalescer ─▶ SentinelParser ─▶ ShellSession events
//!                                                           │
//!                        display / messages ◀── gate ───────┤
//!                                                           ▼
//!                                  LessonDriver ─▶ Validator ─▶ XP / progress
//! ```

pub mod config;
pub mod lesson;
pub mod progress;
pub mod sentinel;
pub mod session;
pub mod validate;
pub mod xp;

pub use config::{SessionConfig, TimingConfig, SANDBOX_ROOT};
pub use lesson::{Exercise, LessonData, LessonLoader, LessonMeta};
pub use progress::{ExerciseProgress, LessonProgress, ProgressStore};
pub use sentinel::{ByteCoalescer, CommandResult, SentinelParser};
pub use session::{DriverEvent, LessonDriver, PtyShell, SessionChannel, SessionEvent, ShellSession};
pub use validate::{SandboxProbe, ValidationKind, Validator, Verdict};
pub use xp::{calculate_xp, level_info, LevelInfo, LEVEL_TABLE};
