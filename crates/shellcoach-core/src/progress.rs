//! Progress persistence
//!
//! The whole store is one JSON document keyed by lesson id. Writes are
//! best-effort: a failed save is logged and the in-memory state remains
//! authoritative for the rest of the session.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Progress for a single exercise
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExerciseProgress {
    pub completed: bool,
    pub xp_earned: u32,
    pub attempts: u32,
    pub hints_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<i64>,
}

/// Progress for a lesson
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LessonProgress {
    #[serde(default)]
    pub exercises: HashMap<String, ExerciseProgress>,
}

impl LessonProgress {
    pub fn completed(&self) -> bool {
        !self.exercises.is_empty() && self.exercises.values().all(|ep| ep.completed)
    }

    pub fn total_xp(&self) -> u32 {
        self.exercises.values().map(|ep| ep.xp_earned).sum()
    }

    pub fn completed_count(&self) -> usize {
        self.exercises.values().filter(|ep| ep.completed).count()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgressDocument {
    #[serde(default)]
    lessons: HashMap<String, LessonProgress>,
}

/// JSON-file-backed progress store
pub struct ProgressStore {
    path: PathBuf,
    doc: ProgressDocument,
}

impl ProgressStore {
    /// Open the store, loading prior progress if the file exists.
    ///
    /// A corrupt or unreadable file starts a fresh document rather than
    /// failing the session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Progress file corrupt, starting fresh");
                ProgressDocument::default()
            }),
            Err(_) => ProgressDocument::default(),
        };
        Self { path, doc }
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&self.path, raw + "\n")
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Persist to disk, logging on failure instead of propagating.
    fn save_best_effort(&self) {
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist progress");
        }
    }

    /// Get (or create) progress for a lesson.
    pub fn lesson_progress(&mut self, lesson_id: &str) -> &LessonProgress {
        self.doc
            .lessons
            .entry(lesson_id.to_string())
            .or_default()
    }

    /// Record an exercise as completed.
    pub fn record_exercise(
        &mut self,
        lesson_id: &str,
        exercise_id: &str,
        xp_earned: u32,
        attempts: u32,
        hints_used: u32,
    ) {
        let lesson = self.doc.lessons.entry(lesson_id.to_string()).or_default();
        lesson.exercises.insert(
            exercise_id.to_string(),
            ExerciseProgress {
                completed: true,
                xp_earned,
                attempts,
                hints_used,
                recorded_at: Some(chrono::Utc::now().timestamp_millis()),
            },
        );
        debug!(
            lesson_id = %lesson_id,
            exercise_id = %exercise_id,
            xp = xp_earned,
            "Exercise recorded"
        );
        self.save_best_effort();
    }

    pub fn is_exercise_completed(&self, lesson_id: &str, exercise_id: &str) -> bool {
        self.doc
            .lessons
            .get(lesson_id)
            .and_then(|lp| lp.exercises.get(exercise_id))
            .map(|ep| ep.completed)
            .unwrap_or(false)
    }

    /// Total XP earned across every lesson.
    pub fn total_xp(&self) -> u32 {
        self.doc.lessons.values().map(|lp| lp.total_xp()).sum()
    }

    /// `{lesson_id: completed_exercise_count}` for all lessons.
    pub fn exercise_counts(&self) -> HashMap<String, usize> {
        self.doc
            .lessons
            .iter()
            .map(|(id, lp)| (id.clone(), lp.completed_count()))
            .collect()
    }

    pub fn reset_lesson(&mut self, lesson_id: &str) {
        if self.doc.lessons.remove(lesson_id).is_some() {
            self.save_best_effort();
        }
    }

    pub fn reset_all(&mut self) {
        self.doc.lessons.clear();
        self.save_best_effort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");

        {
            let mut store = ProgressStore::open(&path);
            store.record_exercise("lesson-1", "ex-1", 30, 2, 1);
            store.record_exercise("lesson-1", "ex-2", 15, 1, 0);
            assert_eq!(store.total_xp(), 45);
        }

        let store = ProgressStore::open(&path);
        assert!(store.is_exercise_completed("lesson-1", "ex-1"));
        assert!(store.is_exercise_completed("lesson-1", "ex-2"));
        assert!(!store.is_exercise_completed("lesson-1", "ex-3"));
        assert_eq!(store.total_xp(), 45);
    }

    #[test]
    fn test_lesson_rollups() {
        let dir = tempdir().unwrap();
        let mut store = ProgressStore::open(dir.path().join("p.json"));

        store.record_exercise("l", "a", 10, 1, 0);
        let lp = store.lesson_progress("l");
        assert!(lp.completed());
        assert_eq!(lp.completed_count(), 1);

        // An untouched lesson is not "completed".
        assert!(!store.lesson_progress("other").completed());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ProgressStore::open(&path);
        assert_eq!(store.total_xp(), 0);
    }

    #[test]
    fn test_reset_lesson() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let mut store = ProgressStore::open(&path);
        store.record_exercise("l1", "a", 10, 1, 0);
        store.record_exercise("l2", "b", 10, 1, 0);

        store.reset_lesson("l1");
        assert!(!store.is_exercise_completed("l1", "a"));
        assert!(store.is_exercise_completed("l2", "b"));
        assert_eq!(store.total_xp(), 10);
    }

    #[test]
    fn test_unwritable_path_keeps_memory_state() {
        // Point at a path whose parent cannot be created.
        let mut store = ProgressStore::open("/dev/null/progress.json");
        store.record_exercise("l", "a", 10, 1, 0);
        assert!(store.is_exercise_completed("l", "a"));
    }
}
