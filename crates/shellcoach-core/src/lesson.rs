//! Lesson and exercise data model
//!
//! Lessons live on disk as a JSON metadata index plus one YAML file per
//! lesson. The lesson body is an opaque string handed to whatever renders
//! it; only the exercise records matter to the session controller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::validate::ValidationKind;

/// A single exercise within a lesson.
///
/// The leading fields are immutable after loading; the trailing runtime
/// fields mutate as the student works through the session and are never
/// written back to the lesson file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub title: String,
    #[serde(default = "default_xp")]
    pub xp: u32,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default)]
    pub sandbox_setup: Option<Vec<String>>,
    #[serde(default)]
    pub validation_type: ValidationKind,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub hints: Vec<String>,

    // Runtime state
    #[serde(skip)]
    pub attempts: u32,
    #[serde(skip, default = "default_true")]
    pub first_try: bool,
    #[serde(skip)]
    pub hints_used: u32,
    #[serde(skip)]
    pub completed: bool,
}

fn default_xp() -> u32 {
    10
}

fn default_difficulty() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Exercise {
    /// Reset the runtime fields to their start-of-exercise values.
    pub fn reset_runtime(&mut self) {
        self.attempts = 0;
        self.first_try = true;
        self.hints_used = 0;
        self.completed = false;
    }
}

/// A full lesson with content and exercises
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonData {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub order: u32,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub exercises: Vec<Exercise>,
}

fn default_category() -> String {
    "basics".to_string()
}

impl LessonData {
    pub fn total_xp(&self) -> u32 {
        self.exercises.iter().map(|ex| ex.xp).sum()
    }

    pub fn exercise_count(&self) -> usize {
        self.exercises.len()
    }
}

/// Metadata entry for a lesson in the index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonMeta {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub order: u32,
    pub category: String,
    pub difficulty: u32,
    pub description: String,
    pub xp: u32,
    pub exercise_count: usize,
    pub file: String,
}

#[derive(Debug, Deserialize)]
struct MetadataIndex {
    lessons: Vec<LessonMeta>,
}

/// Loads lesson files from a directory
pub struct LessonLoader {
    lessons_dir: PathBuf,
}

impl LessonLoader {
    pub fn new(lessons_dir: impl Into<PathBuf>) -> Self {
        Self {
            lessons_dir: lessons_dir.into(),
        }
    }

    /// Load the metadata index, sorted by lesson order.
    ///
    /// A missing index is an empty catalog, not an error.
    pub fn load_metadata(&self) -> Result<Vec<LessonMeta>> {
        let meta_path = self.lessons_dir.join("metadata.json");
        if !meta_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&meta_path)
            .with_context(|| format!("reading {}", meta_path.display()))?;
        let index: MetadataIndex =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", meta_path.display()))?;
        let mut lessons = index.lessons;
        lessons.sort_by_key(|m| m.order);
        Ok(lessons)
    }

    /// Load a full lesson from its YAML file.
    pub fn load_lesson(&self, meta: &LessonMeta) -> Result<LessonData> {
        let path = self.lessons_dir.join(&meta.file);
        Self::load_file(&path)
    }

    /// Load a lesson directly from a path.
    pub fn load_file(path: &Path) -> Result<LessonData> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading lesson file {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing lesson file {}", path.display()))
    }

    /// Load every lesson the index names; files that fail to load are skipped.
    pub fn load_all(&self) -> Result<Vec<LessonData>> {
        let metadata = self.load_metadata()?;
        let mut lessons = Vec::new();
        for meta in &metadata {
            match self.load_lesson(meta) {
                Ok(lesson) => lessons.push(lesson),
                Err(e) => {
                    tracing::warn!(lesson_id = %meta.id, error = %e, "Skipping unloadable lesson");
                }
            }
        }
        Ok(lessons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LESSON_YAML: &str = r#"
id: "01_navigation"
title: "Finding Your Way"
slug: "navigation"
order: 1
description: "pwd, ls, cd"
content: |
  Use `pwd` to print the working directory.
exercises:
  - id: "nav_pwd"
    title: "Print the working directory"
    xp: 20
    validation_type: output_contains
    expected: "/home/student"
    hints:
      - "The command is three letters."
  - id: "nav_mkdir"
    title: "Make a briefs directory"
    difficulty: 2
    sandbox_setup:
      - "rm -rf briefs"
    validation_type: file_exists
    expected: "briefs/oporder.txt"
"#;

    #[test]
    fn test_lesson_yaml_roundtrip() {
        let lesson: LessonData = serde_yaml::from_str(LESSON_YAML).unwrap();
        assert_eq!(lesson.id, "01_navigation");
        assert_eq!(lesson.exercise_count(), 2);
        assert_eq!(lesson.total_xp(), 30);

        let ex = &lesson.exercises[0];
        assert_eq!(ex.xp, 20);
        assert_eq!(ex.difficulty, 1);
        assert_eq!(ex.validation_type, ValidationKind::OutputContains);
        assert!(!ex.completed);
        assert_eq!(ex.attempts, 0);

        let ex2 = &lesson.exercises[1];
        assert_eq!(ex2.validation_type, ValidationKind::FileExists);
        assert_eq!(ex2.sandbox_setup.as_deref(), Some(&["rm -rf briefs".to_string()][..]));
    }

    #[test]
    fn test_exercise_reset_runtime() {
        let mut ex: Exercise = serde_yaml::from_str(
            "id: x\ntitle: X\nvalidation_type: exit_code\nexpected: \"0\"\n",
        )
        .unwrap();
        ex.attempts = 3;
        ex.first_try = false;
        ex.hints_used = 2;
        ex.completed = true;
        ex.reset_runtime();
        assert_eq!(ex.attempts, 0);
        assert!(ex.first_try);
        assert_eq!(ex.hints_used, 0);
        assert!(!ex.completed);
    }

    #[test]
    fn test_loader_sorts_by_order() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            r#"{"lessons": [
                {"id": "b", "title": "B", "slug": "b", "order": 2, "category": "basics",
                 "difficulty": 1, "description": "", "xp": 10, "exercise_count": 0, "file": "b.yaml"},
                {"id": "a", "title": "A", "slug": "a", "order": 1, "category": "basics",
                 "difficulty": 1, "description": "", "xp": 10, "exercise_count": 0, "file": "a.yaml"}
            ]}"#,
        )
        .unwrap();

        let loader = LessonLoader::new(dir.path());
        let metas = loader.load_metadata().unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].id, "a");
        assert_eq!(metas[1].id, "b");
    }

    #[test]
    fn test_loader_missing_index_is_empty() {
        let dir = tempdir().unwrap();
        let loader = LessonLoader::new(dir.path());
        assert!(loader.load_metadata().unwrap().is_empty());
    }

    #[test]
    fn test_load_all_skips_missing_files() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            r#"{"lessons": [
                {"id": "a", "title": "A", "slug": "a", "order": 1, "category": "basics",
                 "difficulty": 1, "description": "", "xp": 10, "exercise_count": 0, "file": "gone.yaml"}
            ]}"#,
        )
        .unwrap();

        let loader = LessonLoader::new(dir.path());
        assert!(loader.load_all().unwrap().is_empty());
    }
}
