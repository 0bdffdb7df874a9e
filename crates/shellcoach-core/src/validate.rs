//! Exercise validation
//!
//! Nine predicate kinds over a captured command result plus sandbox
//! filesystem state. Every kind returns a verdict; a bad pattern, a
//! malformed spec, or a failed probe is a failed verdict with a message,
//! never an error out of this module.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lesson::Exercise;
use crate::sentinel::CommandResult;

/// The validation contract an exercise declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    OutputEquals,
    #[default]
    OutputContains,
    OutputRegex,
    ExitCode,
    CwdRegex,
    FileExists,
    FileContains,
    DirWithFile,
    AnyFileContains,
}

impl ValidationKind {
    /// The four kinds judged purely on the captured output. Bare-Enter
    /// suppression applies only to these.
    pub fn is_output_kind(self) -> bool {
        matches!(
            self,
            ValidationKind::OutputEquals
                | ValidationKind::OutputContains
                | ValidationKind::OutputRegex
                | ValidationKind::ExitCode
        )
    }

    /// Kinds that run shell probe commands and therefore produce two
    /// extra sentinel pairs the caller must pre-skip.
    pub fn launches_probe(self) -> bool {
        matches!(
            self,
            ValidationKind::DirWithFile | ValidationKind::AnyFileContains
        )
    }
}

/// Pass/fail plus the message shown to the student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub message: String,
}

impl Verdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Filesystem view of the sandbox used by the file-backed kinds.
///
/// `file_exists` / `read_file` go through the out-of-band channel; the two
/// probe queries run shell commands and are async.
pub trait SandboxProbe: Send + Sync {
    fn file_exists(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> Result<String>;
    fn has_dir_with_file(&self, root: &str) -> impl Future<Output = Result<bool>> + Send;
    fn find_file_containing(&self, root: &str, needle: &str)
        -> impl Future<Output = Result<bool>> + Send;
}

/// Evaluates exercises against command results and sandbox state.
pub struct Validator {
    sandbox_root: String,
}

impl Validator {
    pub fn new(sandbox_root: impl Into<String>) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
        }
    }

    pub async fn validate<S: SandboxProbe>(
        &self,
        probe: &S,
        exercise: &Exercise,
        result: &CommandResult,
    ) -> Verdict {
        let expected = exercise.expected.as_str();
        match exercise.validation_type {
            ValidationKind::OutputEquals => check_output_equals(result, expected),
            ValidationKind::OutputContains => check_output_contains(result, expected),
            ValidationKind::OutputRegex => check_output_regex(result, expected),
            ValidationKind::ExitCode => check_exit_code(result, expected),
            ValidationKind::CwdRegex => check_cwd_regex(result, expected),
            ValidationKind::FileExists => {
                self.check_file_exists(probe, expected, &result.cwd)
            }
            ValidationKind::FileContains => {
                self.check_file_contains(probe, expected, &result.cwd)
            }
            ValidationKind::DirWithFile => match probe.has_dir_with_file(&self.sandbox_root).await {
                Ok(true) => Verdict::pass("Correct! Directory with file created."),
                Ok(false) => Verdict::fail(
                    "No directory containing a file was found. \
                     Create a directory and then create a file inside it.",
                ),
                Err(e) => Verdict::fail(format!("Could not inspect the sandbox: {e}")),
            },
            ValidationKind::AnyFileContains => {
                let needle = expected.trim();
                match probe.find_file_containing(&self.sandbox_root, needle).await {
                    Ok(true) => Verdict::pass("Correct! File contains expected content."),
                    Ok(false) => Verdict::fail(format!("No file found containing '{needle}'.")),
                    Err(e) => Verdict::fail(format!("Could not inspect the sandbox: {e}")),
                }
            }
        }
    }

    /// Resolve a lesson-relative path against the sandbox root, falling
    /// back to the command's working directory.
    fn resolve<S: SandboxProbe>(&self, probe: &S, filepath: &str, cwd: &str) -> Option<PathBuf> {
        let at_root = Path::new(&self.sandbox_root).join(filepath);
        if probe.file_exists(&at_root) {
            return Some(at_root);
        }
        let at_cwd = Path::new(cwd).join(filepath);
        if probe.file_exists(&at_cwd) {
            return Some(at_cwd);
        }
        None
    }

    fn check_file_exists<S: SandboxProbe>(&self, probe: &S, expected: &str, cwd: &str) -> Verdict {
        let expected = expected.trim();
        if self.resolve(probe, expected, cwd).is_some() {
            Verdict::pass("Correct! File created.")
        } else {
            Verdict::fail(format!("File '{expected}' not found."))
        }
    }

    fn check_file_contains<S: SandboxProbe>(&self, probe: &S, expected: &str, cwd: &str) -> Verdict {
        let Some((filename, content)) = expected.split_once("::") else {
            return Verdict::fail("Invalid file_contains spec.");
        };
        let filename = filename.trim();
        let needle = content.trim();

        let Some(path) = self.resolve(probe, filename, cwd) else {
            return Verdict::fail(format!("File '{filename}' not found."));
        };
        match probe.read_file(&path) {
            Ok(text) if text.contains(needle) => {
                Verdict::pass("Correct! File contains expected content.")
            }
            Ok(_) => Verdict::fail("File doesn't contain expected content."),
            Err(e) => Verdict::fail(format!("Could not read '{filename}': {e}")),
        }
    }
}

fn check_output_equals(result: &CommandResult, expected: &str) -> Verdict {
    if result.stdout.trim() == expected.trim() {
        Verdict::pass("Correct!")
    } else {
        Verdict::fail("Output doesn't match expected result.")
    }
}

fn check_output_contains(result: &CommandResult, expected: &str) -> Verdict {
    if result.stdout.contains(expected.trim()) {
        Verdict::pass("Correct!")
    } else {
        Verdict::fail("Output doesn't contain expected text.")
    }
}

fn check_output_regex(result: &CommandResult, expected: &str) -> Verdict {
    match Regex::new(expected) {
        Ok(re) if re.is_match(&result.stdout) => Verdict::pass("Correct!"),
        Ok(_) => Verdict::fail("Output doesn't match expected pattern."),
        Err(e) => Verdict::fail(format!("Invalid expected pattern: {e}")),
    }
}

fn check_exit_code(result: &CommandResult, expected: &str) -> Verdict {
    let Ok(expected_code) = expected.trim().parse::<i32>() else {
        return Verdict::fail("Invalid expected exit code.");
    };
    if result.exit_code == expected_code {
        Verdict::pass("Correct!")
    } else {
        Verdict::fail(format!(
            "Expected exit code {expected_code}, got {}.",
            result.exit_code
        ))
    }
}

fn check_cwd_regex(result: &CommandResult, expected: &str) -> Verdict {
    match Regex::new(expected) {
        Ok(re) if re.is_match(&result.cwd) => Verdict::pass("Correct!"),
        Ok(_) => Verdict::fail("You're not in the expected directory."),
        Err(e) => Verdict::fail(format!("Invalid expected pattern: {e}")),
    }
}
