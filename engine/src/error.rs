//! Captured step-execution errors.
//!
//! Orchestration-level failures use `anyhow` throughout the crate. A
//! [`StepError`] is different: it is *data*, attached to the step or branch
//! that failed and serialized into reports, so it is a plain struct with
//! explicit fields rather than an opaque error chain.

use std::fmt;

use serde::Serialize;

/// An error captured while executing a step, hook, or code block.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepError {
    pub message: String,
    /// Source file of the step or function declaration the error is
    /// attributed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    /// Fatal errors are never caught by the engine; they terminate the run.
    #[serde(skip_serializing_if = "is_false")]
    pub fatal: bool,
    /// A `continue`-flagged failure does not finish the branch early.
    #[serde(rename = "continue", skip_serializing_if = "is_false")]
    pub continues: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl StepError {
    pub fn new(message: impl Into<String>) -> StepError {
        StepError {
            message: message.into(),
            filename: None,
            line_number: None,
            fatal: false,
            continues: false,
            stack_trace: None,
        }
    }

    /// Mark fatal: re-thrown out of the engine instead of being captured.
    pub fn fatal(mut self) -> StepError {
        self.fatal = true;
        self
    }

    /// Mark continue: the owning branch keeps running past the failure.
    pub fn continues(mut self) -> StepError {
        self.continues = true;
        self
    }

    /// Attach the source location the error is attributed to, unless one is
    /// already present (the innermost location wins).
    pub fn locate(&mut self, filename: Option<&str>, line_number: Option<u32>) {
        if self.filename.is_none() {
            self.filename = filename.map(str::to_string);
            self.line_number = line_number;
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(filename) = &self.filename {
            write!(f, " [{}", filename)?;
            if let Some(line) = self.line_number {
                write!(f, ":{line}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    /// Wrap an arbitrary error raised by a code block. Errors that are
    /// already a `StepError` keep their flags and location.
    fn from(err: anyhow::Error) -> StepError {
        match err.downcast::<StepError>() {
            Ok(step_err) => step_err,
            Err(other) => StepError::new(format!("{other:#}")),
        }
    }
}
