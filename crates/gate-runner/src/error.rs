use std::time::Duration;
use thiserror::Error;

/// Failure classes raised by the orchestration layer.
///
/// Functions in this crate return `anyhow::Result`; errors that belong to one
/// of these classes are wrapped as `GateError` so callers can recover the
/// class with `err.downcast_ref::<GateError>()`.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("process failed: {command} (exit {}){}", exit_label(.code), detail_suffix(.detail))]
    ProcessFailure {
        command: String,
        code: Option<i32>,
        detail: Option<String>,
    },

    #[error("process timed out after {}s: {command}", .timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    #[error("could not resolve {reference}: {detail}")]
    Resolution { reference: String, detail: String },

    #[error("task '{task}' failed: {message}")]
    TaskFailure { task: String, message: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
}

impl GateError {
    pub fn config(message: impl Into<String>) -> anyhow::Error {
        GateError::Configuration(message.into()).into()
    }

    pub fn resolution(reference: impl Into<String>, detail: impl Into<String>) -> anyhow::Error {
        GateError::Resolution {
            reference: reference.into(),
            detail: detail.into(),
        }
        .into()
    }

    /// A run that finished but did not produce the expected output.
    pub fn output_mismatch(command: impl Into<String>, code: Option<i32>, detail: impl Into<String>) -> anyhow::Error {
        GateError::ProcessFailure {
            command: command.into(),
            code,
            detail: Some(detail.into()),
        }
        .into()
    }

    /// Stable code used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Configuration(_) => "configuration_error",
            GateError::ProcessFailure { .. } => "process_failure",
            GateError::Timeout { .. } => "timeout",
            GateError::Resolution { .. } => "resolution_failure",
            GateError::TaskFailure { .. } => "task_failure",
        }
    }
}

/// Returns the `GateError` carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&GateError> {
    err.downcast_ref::<GateError>()
}
