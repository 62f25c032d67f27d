//! Output formatting for CLI commands.
//!
//! Results go to stdout as text or JSON; notices and errors go to stderr.

use anyhow::Result;
use myz_core::{Entry, Error};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Check if JSON mode is enabled.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// `text_fn` is only called in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Report skipped paths on stderr (text mode only; JSON output carries
    /// them in its `notices` field).
    pub fn write_notices(&self, notices: &[Error]) {
        if self.is_json() {
            return;
        }
        let mut stderr = io::stderr();
        for notice in notices {
            let _ = writeln!(stderr, "warning: {}", notice);
        }
    }

    /// Write a warning that is not tied to an archive entry.
    pub fn write_warning(&self, message: &str) {
        let _ = writeln!(io::stderr(), "warning: {}", message);
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Render notices for JSON output.
pub fn notice_strings(notices: &[Error]) -> Vec<String> {
    notices.iter().map(|n| n.to_string()).collect()
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `-c`, `-a`, `-d` and `-x`.
#[derive(Debug, Serialize)]
pub struct OperationOutput {
    pub success: bool,
    pub result_code: u8,
    pub operation: &'static str,
    pub archive: String,
    pub entries: usize,
    pub notices: Vec<String>,
}

/// One answer of `-q`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub path: String,
    pub found: bool,
}

/// Output for `-q`.
#[derive(Debug, Serialize)]
pub struct QueryOutput {
    pub success: bool,
    pub result_code: u8,
    pub results: Vec<QueryResult>,
}

/// Output for `-p` and `-m`.
#[derive(Debug, Serialize)]
pub struct EntriesOutput {
    pub success: bool,
    pub result_code: u8,
    pub entries: Vec<Entry>,
    pub notices: Vec<String>,
}
