//! Engine observability.
//!
//! The observer appends structured engine events to `.tether/observe.log` and
//! mirrors diagnostics to stderr when verbose mode is on. Rendering for the
//! user goes through the render sink, never through here.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tether_core::runtime_dir;

/// Structured engine events recorded per turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    TurnStarted {
        preview: String,
    },
    ContextBuilt {
        selected: usize,
        dropped: usize,
        estimated_tokens: u64,
        summarized: bool,
        budget_exceeded: bool,
    },
    SessionCompleted {
        finish_reason: String,
        tool_calls: usize,
    },
    SessionCancelled,
    SessionErrored {
        message: String,
    },
    ToolDispatched {
        name: String,
        success: bool,
        duration_ms: u64,
    },
    TurnFinished {
        finish: String,
        iterations: u64,
    },
}

pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn record(&self, event: &EngineEvent) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))
    }

    /// Log to stderr with a `[tether]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[tether] {msg}");
        }
    }

    /// Log a warning: always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[tether WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
