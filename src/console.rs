//! The human-readable console log scenarios write to (`printToConsole`).
//!
//! Every line is echoed to stdout (unless echo is disabled) and kept in a bounded
//! buffer so tests and reports can inspect what a run printed.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

const MAX_CONSOLE_LINES: usize = 10_000;

/// A single console line.
#[derive(Debug, Clone)]
pub struct ConsoleLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

/// A thread-safe, fixed-capacity console buffer.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    lines: Arc<Mutex<VecDeque<ConsoleLine>>>,
    echo: bool,
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLog {
    /// Console that echoes to stdout.
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(256))),
            echo: true,
        }
    }

    /// Console that only captures; used by tests.
    pub fn quiet() -> Self {
        Self {
            echo: false,
            ..Self::new()
        }
    }

    /// Print one line (may contain embedded newlines; stored as-is).
    pub fn print(&self, text: impl Into<String>) {
        let text = text.into();
        if self.echo {
            println!("{}", text);
        }

        let mut lines = self.lock();
        if lines.len() >= MAX_CONSOLE_LINES {
            lines.pop_front();
        }
        lines.push_back(ConsoleLine {
            timestamp: Local::now(),
            text,
        });
    }

    /// Snapshot of the captured text.
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(|line| line.text.clone()).collect()
    }

    /// True if any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|line| line.text.contains(needle))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ConsoleLine>> {
        // a panicking writer cannot leave a half-pushed line behind
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
