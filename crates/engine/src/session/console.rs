// SDB - Stored Program Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-session console log.
//!
//! Every phase transition is written here. Lines are mirrored to `tracing`,
//! kept in a bounded history and forwarded to the UI sink.

use std::{collections::VecDeque, fmt, sync::Arc};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::{config::ConsoleConfig, sink::DebugEventSink};

/// Kind of console line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    /// Session lifecycle messages
    System,
    /// Program output and positions
    Info,
    /// Failures
    Error,
}

/// One console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    /// When the line was written
    pub timestamp: DateTime<Local>,
    /// Line kind
    pub level: ConsoleLevel,
    /// Text
    pub text: String,
}

impl ConsoleLine {
    /// Render the line, optionally prefixed with the local time
    pub fn render(&self, show_timestamp: bool) -> String {
        if show_timestamp {
            format!("[{}] {}", self.timestamp.format("%H:%M:%S%.3f"), self.text)
        } else {
            self.text.clone()
        }
    }
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Console of one debug session
pub struct DebugConsole {
    session: String,
    config: ConsoleConfig,
    history: Mutex<VecDeque<ConsoleLine>>,
    sink: Arc<dyn DebugEventSink>,
}

impl fmt::Debug for DebugConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugConsole")
            .field("session", &self.session)
            .field("lines", &self.history.lock().len())
            .finish()
    }
}

impl DebugConsole {
    /// Create a console for the session named `session`
    pub fn new(session: impl Into<String>, config: ConsoleConfig, sink: Arc<dyn DebugEventSink>) -> Self {
        Self { session: session.into(), config, history: Mutex::new(VecDeque::new()), sink }
    }

    /// Write a lifecycle line
    pub fn system(&self, text: impl Into<String>) {
        self.write(ConsoleLevel::System, text.into());
    }

    /// Write an informational line
    pub fn info(&self, text: impl Into<String>) {
        self.write(ConsoleLevel::Info, text.into());
    }

    /// Write an error line
    pub fn error(&self, text: impl Into<String>) {
        self.write(ConsoleLevel::Error, text.into());
    }

    fn write(&self, level: ConsoleLevel, text: String) {
        match level {
            ConsoleLevel::Error => error!(session = %self.session, "{text}"),
            _ => info!(session = %self.session, "{text}"),
        }

        let line = ConsoleLine { timestamp: Local::now(), level, text };
        {
            let mut history = self.history.lock();
            if self.config.max_history > 0 {
                while history.len() >= self.config.max_history {
                    history.pop_front();
                }
                history.push_back(line.clone());
            }
        }
        self.sink.console(&line);
    }

    /// Lines currently kept, oldest first
    pub fn history(&self) -> Vec<ConsoleLine> {
        self.history.lock().iter().cloned().collect()
    }

    /// History rendered with the configured timestamp setting
    pub fn rendered_history(&self) -> Vec<String> {
        self.history.lock().iter().map(|line| line.render(self.config.show_timestamps)).collect()
    }
}
