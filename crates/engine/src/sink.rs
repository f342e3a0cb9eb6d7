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

//! Notifications from a debug session to the user interface.
//!
//! The session holds its sink through an `Arc` but does not own the UI behind
//! it; a sink may outlive or be dropped independently of the session that
//! reports to it.

use sdb_common::types::ConnectionId;

use crate::{resolver::SuspendContext, session::ConsoleLine, session::StatusSnapshot};

/// Final report sent once a session is fully torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationNotice {
    /// Connection that was debugged
    pub connection: ConnectionId,
    /// Server stop reason, when the server reported the termination
    pub reason_code: Option<i32>,
    /// Human readable reason
    pub reason: String,
    /// Whether the execution was cut short rather than run to completion
    pub cancelled: bool,
    /// Session flags at the end of teardown
    pub status: StatusSnapshot,
}

/// Receiver of session events. Every method defaults to doing nothing.
pub trait DebugEventSink: Send + Sync {
    /// A line was appended to the session console
    fn console(&self, _line: &ConsoleLine) {}

    /// The debuggee suspended at a visible position
    fn position_reached(&self, _context: &SuspendContext) {}

    /// The session finished teardown
    fn session_terminated(&self, _notice: &TerminationNotice) {}

    /// A user-issued operation failed; the session keeps running unless it
    /// reports termination separately
    fn operation_failed(&self, _operation: &str, _message: &str) {}
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DebugEventSink for NullSink {}
