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

//! Error types for debug session operations.

use sdb_common::types::{ConnectionId, DbError, DbResult};
use thiserror::Error;

use crate::protocol::ConnectionRole;

/// Result type for debug session operations
pub type DebugResult<T> = Result<T, DebugError>;

/// Errors raised while driving a debug session
#[derive(Debug, Clone, Error)]
pub enum DebugError {
    /// A debug API call failed on the database side
    #[error("{operation} failed: {source}")]
    Database {
        /// The debug API call that failed
        operation: &'static str,
        /// Error reported by the database
        #[source]
        source: DbError,
    },

    /// The connection needed for an operation has not been acquired or was already released
    #[error("{0} connection is not available")]
    ConnectionUnavailable(ConnectionRole),

    /// The session is stopping; no further commands are accepted
    #[error("debug session is terminating")]
    SessionTerminating,

    /// Another stepping command has not finished resolving yet
    #[error("cannot run {requested} while {running} is in progress")]
    OperationInProgress {
        /// The rejected command
        requested: &'static str,
        /// The command still running
        running: &'static str,
    },

    /// A debug session already runs on this connection
    #[error("a debug session is already active on connection {0}")]
    DebugSessionActive(ConnectionId),

    /// The session was cancelled before the phase could start
    #[error("{0} cancelled")]
    Cancelled(&'static str),

    /// The server kept reporting positions that differ from the top of the call stack
    #[error("execution did not settle on a visible frame after {0} automatic resumes")]
    LocationSkipLimit(usize),

    /// Suspension resolution was invoked outside the session's background task
    #[error("operation must run on the debug session task")]
    NotOnSessionTask,
}

impl DebugError {
    /// Database error text, when the failure came from the server
    pub fn database_error(&self) -> Option<&DbError> {
        match self {
            Self::Database { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Attach the name of the debug API call to a database failure.
pub trait DbResultExt<T> {
    /// Convert into a [`DebugResult`] naming the failed `operation`
    fn during(self, operation: &'static str) -> DebugResult<T>;
}

impl<T> DbResultExt<T> for DbResult<T> {
    fn during(self, operation: &'static str) -> DebugResult<T> {
        self.map_err(|source| DebugError::Database { operation, source })
    }
}
