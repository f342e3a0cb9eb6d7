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

//! Boundary traits towards the database.
//!
//! The session engine never talks to a driver directly. A protocol adapter
//! implements [`DebugProtocolClient`] on top of the server-side debug API
//! (DBMS_DEBUG style: a debuggee session that runs the program and a debugger
//! session that controls it), and a [`ConnectionProvider`] hands out the two
//! dedicated connections a session needs.
//!
//! All calls take the connection explicitly. Adapters keep no session state,
//! so one client instance can serve any number of concurrent sessions.

use std::{fmt, future::Future};

use futures::future::BoxFuture;
use sdb_common::types::{
    Backtrace, BreakpointId, ConnectionId, DbResult, ProgramLocation, RuntimeInfo, SessionInfo,
};

/// Which of the two session connections an operation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Connection executing the program under debug
    Target,
    /// Connection issuing debug-control commands
    Debugger,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target => f.write_str("target"),
            Self::Debugger => f.write_str("debugger"),
        }
    }
}

/// A dedicated database connection owned by a debug session.
pub trait DatabaseConnection: Send + Sync + 'static {
    /// Toggle autocommit; the target connection runs with it disabled
    fn set_auto_commit(&self, enabled: bool) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the connection. The session calls this exactly once per connection.
    fn close(&self) -> impl Future<Output = DbResult<()>> + Send;
}

/// Source of the connection pair for the connection under debug.
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Connection type handed out by this provider
    type Connection: DatabaseConnection;

    /// Identity of the connection being debugged
    fn connection_id(&self) -> ConnectionId;

    /// Display name used in console and log output
    fn connection_name(&self) -> String {
        self.connection_id().to_string()
    }

    /// Open the connection that will execute the target program, with
    /// `schema` as its current schema when given
    fn target_connection(
        &self,
        schema: Option<&str>,
    ) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Open the connection used to control the debuggee
    fn debugger_connection(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}

/// Client for the database-side debug API
///
/// Every stepping call returns the [`RuntimeInfo`] the server reports once the
/// debuggee stops again (or terminates).
pub trait DebugProtocolClient<C: DatabaseConnection>: Send + Sync + 'static {
    /// Create a server-side debug session on the target connection
    fn initialize_session(&self, target: &C) -> impl Future<Output = DbResult<SessionInfo>> + Send;

    /// Turn on debug mode for code executed on the target connection
    fn enable_debugging(&self, target: &C) -> impl Future<Output = DbResult<()>> + Send;

    /// Turn off debug mode on the target connection
    fn disable_debugging(&self, target: &C) -> impl Future<Output = DbResult<()>> + Send;

    /// Attach the debugger connection to the server-side session
    fn attach_session(
        &self,
        debugger: &C,
        session_id: &str,
    ) -> impl Future<Output = DbResult<()>> + Send;

    /// Detach the debugger connection from the server-side session
    fn detach_session(&self, debugger: &C) -> impl Future<Output = DbResult<()>> + Send;

    /// Wait for the debuggee to reach a stop point and report it
    fn synchronize_session(&self, debugger: &C)
        -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Step over the current line
    fn step_over(&self, debugger: &C) -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Step into the call on the current line
    fn step_into(&self, debugger: &C) -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Run until the current program unit returns
    fn step_out(&self, debugger: &C) -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Run until the next breakpoint or termination
    fn resume_execution(&self, debugger: &C) -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Abort the running program
    fn stop_execution(&self, debugger: &C) -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Run until `location` is reached. Adapters send `location.server_line()`.
    fn run_to_position(
        &self,
        location: &ProgramLocation,
        debugger: &C,
    ) -> impl Future<Output = DbResult<RuntimeInfo>> + Send;

    /// Fetch the current call stack, innermost frame first
    fn execution_backtrace(&self, debugger: &C) -> impl Future<Output = DbResult<Backtrace>> + Send;

    /// Human readable text for a stop reason code
    fn runtime_event_reason(&self, code: i32) -> String;

    /// Set a line breakpoint server-side
    fn set_breakpoint(
        &self,
        location: &ProgramLocation,
        debugger: &C,
    ) -> impl Future<Output = DbResult<BreakpointId>> + Send;

    /// Clear a server-side breakpoint
    fn remove_breakpoint(
        &self,
        id: BreakpointId,
        debugger: &C,
    ) -> impl Future<Output = DbResult<()>> + Send;

    /// Install the breakpoint that catches unhandled exceptions. APIs without
    /// one return `None`.
    fn set_default_breakpoint(
        &self,
        _debugger: &C,
    ) -> impl Future<Output = DbResult<Option<BreakpointId>>> + Send {
        async { Ok(None) }
    }

    /// Remove the unhandled-exception breakpoint
    fn remove_default_breakpoint(
        &self,
        _id: BreakpointId,
        _debugger: &C,
    ) -> impl Future<Output = DbResult<()>> + Send {
        async { Ok(()) }
    }
}

/// Runs the program under debug on the target connection.
///
/// The session treats the call as a black box: it resolves when the program
/// finishes and fails with the database error the program raised.
pub trait ExecutionTrigger<C>: Send + Sync {
    /// Execute the target program
    fn execute<'a>(&'a self, target: &'a C) -> BoxFuture<'a, DbResult<()>>;
}
