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

//! SDB Engine - debug session coordination for stored programs
//!
//! Drives an interactive step-debugging session for a program unit executing
//! inside a database server. Two dedicated connections cooperate: the target
//! connection runs the program, the debugger connection controls it through
//! the server-side debug API.
//!
//! # Key Components
//!
//! - [`DebugSession`] - the session state machine (initialize, step, stop)
//! - [`DebugProtocolClient`] - adapter boundary towards the database debug API
//! - [`BreakpointRegistry`] - editor breakpoints bound to server ids
//! - [`RuntimeResolver`] - turns stepping results into visible positions
//! - [`SessionStatus`] - lifecycle flags of a session
//! - [`DebuggerConfig`] - settings loaded from `~/.sdb.toml`

pub mod breakpoint;
pub use breakpoint::*;

pub mod config;
pub use config::*;

pub mod error;
pub use error::*;

pub mod protocol;
pub use protocol::*;

pub mod resolver;
pub use resolver::*;

pub mod session;
pub use session::*;

pub mod sink;
pub use sink::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
