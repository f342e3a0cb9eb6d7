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

//! Debug session coordination.
//!
//! A [`DebugSession`] owns the connection pair of one debugged connection and
//! drives it through initialization, synchronization, stepping and teardown.
//! Every multi-step operation runs on a tokio task; the public methods return
//! immediately and report through the [`DebugEventSink`](crate::DebugEventSink)
//! and the session state.

mod console;
mod coordinator;
mod registry;
mod status;

pub use console::*;
pub use coordinator::*;
pub use registry::*;
pub use status::*;
