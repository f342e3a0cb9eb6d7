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

//! SDB Common - Shared functionality for SDB components
//!
//! This crate provides the data model shared by the debug session engine and
//! its adapters: runtime positions reported by the server-side debug API,
//! call stacks, line breakpoints, database errors, and the logging setup.

/// Common types used throughout SDB including runtime info, backtraces and breakpoints
pub mod types;

/// Logging setup and utilities for consistent logging across SDB components
pub mod logging;

pub use logging::*;
