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

//! Execution positions as reported by the server-side debug API.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a database connection, used to track which connections have a
/// live debug session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Handle of a server-side debug session, returned when one is initialized
/// and later used by the debugger connection to attach to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Server-assigned session identifier
    pub session_id: String,
}

impl SessionInfo {
    /// Wrap a server session id
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into() }
    }
}

/// One stepping result: either a position the target stopped at, or the
/// notice that the target has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Schema owning the executing program unit; `None` for anonymous blocks
    pub owner_name: Option<String>,
    /// Name of the executing program unit
    pub program_name: Option<String>,
    /// Current line, 1-based as numbered by the server
    pub line_number: u32,
    /// Server namespace of the program unit (body, specification, trigger...)
    pub namespace: i32,
    /// Depth of this frame in the call stack, 0 for the innermost
    pub frame_index: u32,
    /// Why execution stopped, translated to text by the protocol client
    pub reason: i32,
    terminated: bool,
}

impl RuntimeInfo {
    /// A live position inside `owner.program` at the given 1-based line
    pub fn at(owner: Option<&str>, program: impl Into<String>, line_number: u32) -> Self {
        Self {
            owner_name: owner.map(str::to_string),
            program_name: Some(program.into()),
            line_number,
            namespace: 0,
            frame_index: 0,
            reason: 0,
            terminated: false,
        }
    }

    /// The notice that the target program finished, with the server's reason
    pub fn terminated(reason: i32) -> Self {
        Self {
            owner_name: None,
            program_name: None,
            line_number: 0,
            namespace: 0,
            frame_index: 0,
            reason,
            terminated: true,
        }
    }

    /// Set the stop reason code
    pub fn with_reason(mut self, reason: i32) -> Self {
        self.reason = reason;
        self
    }

    /// Set the frame depth
    pub fn with_frame_index(mut self, frame_index: u32) -> Self {
        self.frame_index = frame_index;
        self
    }

    /// Set the server namespace
    pub fn with_namespace(mut self, namespace: i32) -> Self {
        self.namespace = namespace;
        self
    }

    /// Whether the target program has finished executing
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether the frame belongs to a named program unit
    pub fn has_owner(&self) -> bool {
        self.owner_name.as_deref().is_some_and(|owner| !owner.is_empty())
    }

    /// Two positions are the same location when owner, program and line match.
    pub fn is_same_location(&self, other: &Self) -> bool {
        self.owner_name == other.owner_name
            && self.program_name == other.program_name
            && self.line_number == other.line_number
    }
}

impl fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terminated {
            return write!(f, "<terminated, reason {}>", self.reason);
        }
        match (&self.owner_name, &self.program_name) {
            (Some(owner), Some(program)) => write!(f, "{owner}.{program}")?,
            (None, Some(program)) => write!(f, "{program}")?,
            (_, None) => write!(f, "<anonymous>")?,
        }
        write!(f, ":{}", self.line_number)
    }
}

/// Call stack captured at a suspension point; index 0 is the innermost frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backtrace {
    frames: Vec<RuntimeInfo>,
}

impl Backtrace {
    /// Build a backtrace from frames ordered innermost first
    pub fn new(frames: Vec<RuntimeInfo>) -> Self {
        Self { frames }
    }

    /// The innermost frame, if any
    pub fn top(&self) -> Option<&RuntimeInfo> {
        self.frames.first()
    }

    /// Whether the server reported no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Iterate frames, innermost first
    pub fn iter(&self) -> std::slice::Iter<'_, RuntimeInfo> {
        self.frames.iter()
    }

    /// Consume into the frame list
    pub fn into_frames(self) -> Vec<RuntimeInfo> {
        self.frames
    }
}

impl From<Vec<RuntimeInfo>> for Backtrace {
    fn from(frames: Vec<RuntimeInfo>) -> Self {
        Self::new(frames)
    }
}

impl IntoIterator for Backtrace {
    type Item = RuntimeInfo;
    type IntoIter = std::vec::IntoIter<RuntimeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl<'a> IntoIterator for &'a Backtrace {
    type Item = &'a RuntimeInfo;
    type IntoIter = std::slice::Iter<'a, RuntimeInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}
