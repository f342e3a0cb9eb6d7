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

use std::{fmt::Display, str::FromStr};

use eyre::{bail, eyre, Error, Result};
use serde::{Deserialize, Serialize};

/// Object type assumed when a location string names none.
pub const DEFAULT_OBJECT_TYPE: &str = "PROCEDURE";

/// Identifier assigned by the database when a breakpoint is set server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakpointId(pub i32);

impl Display for BreakpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identity of an editor breakpoint, used to key its server binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakpointKey(pub u64);

/// A line inside a stored program unit.
///
/// `line` is 0-based (editor numbering); the server expects 1-based lines, see
/// [`ProgramLocation::server_line`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramLocation {
    /// Schema owning the program unit
    pub owner: String,
    /// Name of the program unit
    pub program: String,
    /// Object type as the server names it, upper-case (e.g. `PACKAGE BODY`)
    pub object_type: String,
    /// 0-based line inside the program source
    pub line: u32,
}

impl ProgramLocation {
    /// Create a location; the object type is normalized to upper case.
    pub fn new(
        owner: impl Into<String>,
        program: impl Into<String>,
        object_type: impl AsRef<str>,
        line: u32,
    ) -> Self {
        Self {
            owner: owner.into(),
            program: program.into(),
            object_type: object_type.as_ref().trim().to_uppercase(),
            line,
        }
    }

    /// Line number in server numbering (1-based)
    pub fn server_line(&self) -> u32 {
        self.line + 1
    }
}

impl Display for ProgramLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.owner, self.program)?;
        if self.object_type != DEFAULT_OBJECT_TYPE {
            write!(f, "@{}", self.object_type)?;
        }
        write!(f, ":{}", self.server_line())
    }
}

impl FromStr for ProgramLocation {
    type Err = Error;

    /// Parses a location from a string.
    /// Format: `<owner>.<program>[@<object type>]:<line>` with a 1-based line
    /// Examples:
    /// - `HR.PAYROLL:12` - line 12 of procedure HR.PAYROLL
    /// - `HR.BILLING@PACKAGE BODY:140` - line 140 of a package body
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let Some((object, line)) = trimmed.rsplit_once(':') else {
            bail!("Invalid program location format. Expected <owner>.<program>[@<type>]:<line>, got: {s}");
        };

        let line = line.trim().parse::<u32>().map_err(|e| eyre!("Invalid line number: {e}"))?;
        if line == 0 {
            bail!("Line numbers start at 1");
        }

        let (name, object_type) = match object.split_once('@') {
            Some((name, object_type)) => (name, object_type.trim()),
            None => (object, DEFAULT_OBJECT_TYPE),
        };
        if object_type.is_empty() {
            bail!("Missing object type after '@' in: {s}");
        }

        let Some((owner, program)) = name.trim().split_once('.') else {
            bail!("Program location must be qualified with its owner, got: {s}");
        };
        if owner.is_empty() || program.is_empty() {
            bail!("Empty owner or program name in: {s}");
        }

        Ok(Self::new(owner, program, object_type, line - 1))
    }
}

/// An editor line breakpoint on the connection under debug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineBreakpoint {
    /// Identity used to dedupe and key the server binding
    pub key: BreakpointKey,
    /// Where the breakpoint sits
    pub location: ProgramLocation,
}

impl LineBreakpoint {
    /// Create a line breakpoint
    pub fn new(key: u64, location: ProgramLocation) -> Self {
        Self { key: BreakpointKey(key), location }
    }
}

impl Display for LineBreakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_procedure_location() {
        let loc: ProgramLocation = "HR.PAYROLL:12".parse().unwrap();
        assert_eq!(loc.owner, "HR");
        assert_eq!(loc.program, "PAYROLL");
        assert_eq!(loc.object_type, DEFAULT_OBJECT_TYPE);
        assert_eq!(loc.line, 11);
        assert_eq!(loc.server_line(), 12);
    }

    #[test]
    fn test_parse_typed_location() {
        let loc: ProgramLocation = "HR.BILLING@package body:140".parse().unwrap();
        assert_eq!(loc.object_type, "PACKAGE BODY");
        assert_eq!(loc.line, 139);
        assert_eq!(loc.to_string(), "HR.BILLING@PACKAGE BODY:140");
    }

    #[test]
    fn test_display_round_trips_default_type() {
        let loc = ProgramLocation::new("HR", "PAYROLL", "procedure", 0);
        assert_eq!(loc.to_string(), "HR.PAYROLL:1");
        assert_eq!(loc.to_string().parse::<ProgramLocation>().unwrap(), loc);
    }

    #[test]
    fn test_parse_rejects_malformed_locations() {
        for input in ["PAYROLL:3", "HR.PAYROLL", "HR.PAYROLL:0", "HR.PAYROLL:x", "HR.@TYPE:3", "HR.P@:3"]
        {
            assert!(input.parse::<ProgramLocation>().is_err(), "accepted {input}");
        }
    }

    #[test]
    fn test_line_breakpoint_display() {
        let bp = LineBreakpoint::new(7, ProgramLocation::new("HR", "PAYROLL", "PROCEDURE", 9));
        assert_eq!(bp.key, BreakpointKey(7));
        assert_eq!(bp.to_string(), "@HR.PAYROLL:10");
        assert_eq!(BreakpointId(42).to_string(), "#42");
    }
}
