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

//! Turning stepping results into something the user can look at.
//!
//! After every stepping command the server reports where the debuggee
//! stopped. That position is not always one the user should see: the server
//! also stops inside declaration blocks and internal frames, in which case the
//! top of the call stack disagrees with the reported position. The resolver
//! resumes past such stops, bounded by `max_skips`, and surfaces the first
//! position that agrees with its own call stack.

use std::fmt;

use sdb_common::types::{Backtrace, RuntimeInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::DEFAULT_MAX_LOCATION_SKIPS,
    error::{DbResultExt, DebugError, DebugResult},
    protocol::{DatabaseConnection, DebugProtocolClient},
    session::SessionStatus,
};

/// What kind of program text the session executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionTarget {
    /// A stored method invoked through a generated runner block
    #[default]
    Method,
    /// Ad-hoc statement text; the first `preamble_lines` lines of the editor
    /// content are not sent to the server
    Statement {
        /// Lines of the editor content preceding the text the server sees
        preamble_lines: u32,
    },
}

impl ExecutionTarget {
    fn line_offset(&self) -> u32 {
        match self {
            Self::Method => 0,
            Self::Statement { preamble_lines } => *preamble_lines,
        }
    }
}

/// A position in editor terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Schema owning the program unit; `None` for anonymous blocks
    pub owner: Option<String>,
    /// Program unit name
    pub program: Option<String>,
    /// 0-based line in the editor
    pub line: u32,
}

impl SourcePosition {
    /// Map a server position (1-based) to the editor (0-based). Owner-less
    /// frames are statement text and get the preamble offset added.
    pub fn from_runtime(runtime: &RuntimeInfo, target: ExecutionTarget) -> Self {
        let mut line = runtime.line_number.saturating_sub(1);
        if !runtime.has_owner() {
            line += target.line_offset();
        }
        Self { owner: runtime.owner_name.clone(), program: runtime.program_name.clone(), line }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.owner, &self.program) {
            (Some(owner), Some(program)) if !owner.is_empty() => write!(f, "{owner}.{program}")?,
            (_, Some(program)) => write!(f, "{program}")?,
            (_, None) => write!(f, "<anonymous>")?,
        }
        write!(f, ":{}", self.line + 1)
    }
}

/// One entry of the surfaced call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Depth, 0 for the innermost frame
    pub index: usize,
    /// Editor position of the frame
    pub position: SourcePosition,
    /// Raw server frame
    pub runtime: RuntimeInfo,
}

impl StackFrame {
    /// Label shown in the frames view, e.g. `PAYROLL (line 12)`
    pub fn display_name(&self) -> String {
        let line = self.position.line + 1;
        match (&self.position.program, self.runtime.has_owner()) {
            (Some(program), true) => format!("{program} (line {line})"),
            _ => format!("Anonymous block (line {line})"),
        }
    }
}

/// A position surfaced to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendContext {
    /// Server position the debuggee is suspended at
    pub runtime: RuntimeInfo,
    /// Same position in editor terms
    pub position: SourcePosition,
    /// Call stack, innermost first; empty when it could not be fetched
    pub frames: Vec<StackFrame>,
    /// Number of automatic resumes issued before settling here
    pub skipped: usize,
}

/// Result of resolving a stepping result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The target finished
    Terminated {
        /// The terminating stepping result
        runtime: RuntimeInfo,
        /// Reason text from the protocol client
        reason: String,
    },
    /// The debuggee is suspended at a visible position
    Suspended(SuspendContext),
    /// The session began stopping while resolving; nothing to surface
    Abandoned,
}

/// Resolves stepping results for one session
pub struct RuntimeResolver<'a, C, D> {
    client: &'a D,
    debugger: &'a C,
    status: &'a SessionStatus,
    target: ExecutionTarget,
    max_skips: usize,
}

impl<'a, C, D> RuntimeResolver<'a, C, D>
where
    C: DatabaseConnection,
    D: DebugProtocolClient<C>,
{
    /// Create a resolver working on the debugger connection
    pub fn new(client: &'a D, debugger: &'a C, status: &'a SessionStatus) -> Self {
        Self {
            client,
            debugger,
            status,
            target: ExecutionTarget::default(),
            max_skips: DEFAULT_MAX_LOCATION_SKIPS,
        }
    }

    /// Set the execution target kind
    pub fn with_execution_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    /// Set the bound on automatic resumes
    pub fn with_max_skips(mut self, max_skips: usize) -> Self {
        self.max_skips = max_skips;
        self
    }

    /// Resolve `runtime` into a terminal notice or a visible suspension.
    ///
    /// # Errors
    ///
    /// Fails with [`DebugError::LocationSkipLimit`] when the position keeps
    /// disagreeing with the call stack, or with the database error of a
    /// failed automatic resume.
    pub async fn resolve(&self, runtime: RuntimeInfo) -> DebugResult<Resolution> {
        let mut runtime = runtime;
        let mut skipped = 0;

        loop {
            if self.status.is_stopping() {
                return Ok(Resolution::Abandoned);
            }

            if runtime.is_terminated() {
                let reason = self.client.runtime_event_reason(runtime.reason);
                return Ok(Resolution::Terminated { runtime, reason });
            }

            let backtrace = match self.client.execution_backtrace(self.debugger).await {
                Ok(backtrace) => backtrace,
                Err(err) => {
                    warn!(position = %runtime, error = %err, "Failed to load execution backtrace");
                    Backtrace::default()
                }
            };

            let hidden = backtrace.top().filter(|top| !top.is_same_location(&runtime)).cloned();
            let Some(top) = hidden else {
                return Ok(Resolution::Suspended(self.suspend_context(runtime, backtrace, skipped)));
            };

            if skipped >= self.max_skips {
                return Err(DebugError::LocationSkipLimit(skipped));
            }
            skipped += 1;
            debug!(reported = %runtime, adopted = %top, skipped, "Resuming past hidden frame");
            runtime = self.client.resume_execution(self.debugger).await.during("resume_execution")?;
        }
    }

    fn suspend_context(
        &self,
        runtime: RuntimeInfo,
        backtrace: Backtrace,
        skipped: usize,
    ) -> SuspendContext {
        let frames = backtrace
            .into_iter()
            .enumerate()
            .map(|(index, frame)| StackFrame {
                index,
                position: SourcePosition::from_runtime(&frame, self.target),
                runtime: frame,
            })
            .collect();

        SuspendContext {
            position: SourcePosition::from_runtime(&runtime, self.target),
            runtime,
            frames,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::StatusFlag,
        test_utils::{MockConnection, ScriptedDebugApi},
    };
    use sdb_common::{ensure_test_logging, types::DbError};

    fn at(program: &str, line: u32) -> RuntimeInfo {
        RuntimeInfo::at(Some("HR"), program, line)
    }

    #[test]
    fn test_source_position_mapping() {
        let method = SourcePosition::from_runtime(&at("PAYROLL", 12), ExecutionTarget::Method);
        assert_eq!(method.line, 11);

        let statement = ExecutionTarget::Statement { preamble_lines: 4 };
        let owned = SourcePosition::from_runtime(&at("PAYROLL", 12), statement);
        assert_eq!(owned.line, 11);

        let anonymous = SourcePosition::from_runtime(&RuntimeInfo::at(None, "BLOCK", 3), statement);
        assert_eq!(anonymous.line, 6);
        assert_eq!(anonymous.to_string(), "BLOCK:7");
    }

    #[test]
    fn test_frame_display_name() {
        let frame = StackFrame {
            index: 0,
            position: SourcePosition::from_runtime(&at("PAYROLL", 12), ExecutionTarget::Method),
            runtime: at("PAYROLL", 12),
        };
        assert_eq!(frame.display_name(), "PAYROLL (line 12)");

        let block = RuntimeInfo::at(None, "BLOCK", 2);
        let frame = StackFrame {
            index: 1,
            position: SourcePosition::from_runtime(&block, ExecutionTarget::Method),
            runtime: block,
        };
        assert_eq!(frame.display_name(), "Anonymous block (line 2)");
    }

    #[tokio::test]
    async fn test_terminated_runtime_reports_reason() {
        ensure_test_logging(None);
        let api = ScriptedDebugApi::new();
        let conn = MockConnection::debugger();
        let status = SessionStatus::new();

        let resolution = RuntimeResolver::new(&api, &conn, &status)
            .resolve(RuntimeInfo::terminated(crate::test_utils::REASON_EXIT))
            .await
            .unwrap();

        match resolution {
            Resolution::Terminated { reason, .. } => assert_eq!(reason, "Program terminated"),
            other => panic!("unexpected resolution {other:?}"),
        }
        assert_eq!(api.call_count("execution_backtrace"), 0);
    }

    #[tokio::test]
    async fn test_matching_top_frame_is_surfaced() {
        ensure_test_logging(None);
        let api = ScriptedDebugApi::new();
        api.push_backtrace(Backtrace::from(vec![at("PAYROLL", 10), at("RUNNER", 3)]));
        let conn = MockConnection::debugger();
        let status = SessionStatus::new();

        let resolution =
            RuntimeResolver::new(&api, &conn, &status).resolve(at("PAYROLL", 10)).await.unwrap();

        let Resolution::Suspended(context) = resolution else {
            panic!("expected suspension");
        };
        assert_eq!(context.position.line, 9);
        assert_eq!(context.skipped, 0);
        assert_eq!(context.frames.len(), 2);
        assert_eq!(context.frames[1].display_name(), "RUNNER (line 3)");
        assert_eq!(api.call_count("resume_execution"), 0);
    }

    #[tokio::test]
    async fn test_mismatched_top_frame_resumes_once() {
        ensure_test_logging(None);
        let api = ScriptedDebugApi::new();
        api.push_backtrace(Backtrace::from(vec![at("PAYROLL", 20)]));
        api.push_step(at("PAYROLL", 20));
        let conn = MockConnection::debugger();
        let status = SessionStatus::new();

        let resolution =
            RuntimeResolver::new(&api, &conn, &status).resolve(at("INTERNAL", 5)).await.unwrap();

        let Resolution::Suspended(context) = resolution else {
            panic!("expected suspension");
        };
        assert_eq!(context.runtime, at("PAYROLL", 20));
        assert_eq!(context.skipped, 1);
        assert_eq!(api.call_count("resume_execution"), 1);
    }

    #[tokio::test]
    async fn test_location_skips_are_bounded() {
        ensure_test_logging(None);
        let api = ScriptedDebugApi::new();
        // Every resume lands on INTERNAL:5 while the stack always claims PAYROLL:20.
        api.endless_stepping(at("INTERNAL", 5));
        api.fixed_backtrace(Backtrace::from(vec![at("PAYROLL", 20)]));
        let conn = MockConnection::debugger();
        let status = SessionStatus::new();

        let err = RuntimeResolver::new(&api, &conn, &status)
            .with_max_skips(4)
            .resolve(at("INTERNAL", 5))
            .await
            .unwrap_err();

        assert!(matches!(err, DebugError::LocationSkipLimit(4)));
        assert_eq!(api.call_count("resume_execution"), 4);
    }

    #[tokio::test]
    async fn test_backtrace_failure_surfaces_without_stack() {
        ensure_test_logging(None);
        let api = ScriptedDebugApi::new();
        api.fail_on("execution_backtrace", DbError::new("ORA-04068"));
        let conn = MockConnection::debugger();
        let status = SessionStatus::new();

        let resolution =
            RuntimeResolver::new(&api, &conn, &status).resolve(at("PAYROLL", 10)).await.unwrap();

        let Resolution::Suspended(context) = resolution else {
            panic!("expected suspension");
        };
        assert!(context.frames.is_empty());
        assert_eq!(context.position.line, 9);
    }

    #[tokio::test]
    async fn test_stopping_session_abandons_resolution() {
        let api = ScriptedDebugApi::new();
        let conn = MockConnection::debugger();
        let status = SessionStatus::new();
        status.set(StatusFlag::ProcessTerminating);

        let resolution =
            RuntimeResolver::new(&api, &conn, &status).resolve(at("PAYROLL", 10)).await.unwrap();

        assert_eq!(resolution, Resolution::Abandoned);
        assert!(api.calls().is_empty());
    }
}
