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

//! Test doubles for exercising debug sessions without a database.
//!
//! [`ScriptedDebugApi`] plays the server side: stepping calls pop results from
//! a queue (and report termination once it runs dry), every call is recorded,
//! and individual operations can be made to fail. The mock connections count
//! how often they are closed, and [`ScriptedTrigger`] stands in for the
//! program under debug.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use sdb_common::types::{
    Backtrace, BreakpointId, ConnectionId, DbError, DbResult, LineBreakpoint, ProgramLocation,
    RuntimeInfo, SessionInfo,
};
use tokio_util::sync::CancellationToken;

use crate::{
    breakpoint::BreakpointSource,
    protocol::{
        ConnectionProvider, ConnectionRole, DatabaseConnection, DebugProtocolClient,
        ExecutionTrigger,
    },
    resolver::SuspendContext,
    session::ConsoleLine,
    sink::{DebugEventSink, TerminationNotice},
};

/// Stop reason reported when the debuggee ran to completion
pub const REASON_EXIT: i32 = 15;

/// One recorded protocol call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCall {
    /// Trait method name
    pub operation: &'static str,
    /// Argument summary, if any
    pub detail: Option<String>,
}

#[derive(Debug)]
struct ScriptState {
    calls: Vec<ProtocolCall>,
    failures: HashMap<&'static str, DbError>,
    refused_breakpoints: HashMap<ProgramLocation, DbError>,
    assigned_breakpoints: HashMap<ProgramLocation, BreakpointId>,
    next_breakpoint_id: i32,
    default_breakpoint: Option<BreakpointId>,
    steps: VecDeque<RuntimeInfo>,
    endless: Option<RuntimeInfo>,
    backtraces: VecDeque<Backtrace>,
    fixed_backtrace: Option<Backtrace>,
    last: Option<RuntimeInfo>,
    step_delay: Option<Duration>,
}

/// Scripted stand-in for the server-side debug API
#[derive(Debug)]
pub struct ScriptedDebugApi {
    state: Mutex<ScriptState>,
}

impl Default for ScriptedDebugApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDebugApi {
    /// An API that accepts everything and reports termination on the first step
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                calls: Vec::new(),
                failures: HashMap::new(),
                refused_breakpoints: HashMap::new(),
                assigned_breakpoints: HashMap::new(),
                next_breakpoint_id: 1,
                default_breakpoint: None,
                steps: VecDeque::new(),
                endless: None,
                backtraces: VecDeque::new(),
                fixed_backtrace: None,
                last: None,
                step_delay: None,
            }),
        }
    }

    /// Install an unhandled-exception breakpoint with this id
    pub fn with_default_breakpoint(self, id: BreakpointId) -> Self {
        self.state.lock().default_breakpoint = Some(id);
        self
    }

    /// Make every stepping call take `delay` (tokio time)
    pub fn with_step_delay(self, delay: Duration) -> Self {
        self.state.lock().step_delay = Some(delay);
        self
    }

    /// Queue the result of the next stepping call
    pub fn push_step(&self, runtime: RuntimeInfo) {
        self.state.lock().steps.push_back(runtime);
    }

    /// Queue several stepping results
    pub fn push_steps(&self, runtimes: impl IntoIterator<Item = RuntimeInfo>) {
        self.state.lock().steps.extend(runtimes);
    }

    /// Once the queue is empty, keep returning `runtime` instead of terminating
    pub fn endless_stepping(&self, runtime: RuntimeInfo) {
        self.state.lock().endless = Some(runtime);
    }

    /// Queue the result of the next backtrace call
    pub fn push_backtrace(&self, backtrace: Backtrace) {
        self.state.lock().backtraces.push_back(backtrace);
    }

    /// Return `backtrace` whenever the queue is empty
    pub fn fixed_backtrace(&self, backtrace: Backtrace) {
        self.state.lock().fixed_backtrace = Some(backtrace);
    }

    /// Make every call of `operation` fail with `error`
    pub fn fail_on(&self, operation: &'static str, error: DbError) {
        self.state.lock().failures.insert(operation, error);
    }

    /// Let `operation` succeed again
    pub fn clear_failure(&self, operation: &'static str) {
        self.state.lock().failures.remove(operation);
    }

    /// Refuse breakpoints at `location`
    pub fn refuse_breakpoint(&self, location: &ProgramLocation, error: DbError) {
        self.state.lock().refused_breakpoints.insert(location.clone(), error);
    }

    /// Hand out `id` for breakpoints at `location`
    pub fn assign_breakpoint_id(&self, location: &ProgramLocation, id: BreakpointId) {
        self.state.lock().assigned_breakpoints.insert(location.clone(), id);
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<ProtocolCall> {
        self.state.lock().calls.clone()
    }

    /// Names of every call so far, in order
    pub fn operations(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(|call| call.operation).collect()
    }

    /// How often `operation` was called
    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().calls.iter().filter(|call| call.operation == operation).count()
    }

    /// Ids passed to `remove_breakpoint`, in call order
    pub fn removed_breakpoints(&self) -> Vec<BreakpointId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == "remove_breakpoint")
            .filter_map(|call| call.detail.as_deref()?.parse().ok().map(BreakpointId))
            .collect()
    }

    fn record(&self, operation: &'static str, detail: Option<String>) -> DbResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ProtocolCall { operation, detail });
        match state.failures.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn stepping(
        &self,
        operation: &'static str,
        detail: Option<String>,
    ) -> DbResult<RuntimeInfo> {
        self.record(operation, detail)?;
        let delay = self.state.lock().step_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let runtime = match state.steps.pop_front() {
            Some(runtime) => runtime,
            None => state.endless.clone().unwrap_or_else(|| RuntimeInfo::terminated(REASON_EXIT)),
        };
        state.last = Some(runtime.clone());
        Ok(runtime)
    }
}

impl DebugProtocolClient<MockConnection> for ScriptedDebugApi {
    async fn initialize_session(&self, _target: &MockConnection) -> DbResult<SessionInfo> {
        self.record("initialize_session", None)?;
        Ok(SessionInfo::new("0A1B2C3D"))
    }

    async fn enable_debugging(&self, _target: &MockConnection) -> DbResult<()> {
        self.record("enable_debugging", None)
    }

    async fn disable_debugging(&self, _target: &MockConnection) -> DbResult<()> {
        self.record("disable_debugging", None)
    }

    async fn attach_session(&self, _debugger: &MockConnection, session_id: &str) -> DbResult<()> {
        self.record("attach_session", Some(session_id.to_string()))
    }

    async fn detach_session(&self, _debugger: &MockConnection) -> DbResult<()> {
        self.record("detach_session", None)
    }

    async fn synchronize_session(&self, _debugger: &MockConnection) -> DbResult<RuntimeInfo> {
        self.stepping("synchronize_session", None).await
    }

    async fn step_over(&self, _debugger: &MockConnection) -> DbResult<RuntimeInfo> {
        self.stepping("step_over", None).await
    }

    async fn step_into(&self, _debugger: &MockConnection) -> DbResult<RuntimeInfo> {
        self.stepping("step_into", None).await
    }

    async fn step_out(&self, _debugger: &MockConnection) -> DbResult<RuntimeInfo> {
        self.stepping("step_out", None).await
    }

    async fn resume_execution(&self, _debugger: &MockConnection) -> DbResult<RuntimeInfo> {
        self.stepping("resume_execution", None).await
    }

    async fn stop_execution(&self, _debugger: &MockConnection) -> DbResult<RuntimeInfo> {
        self.record("stop_execution", None)?;
        Ok(RuntimeInfo::terminated(REASON_EXIT))
    }

    async fn run_to_position(
        &self,
        location: &ProgramLocation,
        _debugger: &MockConnection,
    ) -> DbResult<RuntimeInfo> {
        self.stepping("run_to_position", Some(location.to_string())).await
    }

    async fn execution_backtrace(&self, _debugger: &MockConnection) -> DbResult<Backtrace> {
        self.record("execution_backtrace", None)?;
        let mut state = self.state.lock();
        if let Some(backtrace) = state.backtraces.pop_front() {
            return Ok(backtrace);
        }
        if let Some(backtrace) = &state.fixed_backtrace {
            return Ok(backtrace.clone());
        }
        Ok(match &state.last {
            Some(last) if !last.is_terminated() => Backtrace::new(vec![last.clone()]),
            _ => Backtrace::default(),
        })
    }

    fn runtime_event_reason(&self, code: i32) -> String {
        match code {
            REASON_EXIT => "Program terminated".to_string(),
            other => format!("Reason {other}"),
        }
    }

    async fn set_breakpoint(
        &self,
        location: &ProgramLocation,
        _debugger: &MockConnection,
    ) -> DbResult<BreakpointId> {
        self.record("set_breakpoint", Some(location.to_string()))?;
        let mut state = self.state.lock();
        if let Some(err) = state.refused_breakpoints.get(location) {
            return Err(err.clone());
        }
        if let Some(id) = state.assigned_breakpoints.get(location) {
            return Ok(*id);
        }
        let id = BreakpointId(state.next_breakpoint_id);
        state.next_breakpoint_id += 1;
        Ok(id)
    }

    async fn remove_breakpoint(&self, id: BreakpointId, _debugger: &MockConnection) -> DbResult<()> {
        self.record("remove_breakpoint", Some(id.0.to_string()))
    }

    async fn set_default_breakpoint(
        &self,
        _debugger: &MockConnection,
    ) -> DbResult<Option<BreakpointId>> {
        self.record("set_default_breakpoint", None)?;
        Ok(self.state.lock().default_breakpoint)
    }

    async fn remove_default_breakpoint(
        &self,
        id: BreakpointId,
        _debugger: &MockConnection,
    ) -> DbResult<()> {
        self.record("remove_default_breakpoint", Some(id.0.to_string()))
    }
}

#[derive(Debug, Default)]
struct MockConnectionState {
    closes: AtomicUsize,
    auto_commit: Mutex<Option<bool>>,
    closed: CancellationToken,
}

/// In-memory connection that records autocommit changes and closes
#[derive(Debug, Clone)]
pub struct MockConnection {
    role: ConnectionRole,
    state: Arc<MockConnectionState>,
}

impl MockConnection {
    /// A connection playing `role`
    pub fn new(role: ConnectionRole) -> Self {
        Self { role, state: Arc::default() }
    }

    /// A debugger connection
    pub fn debugger() -> Self {
        Self::new(ConnectionRole::Debugger)
    }

    /// A target connection
    pub fn target() -> Self {
        Self::new(ConnectionRole::Target)
    }

    /// Role this connection was opened for
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// How often `close` was called
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Last autocommit setting, if any was made
    pub fn auto_commit(&self) -> Option<bool> {
        *self.state.auto_commit.lock()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.state.closed.cancelled().await;
    }
}

impl DatabaseConnection for MockConnection {
    async fn set_auto_commit(&self, enabled: bool) -> DbResult<()> {
        *self.state.auto_commit.lock() = Some(enabled);
        Ok(())
    }

    async fn close(&self) -> DbResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.closed.cancel();
        Ok(())
    }
}

/// Provider handing out [`MockConnection`]s and keeping a handle to each
#[derive(Debug)]
pub struct MockConnectionProvider {
    id: ConnectionId,
    opened: Mutex<Vec<MockConnection>>,
    failures: Mutex<HashMap<ConnectionRole, DbError>>,
}

impl MockConnectionProvider {
    /// Provider for the connection `id`
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        Self { id: id.into(), opened: Mutex::new(Vec::new()), failures: Mutex::new(HashMap::new()) }
    }

    /// Fail to open connections for `role`
    pub fn fail_connection(&self, role: ConnectionRole, error: DbError) {
        self.failures.lock().insert(role, error);
    }

    /// Every connection opened so far
    pub fn opened(&self) -> Vec<MockConnection> {
        self.opened.lock().clone()
    }

    /// The first connection opened for `role`
    pub fn connection(&self, role: ConnectionRole) -> Option<MockConnection> {
        self.opened.lock().iter().find(|conn| conn.role == role).cloned()
    }

    fn open(&self, role: ConnectionRole) -> DbResult<MockConnection> {
        if let Some(err) = self.failures.lock().get(&role) {
            return Err(err.clone());
        }
        let connection = MockConnection::new(role);
        self.opened.lock().push(connection.clone());
        Ok(connection)
    }
}

impl ConnectionProvider for MockConnectionProvider {
    type Connection = MockConnection;

    fn connection_id(&self) -> ConnectionId {
        self.id.clone()
    }

    async fn target_connection(&self, _schema: Option<&str>) -> DbResult<MockConnection> {
        self.open(ConnectionRole::Target)
    }

    async fn debugger_connection(&self) -> DbResult<MockConnection> {
        self.open(ConnectionRole::Debugger)
    }
}

/// Sink recording every event it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    console: Mutex<Vec<ConsoleLine>>,
    positions: Mutex<Vec<SuspendContext>>,
    terminations: Mutex<Vec<TerminationNotice>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of every console line
    pub fn console_lines(&self) -> Vec<String> {
        self.console.lock().iter().map(|line| line.text.clone()).collect()
    }

    /// Every surfaced position
    pub fn positions(&self) -> Vec<SuspendContext> {
        self.positions.lock().clone()
    }

    /// Every termination notice
    pub fn terminations(&self) -> Vec<TerminationNotice> {
        self.terminations.lock().clone()
    }

    /// Every failed operation with its message
    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().clone()
    }
}

impl DebugEventSink for RecordingSink {
    fn console(&self, line: &ConsoleLine) {
        self.console.lock().push(line.clone());
    }

    fn position_reached(&self, context: &SuspendContext) {
        self.positions.lock().push(context.clone());
    }

    fn session_terminated(&self, notice: &TerminationNotice) {
        self.terminations.lock().push(notice.clone());
    }

    fn operation_failed(&self, operation: &str, message: &str) {
        self.failures.lock().push((operation.to_string(), message.to_string()));
    }
}

/// Breakpoint source editable from a test
#[derive(Debug, Default)]
pub struct InMemoryBreakpoints {
    breakpoints: Mutex<Vec<LineBreakpoint>>,
}

impl InMemoryBreakpoints {
    /// Source holding `breakpoints`
    pub fn new(breakpoints: impl IntoIterator<Item = LineBreakpoint>) -> Self {
        Self { breakpoints: Mutex::new(breakpoints.into_iter().collect()) }
    }

    /// Add a breakpoint
    pub fn add(&self, breakpoint: LineBreakpoint) {
        self.breakpoints.lock().push(breakpoint);
    }
}

impl BreakpointSource for InMemoryBreakpoints {
    fn database_breakpoints(&self) -> Vec<LineBreakpoint> {
        self.breakpoints.lock().clone()
    }
}

#[derive(Debug)]
enum TriggerBehavior {
    Complete,
    Fail(DbError),
    UntilReleased(CancellationToken),
}

/// Stand-in for the program under debug
#[derive(Debug)]
pub struct ScriptedTrigger {
    behavior: TriggerBehavior,
    executions: AtomicUsize,
}

impl ScriptedTrigger {
    /// Program that finishes immediately
    pub fn completing() -> Self {
        Self::with_behavior(TriggerBehavior::Complete)
    }

    /// Program that raises `error`
    pub fn failing(error: DbError) -> Self {
        Self::with_behavior(TriggerBehavior::Fail(error))
    }

    /// Program that runs until `release` is cancelled, or fails once its
    /// connection is closed underneath it
    pub fn until_released(release: CancellationToken) -> Self {
        Self::with_behavior(TriggerBehavior::UntilReleased(release))
    }

    fn with_behavior(behavior: TriggerBehavior) -> Self {
        Self { behavior, executions: AtomicUsize::new(0) }
    }

    /// How often the program was executed
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl ExecutionTrigger<MockConnection> for ScriptedTrigger {
    fn execute<'a>(&'a self, target: &'a MockConnection) -> BoxFuture<'a, DbResult<()>> {
        async move {
            self.executions.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                TriggerBehavior::Complete => Ok(()),
                TriggerBehavior::Fail(err) => Err(err.clone()),
                TriggerBehavior::UntilReleased(release) => {
                    tokio::select! {
                        _ = release.cancelled() => Ok(()),
                        _ = target.closed() => Err(DbError::with_code(1013, "user requested cancel of current operation")),
                    }
                }
            }
        }
        .boxed()
    }
}
