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

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use sdb_common::types::{
    BreakpointId, BreakpointKey, ConnectionId, LineBreakpoint, ProgramLocation, RuntimeInfo,
    SessionInfo,
};
use tokio::{
    sync::{oneshot, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    breakpoint::{BreakpointRegistry, BreakpointSource},
    config::DebuggerConfig,
    error::{DbResultExt, DebugError, DebugResult},
    protocol::{ConnectionProvider, ConnectionRole, DatabaseConnection, DebugProtocolClient, ExecutionTrigger},
    resolver::{ExecutionTarget, Resolution, RuntimeResolver, SuspendContext},
    session::{ConsoleLine, DebugConsole, SessionRegistry, SessionStatus, StatusFlag, StatusSnapshot},
    sink::{DebugEventSink, NullSink, TerminationNotice},
};

tokio::task_local! {
    static SESSION_TASK: u64;
}

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

type Conn<P> = <P as ConnectionProvider>::Connection;

/// Suspension handling must run on a task spawned by the session it belongs to.
fn ensure_session_task(key: u64) -> DebugResult<()> {
    match SESSION_TASK.try_with(|current| *current == key) {
        Ok(true) => Ok(()),
        _ => Err(DebugError::NotOnSessionTask),
    }
}

/// A user-issued stepping command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommand {
    /// Step over the current line
    StepOver,
    /// Step into the call on the current line
    StepInto,
    /// Run until the current unit returns
    StepOut,
    /// Run to the next breakpoint
    Resume,
    /// Re-synchronize with the debuggee; the protocol has no asynchronous pause
    Pause,
    /// Run to a location, or re-resolve the current position when `None`
    RunToPosition(Option<ProgramLocation>),
}

impl StepCommand {
    /// Operation name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::StepOver => "step_over",
            Self::StepInto => "step_into",
            Self::StepOut => "step_out",
            Self::Resume => "resume",
            Self::Pause => "pause",
            Self::RunToPosition(_) => "run_to_position",
        }
    }
}

/// Occupies the session's operation slot until dropped.
struct OperationGuard {
    slot: Arc<Mutex<Option<&'static str>>>,
}

impl OperationGuard {
    fn acquire(slot: &Arc<Mutex<Option<&'static str>>>, operation: &'static str) -> DebugResult<Self> {
        let mut current = slot.lock();
        if let Some(running) = *current {
            return Err(DebugError::OperationInProgress { requested: operation, running });
        }
        *current = Some(operation);
        Ok(Self { slot: slot.clone() })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

struct ConnectionPair<C> {
    target: Mutex<Option<Arc<C>>>,
    debugger: Mutex<Option<Arc<C>>>,
}

struct SessionInner<P: ConnectionProvider, D> {
    key: u64,
    connection: ConnectionId,
    provider: Arc<P>,
    client: Arc<D>,
    trigger: Arc<dyn ExecutionTrigger<Conn<P>>>,
    breakpoints: Arc<dyn BreakpointSource>,
    sink: Arc<dyn DebugEventSink>,
    registry: SessionRegistry,
    config: DebuggerConfig,
    target: ExecutionTarget,
    schema: Option<String>,

    status: SessionStatus,
    console: DebugConsole,
    connections: ConnectionPair<Conn<P>>,
    breakpoint_registry: AsyncMutex<BreakpointRegistry>,
    runtime: Mutex<Option<RuntimeInfo>>,
    suspended_at: Mutex<Option<SuspendContext>>,
    termination: Mutex<Option<(Option<i32>, String)>>,
    operation: Arc<Mutex<Option<&'static str>>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    debugging_enabled: AtomicBool,
    execution_cancelled: AtomicBool,
    cancel: CancellationToken,
    terminated: watch::Sender<bool>,
}

impl<P: ConnectionProvider, D> Drop for SessionInner<P, D> {
    fn drop(&mut self) {
        // Teardown never ran, so the connection is still recorded.
        if !self.status.is(StatusFlag::ProcessTerminated) {
            self.registry.unregister(&self.connection);
        }
    }
}

/// Builder for [`DebugSession`]
pub struct DebugSessionBuilder<P: ConnectionProvider, D> {
    provider: Arc<P>,
    client: Arc<D>,
    trigger: Arc<dyn ExecutionTrigger<Conn<P>>>,
    breakpoints: Arc<dyn BreakpointSource>,
    sink: Arc<dyn DebugEventSink>,
    registry: SessionRegistry,
    config: DebuggerConfig,
    target: ExecutionTarget,
    schema: Option<String>,
}

impl<P, D> DebugSessionBuilder<P, D>
where
    P: ConnectionProvider,
    D: DebugProtocolClient<Conn<P>>,
{
    /// Line breakpoints to register once the server session exists
    pub fn with_breakpoints(mut self, breakpoints: Arc<dyn BreakpointSource>) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    /// Receiver of console lines, positions and termination
    pub fn with_sink(mut self, sink: Arc<dyn DebugEventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Registry shared with the other sessions of the application
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Session settings
    pub fn with_config(mut self, config: DebuggerConfig) -> Self {
        self.config = config;
        self
    }

    /// Kind of program text being executed
    pub fn with_execution_target(mut self, target: ExecutionTarget) -> Self {
        self.target = target;
        self
    }

    /// Current schema for the target connection
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Create the session and record it in the registry.
    ///
    /// # Errors
    ///
    /// [`DebugError::DebugSessionActive`] if the connection is already being debugged.
    pub fn build(self) -> DebugResult<DebugSession<P, D>> {
        let connection = self.provider.connection_id();
        self.registry.register(&connection)?;

        let console =
            DebugConsole::new(self.provider.connection_name(), self.config.console.clone(), self.sink.clone());
        let (terminated, _) = watch::channel(false);

        let inner = SessionInner {
            key: NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed),
            connection,
            provider: self.provider,
            client: self.client,
            trigger: self.trigger,
            breakpoints: self.breakpoints,
            sink: self.sink,
            registry: self.registry,
            config: self.config,
            target: self.target,
            schema: self.schema,
            status: SessionStatus::new(),
            console,
            connections: ConnectionPair { target: Mutex::new(None), debugger: Mutex::new(None) },
            breakpoint_registry: AsyncMutex::new(BreakpointRegistry::new()),
            runtime: Mutex::new(None),
            suspended_at: Mutex::new(None),
            termination: Mutex::new(None),
            operation: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            debugging_enabled: AtomicBool::new(false),
            execution_cancelled: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            terminated,
        };

        Ok(DebugSession { inner: Arc::new(inner) })
    }
}

/// Interactive debug session for the program executed on one connection.
///
/// The handle is cheap to clone. Operations return immediately with the
/// [`JoinHandle`] of the task doing the work; results are reported to the
/// [`DebugEventSink`] and reflected in [`DebugSession::status`].
pub struct DebugSession<P: ConnectionProvider, D> {
    inner: Arc<SessionInner<P, D>>,
}

impl<P: ConnectionProvider, D> Clone for DebugSession<P, D> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P: ConnectionProvider, D> fmt::Debug for DebugSession<P, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("connection", &self.inner.connection)
            .field("status", &self.inner.status.snapshot())
            .finish()
    }
}

impl<P, D> DebugSession<P, D>
where
    P: ConnectionProvider,
    D: DebugProtocolClient<Conn<P>>,
{
    /// Start building a session that debugs the connection of `provider`
    pub fn builder(
        provider: Arc<P>,
        client: Arc<D>,
        trigger: Arc<dyn ExecutionTrigger<Conn<P>>>,
    ) -> DebugSessionBuilder<P, D> {
        DebugSessionBuilder {
            provider,
            client,
            trigger,
            breakpoints: Arc::new(Vec::<LineBreakpoint>::new()),
            sink: Arc::new(NullSink),
            registry: SessionRegistry::new(),
            config: DebuggerConfig::default(),
            target: ExecutionTarget::default(),
            schema: None,
        }
    }

    /// Connection being debugged
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection
    }

    /// Initialize the server session, register breakpoints and run the target.
    ///
    /// The returned task finishes once the debuggee first suspends or the
    /// session has been torn down.
    pub fn start(&self) -> DebugResult<JoinHandle<()>> {
        if self.inner.status.is_stopping() {
            return Err(DebugError::SessionTerminating);
        }
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(DebugError::OperationInProgress { requested: "start", running: "start" });
        }
        let guard = OperationGuard::acquire(&self.inner.operation, "start")?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DebugError::OperationInProgress { requested: "start", running: "start" });
        }
        let inner = self.inner.clone();
        Ok(self.inner.spawn("initialize", async move {
            let _guard = guard;
            inner.initialize().await;
        }))
    }

    /// Step over the current line
    pub fn step_over(&self) -> DebugResult<JoinHandle<()>> {
        self.execute(StepCommand::StepOver)
    }

    /// Step into the call on the current line
    pub fn step_into(&self) -> DebugResult<JoinHandle<()>> {
        self.execute(StepCommand::StepInto)
    }

    /// Run until the current program unit returns
    pub fn step_out(&self) -> DebugResult<JoinHandle<()>> {
        self.execute(StepCommand::StepOut)
    }

    /// Run to the next breakpoint
    pub fn resume(&self) -> DebugResult<JoinHandle<()>> {
        self.execute(StepCommand::Resume)
    }

    /// Re-synchronize with the debuggee
    pub fn pause(&self) -> DebugResult<JoinHandle<()>> {
        self.execute(StepCommand::Pause)
    }

    /// Run until `location` is reached
    pub fn run_to_position(&self, location: Option<ProgramLocation>) -> DebugResult<JoinHandle<()>> {
        self.execute(StepCommand::RunToPosition(location))
    }

    /// Issue a stepping command.
    ///
    /// # Errors
    ///
    /// [`DebugError::SessionTerminating`] once the session is stopping, and
    /// [`DebugError::OperationInProgress`] while another command is resolving.
    pub fn execute(&self, command: StepCommand) -> DebugResult<JoinHandle<()>> {
        if self.inner.status.is_stopping() {
            return Err(DebugError::SessionTerminating);
        }
        let guard = OperationGuard::acquire(&self.inner.operation, command.name())?;
        let inner = self.inner.clone();
        Ok(self.inner.spawn(command.name(), async move {
            let _guard = guard;
            inner.run_command(command).await;
        }))
    }

    /// Stop the session. Only the first call does anything; later calls return `None`.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        if !self.inner.begin_stop() {
            return None;
        }
        let inner = self.inner.clone();
        Some(self.inner.spawn("stop", async move { inner.teardown().await }))
    }

    /// Cancel pending phases and stop; the roll-out loop is skipped.
    pub fn cancel(&self) -> Option<JoinHandle<()>> {
        self.inner.cancel.cancel();
        self.stop()
    }

    /// Set a breakpoint added while the session runs. Returns `None` while
    /// breakpoints cannot be set; they are picked up at synchronization.
    pub async fn add_breakpoint(&self, breakpoint: &LineBreakpoint) -> DebugResult<Option<BreakpointId>> {
        if !self.inner.status.is(StatusFlag::BreakpointSettingAllowed) {
            return Ok(None);
        }
        let debugger = self.inner.debugger_connection()?;
        let id = self
            .inner
            .breakpoint_registry
            .lock()
            .await
            .register_one(&*self.inner.client, &*debugger, breakpoint)
            .await?;
        Ok(Some(id))
    }

    /// Clear a breakpoint removed while the session runs
    pub async fn remove_breakpoint(&self, key: BreakpointKey) -> DebugResult<bool> {
        if !self.inner.status.is(StatusFlag::BreakpointSettingAllowed) {
            return Ok(false);
        }
        let debugger = self.inner.debugger_connection()?;
        self.inner
            .breakpoint_registry
            .lock()
            .await
            .unregister_one(&*self.inner.client, &*debugger, key)
            .await
    }

    /// Wait until teardown has completed
    pub async fn wait_terminated(&self) {
        let mut terminated = self.inner.terminated.subscribe();
        // The sender lives inside the session, so this can only end by observing `true`.
        let _ = terminated.wait_for(|done| *done).await;
    }

    /// Current session flags
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.snapshot()
    }

    /// Whether teardown has completed
    pub fn is_terminated(&self) -> bool {
        self.inner.status.is(StatusFlag::ProcessTerminated)
    }

    /// Latest stepping result
    pub fn runtime_info(&self) -> Option<RuntimeInfo> {
        self.inner.runtime_info()
    }

    /// Last position surfaced to the user
    pub fn suspend_context(&self) -> Option<SuspendContext> {
        self.inner.suspended_at.lock().clone()
    }

    /// Console lines kept for this session
    pub fn console_history(&self) -> Vec<ConsoleLine> {
        self.inner.console.history()
    }

    /// Whether the execution was cut short by stopping the session
    pub fn is_execution_cancelled(&self) -> bool {
        self.inner.execution_cancelled.load(Ordering::SeqCst)
    }
}

impl<P, D> SessionInner<P, D>
where
    P: ConnectionProvider,
    D: DebugProtocolClient<Conn<P>>,
{
    fn spawn<F>(&self, operation: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = info_span!("debug_session", connection = %self.connection, operation);
        tokio::spawn(SESSION_TASK.scope(self.key, future).instrument(span))
    }

    fn runtime_info(&self) -> Option<RuntimeInfo> {
        self.runtime.lock().clone()
    }

    fn set_runtime(&self, runtime: RuntimeInfo) {
        *self.runtime.lock() = Some(runtime);
    }

    fn slot(&self, role: ConnectionRole) -> &Mutex<Option<Arc<Conn<P>>>> {
        match role {
            ConnectionRole::Target => &self.connections.target,
            ConnectionRole::Debugger => &self.connections.debugger,
        }
    }

    fn connection_for(&self, role: ConnectionRole) -> DebugResult<Arc<Conn<P>>> {
        self.slot(role).lock().clone().ok_or(DebugError::ConnectionUnavailable(role))
    }

    /// Hand a freshly opened connection to the session. A connection that
    /// arrives after the stop sequence was claimed is closed right away.
    async fn adopt_connection(
        &self,
        role: ConnectionRole,
        connection: Conn<P>,
    ) -> DebugResult<Arc<Conn<P>>> {
        let connection = Arc::new(connection);
        let adopted = {
            let mut slot = self.slot(role).lock();
            if self.stop_requested.load(Ordering::SeqCst) {
                false
            } else {
                *slot = Some(connection.clone());
                true
            }
        };

        if !adopted {
            if let Err(err) = connection.close().await {
                warn!(%role, error = %err, "Failed to release connection");
            }
            return Err(DebugError::SessionTerminating);
        }
        Ok(connection)
    }

    fn debugger_connection(&self) -> DebugResult<Arc<Conn<P>>> {
        self.connection_for(ConnectionRole::Debugger)
    }

    fn record_termination(&self, reason_code: Option<i32>, reason: String) {
        self.termination.lock().get_or_insert((reason_code, reason));
    }

    fn fail_session(&self, operation: &'static str, context: &str, err: &DebugError) {
        self.status.set(StatusFlag::SessionInitializationThrewException);
        let message = format!("{context}: {err}");
        self.console.error(message.clone());
        self.sink.operation_failed(operation, &message);
        self.record_termination(None, message);
    }

    /// A cancelled phase is reported like a failed one but leaves the
    /// exception flags alone.
    fn report_cancelled(&self, operation: &'static str, err: &DebugError) {
        let message = format!("Debug session cancelled: {err}");
        self.console.error(message.clone());
        self.sink.operation_failed(operation, &message);
        self.record_termination(None, message);
    }

    async fn initialize(self: &Arc<Self>) {
        self.console.system("Initializing debug environment");
        match self.open_session().await {
            Ok(info) => {
                self.console.system(format!("Debug session initialized (id = {})", info.session_id));
                self.synchronize().await;
            }
            Err(err @ DebugError::Cancelled(_)) => {
                self.report_cancelled("initialize", &err);
                self.stop().await;
            }
            Err(err) if self.status.is_stopping() => {
                debug!(error = %err, "Initialization interrupted by teardown");
            }
            Err(err) => {
                self.fail_session("initialize", "Error initializing debug environment", &err);
                self.stop().await;
            }
        }
    }

    async fn open_session(&self) -> DebugResult<SessionInfo> {
        if self.cancel.is_cancelled() {
            return Err(DebugError::Cancelled("initialization"));
        }

        let target = self
            .provider
            .target_connection(self.schema.as_deref())
            .await
            .during("open target connection")?;
        let target = self.adopt_connection(ConnectionRole::Target, target).await?;
        target.set_auto_commit(false).await.during("set_auto_commit")?;

        let debugger = self.provider.debugger_connection().await.during("open debugger connection")?;
        let debugger = self.adopt_connection(ConnectionRole::Debugger, debugger).await?;

        let info = self.client.initialize_session(&*target).await.during("initialize_session")?;
        self.client.enable_debugging(&*target).await.during("enable_debugging")?;
        self.debugging_enabled.store(true, Ordering::SeqCst);
        self.client.attach_session(&*debugger, &info.session_id).await.during("attach_session")?;

        Ok(info)
    }

    async fn synchronize(self: &Arc<Self>) {
        if self.status.is(StatusFlag::ProcessTerminating)
            || self.status.is(StatusFlag::TargetExecutionTerminated)
        {
            self.stop().await;
            return;
        }

        if let Err(err) = self.synchronize_target().await {
            if self.status.is_stopping() {
                debug!(error = %err, "Synchronization interrupted by teardown");
            } else {
                self.fail_session("synchronize", "Error synchronizing debug session", &err);
            }
            self.stop().await;
        }
    }

    async fn synchronize_target(self: &Arc<Self>) -> DebugResult<()> {
        let debugger = self.debugger_connection()?;

        self.status.set(StatusFlag::BreakpointSettingAllowed);
        self.register_breakpoints(&debugger).await;

        self.console.system("Starting debugger");
        // Dropped unsent when the run is skipped.
        let _ = self.start_target_program().await;

        if self.status.is_stopping()
            || self.status.is(StatusFlag::TargetExecutionThrewException)
            || self.status.is(StatusFlag::TargetExecutionTerminated)
        {
            return Ok(());
        }

        let runtime =
            self.client.synchronize_session(&*debugger).await.during("synchronize_session")?;
        self.set_runtime(runtime);
        let runtime = self.client.step_over(&*debugger).await.during("step_over")?;
        self.suspend(runtime).await
    }

    async fn register_breakpoints(&self, debugger: &Conn<P>) {
        let breakpoints = self.breakpoints.database_breakpoints();
        let report = self
            .breakpoint_registry
            .lock()
            .await
            .register(&*self.client, debugger, &breakpoints)
            .await;

        for (breakpoint, err) in &report.failed {
            self.console.error(format!("Failed to set breakpoint {breakpoint}: {err}"));
        }
        debug!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            "Breakpoints registered"
        );
    }

    /// Spawn the target run; the receiver fires once the program is executing.
    fn start_target_program(self: &Arc<Self>) -> oneshot::Receiver<()> {
        let (started_tx, started_rx) = oneshot::channel();
        let inner = self.clone();
        self.spawn("run_target", async move { inner.run_target_program(started_tx).await });
        started_rx
    }

    async fn run_target_program(self: &Arc<Self>, started: oneshot::Sender<()>) {
        if self.status.is(StatusFlag::ProcessTerminating)
            || self.status.is(StatusFlag::SessionInitializationThrewException)
        {
            return;
        }

        match self.execute_target(started).await {
            Ok(()) => self.console.system("Target program finished"),
            Err(err @ DebugError::Cancelled(_)) => self.report_cancelled("run_target", &err),
            Err(err) if self.status.is_stopping() => {
                debug!(error = %err, "Target program interrupted by teardown");
            }
            Err(err) => {
                // Debugging is not switched off here; the target connection is dropped on stop.
                self.status.set(StatusFlag::TargetExecutionThrewException);
                let message = format!("Error executing target program: {err}");
                self.console.error(message.clone());
                self.sink.operation_failed("run_target", &message);
                self.record_termination(None, message);
            }
        }

        self.status.set(StatusFlag::TargetExecutionTerminated);
        self.stop().await;
    }

    async fn execute_target(&self, started: oneshot::Sender<()>) -> DebugResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DebugError::Cancelled("target execution"));
        }
        let target = self.connection_for(ConnectionRole::Target)?;

        self.status.set(StatusFlag::TargetExecutionStarted);
        let _ = started.send(());
        self.console.system("Executing target program");

        self.trigger.execute(&*target).await.during("execute target program")
    }

    async fn run_command(self: &Arc<Self>, command: StepCommand) {
        if let Err(err) = self.step(&command).await {
            if self.status.is_stopping() {
                debug!(operation = command.name(), error = %err, "Operation interrupted by teardown");
                return;
            }
            let message = format!("Error performing operation {}: {err}", command.name());
            self.console.error(message.clone());
            self.sink.operation_failed(command.name(), &message);
        }
    }

    async fn step(self: &Arc<Self>, command: &StepCommand) -> DebugResult<()> {
        if self.status.is_stopping() {
            return Err(DebugError::SessionTerminating);
        }
        let debugger = self.debugger_connection()?;
        let conn = &*debugger;

        let runtime = match command {
            StepCommand::StepOver => self.client.step_over(conn).await.during("step_over")?,
            StepCommand::StepInto => self.client.step_into(conn).await.during("step_into")?,
            StepCommand::StepOut => self.client.step_out(conn).await.during("step_out")?,
            StepCommand::Resume => {
                self.client.resume_execution(conn).await.during("resume_execution")?
            }
            StepCommand::Pause => {
                self.client.synchronize_session(conn).await.during("synchronize_session")?
            }
            StepCommand::RunToPosition(Some(location)) => {
                self.client.run_to_position(location, conn).await.during("run_to_position")?
            }
            StepCommand::RunToPosition(None) => match self.runtime_info() {
                Some(runtime) => runtime,
                None => return Ok(()),
            },
        };

        self.suspend(runtime).await
    }

    /// Resolve a stepping result and surface it, or stop if the target finished.
    async fn suspend(self: &Arc<Self>, runtime: RuntimeInfo) -> DebugResult<()> {
        ensure_session_task(self.key)?;
        self.set_runtime(runtime.clone());

        let debugger = self.debugger_connection()?;
        let resolution = RuntimeResolver::new(&*self.client, &*debugger, &self.status)
            .with_execution_target(self.target)
            .with_max_skips(self.config.session.max_location_skips)
            .resolve(runtime)
            .await?;

        match resolution {
            Resolution::Abandoned => debug!("Session stopping, suspension dropped"),
            Resolution::Terminated { runtime, reason } => {
                self.console.system(format!("Session terminated: {reason}"));
                self.record_termination(Some(runtime.reason), reason);
                self.set_runtime(runtime);
                self.status.set(StatusFlag::ProcessStopped);
                self.stop().await;
            }
            Resolution::Suspended(context) => {
                self.set_runtime(context.runtime.clone());
                self.console.info(format!("Suspended at {}", context.position));
                self.sink.position_reached(&context);
                *self.suspended_at.lock() = Some(context);
            }
        }
        Ok(())
    }

    /// Claim the stop sequence. Returns `false` if it was already claimed.
    fn begin_stop(&self) -> bool {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.status.set(StatusFlag::ProcessTerminating);

        let snapshot = self.status.snapshot();
        let completed = snapshot.contains(StatusFlag::ProcessStopped)
            || (snapshot.contains(StatusFlag::TargetExecutionTerminated)
                && !snapshot.contains(StatusFlag::TargetExecutionThrewException));
        self.execution_cancelled.store(!completed, Ordering::SeqCst);
        true
    }

    async fn stop(self: &Arc<Self>) {
        if self.begin_stop() {
            self.teardown().await;
        }
    }

    async fn teardown(&self) {
        self.console.system("Stopping debugger");
        let debugger = self.connections.debugger.lock().clone();

        if let Some(debugger) = &debugger {
            let cleared =
                self.breakpoint_registry.lock().await.unregister(&*self.client, &**debugger).await;
            debug!(cleared, "Breakpoints unregistered");
        }
        self.status.clear(StatusFlag::BreakpointSettingAllowed);

        if let Some(debugger) = &debugger {
            self.roll_out(debugger).await;

            if !self.status.is(StatusFlag::TargetExecutionTerminated) {
                if let Err(err) =
                    self.client.stop_execution(&**debugger).await.during("stop_execution")
                {
                    self.teardown_failure(&err);
                }
            }
            if let Err(err) = self.client.detach_session(&**debugger).await.during("detach_session")
            {
                self.teardown_failure(&err);
            }
        }

        self.release_connections().await;
        self.status.set(StatusFlag::ProcessTerminated);
        self.registry.unregister(&self.connection);
        self.console.system("Debugger stopped");

        let notice = self.termination_notice();
        info!(reason = %notice.reason, cancelled = notice.cancelled, status = %notice.status, "Debug session terminated");
        self.sink.session_terminated(&notice);
        self.terminated.send_replace(true);
    }

    /// Step out until the debuggee finishes so the target connection is not
    /// left suspended inside the program.
    async fn roll_out(&self, debugger: &Conn<P>) {
        if self.cancel.is_cancelled() {
            debug!("Roll-out skipped, session cancelled");
            return;
        }

        let timeout = self.config.roll_out_timeout();
        let started = Instant::now();
        let mut steps = 0usize;

        loop {
            if self.status.has_exception() || self.cancel.is_cancelled() {
                break;
            }
            match self.runtime_info() {
                Some(runtime) if !runtime.is_terminated() => {}
                _ => break,
            }
            if started.elapsed() >= timeout {
                warn!(steps, ?timeout, "Roll-out timed out, debuggee left unwound");
                break;
            }

            match self.client.step_out(debugger).await {
                Ok(runtime) => {
                    steps += 1;
                    self.set_runtime(runtime);
                }
                Err(err) => {
                    warn!(steps, error = %err, "Roll-out step failed");
                    break;
                }
            }
        }
        debug!(steps, elapsed = ?started.elapsed(), "Roll-out finished");
    }

    async fn release_connections(&self) {
        let debugger = self.connections.debugger.lock().take();
        let target = self.connections.target.lock().take();

        if let Some(target) = &target {
            if self.debugging_enabled.load(Ordering::SeqCst)
                && !self.status.is(StatusFlag::TargetExecutionStarted)
            {
                if let Err(err) =
                    self.client.disable_debugging(&**target).await.during("disable_debugging")
                {
                    self.teardown_failure(&err);
                }
            }
        }

        for (role, connection) in [(ConnectionRole::Debugger, debugger), (ConnectionRole::Target, target)] {
            let Some(connection) = connection else { continue };
            match connection.close().await {
                Ok(()) => debug!(%role, "Connection released"),
                Err(err) => warn!(%role, error = %err, "Failed to release connection"),
            }
        }
    }

    fn teardown_failure(&self, err: &DebugError) {
        warn!(error = %err, "Teardown step failed");
        self.console.error(format!("Error stopping debugger: {err}"));
    }

    fn termination_notice(&self) -> TerminationNotice {
        let (reason_code, reason) = self
            .termination
            .lock()
            .clone()
            .unwrap_or_else(|| (None, "Debug session stopped".to_string()));
        TerminationNotice {
            connection: self.connection.clone(),
            reason_code,
            reason,
            cancelled: self.execution_cancelled.load(Ordering::SeqCst),
            status: self.status.snapshot(),
        }
    }
}
