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

//! Test utilities for integration tests

use std::{sync::Arc, time::Duration};

use eyre::{eyre, Result};
use sdb_common::types::{ConnectionId, DbError, LineBreakpoint, RuntimeInfo};
use sdb_engine::{
    test_utils::{
        InMemoryBreakpoints, MockConnection, MockConnectionProvider, RecordingSink,
        ScriptedDebugApi, ScriptedTrigger,
    },
    ConnectionRole, DebugSession, DebuggerConfig, ExecutionTrigger, SessionRegistry, StatusFlag,
};
use tokio_util::sync::CancellationToken;

/// Upper bound for any wait in a test; a session that needs longer is hung.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Initialization utilities for tests
pub mod init {
    /// Initialize logging for a test
    pub fn init_test_environment() {
        sdb_common::logging::ensure_test_logging(None);
    }
}

/// A position inside an `HR` program unit
pub fn at(program: &str, line: u32) -> RuntimeInfo {
    RuntimeInfo::at(Some("HR"), program, line)
}

/// How the program under debug behaves
#[derive(Debug, Clone)]
pub enum TargetBehavior {
    /// Finishes right away
    Completes,
    /// Raises the given error
    Fails(DbError),
    /// Keeps running until released or until its connection is closed
    RunsUntilReleased,
}

/// Session type used by the tests
pub type TestSession = DebugSession<MockConnectionProvider, ScriptedDebugApi>;

/// A debug session wired to scripted collaborators
pub struct SessionFixture {
    /// Connection provider; keeps every opened connection
    pub provider: Arc<MockConnectionProvider>,
    /// Scripted server side
    pub api: Arc<ScriptedDebugApi>,
    /// Recorded UI events
    pub sink: Arc<RecordingSink>,
    /// Program under debug
    pub trigger: Arc<ScriptedTrigger>,
    /// Registry the session was recorded in
    pub registry: SessionRegistry,
    /// The session
    pub session: TestSession,
    release: CancellationToken,
}

impl SessionFixture {
    /// Builder with the defaults: connection `hr@test`, a target that runs
    /// until released, no breakpoints and the default config
    pub fn builder(api: ScriptedDebugApi) -> SessionFixtureBuilder {
        SessionFixtureBuilder {
            api,
            connection: ConnectionId::new("hr@test"),
            behavior: TargetBehavior::RunsUntilReleased,
            breakpoints: Vec::new(),
            config: DebuggerConfig::default(),
            registry: SessionRegistry::new(),
        }
    }

    /// Let a [`TargetBehavior::RunsUntilReleased`] program finish
    pub fn release_target(&self) {
        self.release.cancel();
    }

    /// First connection opened for `role`
    pub fn connection(&self, role: ConnectionRole) -> Result<MockConnection> {
        self.provider.connection(role).ok_or_else(|| eyre!("no {role} connection was opened"))
    }

    /// Start the session and wait for its initialization task
    pub async fn start(&self) -> Result<()> {
        let handle = self.session.start()?;
        tokio::time::timeout(SETTLE_TIMEOUT, handle).await??;
        Ok(())
    }

    /// Wait until teardown has completed
    pub async fn wait_terminated(&self) -> Result<()> {
        tokio::time::timeout(SETTLE_TIMEOUT, self.session.wait_terminated())
            .await
            .map_err(|_| eyre!("session did not terminate"))
    }

    /// Wait until `flag` is set. The target task may finish after teardown.
    pub async fn wait_for(&self, flag: StatusFlag) -> Result<()> {
        let poll = async {
            while !self.session.status().contains(flag) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(SETTLE_TIMEOUT, poll).await.map_err(|_| eyre!("{flag} was never set"))
    }
}

/// Builder for [`SessionFixture`]
pub struct SessionFixtureBuilder {
    api: ScriptedDebugApi,
    connection: ConnectionId,
    behavior: TargetBehavior,
    breakpoints: Vec<LineBreakpoint>,
    config: DebuggerConfig,
    registry: SessionRegistry,
}

impl SessionFixtureBuilder {
    /// Debug a different connection
    pub fn connection(mut self, id: &str) -> Self {
        self.connection = ConnectionId::new(id);
        self
    }

    /// Program behaviour
    pub fn target(mut self, behavior: TargetBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Editor breakpoints
    pub fn breakpoints(mut self, breakpoints: Vec<LineBreakpoint>) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    /// Session settings
    pub fn config(mut self, config: DebuggerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared session registry
    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Build the fixture; fails if the registry rejects the session
    pub fn build(self) -> Result<SessionFixture> {
        init::init_test_environment();

        let provider = Arc::new(MockConnectionProvider::new(self.connection));
        let api = Arc::new(self.api);
        let sink = Arc::new(RecordingSink::new());
        let release = CancellationToken::new();
        let trigger = Arc::new(match self.behavior {
            TargetBehavior::Completes => ScriptedTrigger::completing(),
            TargetBehavior::Fails(err) => ScriptedTrigger::failing(err),
            TargetBehavior::RunsUntilReleased => ScriptedTrigger::until_released(release.clone()),
        });
        let execution: Arc<dyn ExecutionTrigger<MockConnection>> = trigger.clone();

        let session = DebugSession::builder(provider.clone(), api.clone(), execution)
            .with_breakpoints(Arc::new(InMemoryBreakpoints::new(self.breakpoints)))
            .with_sink(sink.clone())
            .with_registry(self.registry.clone())
            .with_config(self.config)
            .build()?;

        Ok(SessionFixture {
            provider,
            api,
            sink,
            trigger,
            registry: self.registry,
            session,
            release,
        })
    }
}
