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

//! Server-side bindings of editor line breakpoints.
//!
//! The server assigns its own id to every breakpoint it accepts. Ids are only
//! meaningful while the server-side debug session exists, so bindings are
//! created once the session is attached and dropped before the connections are
//! released. Several editor breakpoints can end up behind one server id (two
//! breakpoints on lines the server maps to the same statement), which is why
//! clearing works on distinct ids.

use std::collections::{BTreeMap, HashSet};

use sdb_common::types::{BreakpointId, BreakpointKey, DbError, LineBreakpoint};
use tracing::{debug, warn};

use crate::{
    error::{DbResultExt, DebugResult},
    protocol::{DatabaseConnection, DebugProtocolClient},
};

/// Read-only view of the line breakpoints set on the connection under debug.
pub trait BreakpointSource: Send + Sync {
    /// Breakpoints in editor order
    fn database_breakpoints(&self) -> Vec<LineBreakpoint>;
}

impl BreakpointSource for Vec<LineBreakpoint> {
    fn database_breakpoints(&self) -> Vec<LineBreakpoint> {
        self.clone()
    }
}

/// Outcome of registering a batch of breakpoints
#[derive(Debug, Clone, Default)]
pub struct RegistrationReport {
    /// Breakpoints that received a server id
    pub registered: Vec<(BreakpointKey, BreakpointId)>,
    /// Breakpoints the server refused
    pub failed: Vec<(LineBreakpoint, DbError)>,
    /// Whether an unhandled-exception breakpoint was installed
    pub default_breakpoint: Option<BreakpointId>,
}

/// Maps editor breakpoints to server ids for one debug session
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    bindings: BTreeMap<BreakpointKey, BreakpointId>,
    default_breakpoint: Option<BreakpointId>,
}

impl BreakpointRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Set every breakpoint server-side, then the default breakpoint.
    ///
    /// Breakpoints that already have a binding are left alone. A breakpoint the
    /// server refuses is logged and reported; the others are still registered.
    pub async fn register<C, D>(
        &mut self,
        client: &D,
        debugger: &C,
        breakpoints: &[LineBreakpoint],
    ) -> RegistrationReport
    where
        C: DatabaseConnection,
        D: DebugProtocolClient<C>,
    {
        let mut report = RegistrationReport::default();

        for breakpoint in breakpoints {
            if self.bindings.contains_key(&breakpoint.key) {
                continue;
            }
            match client.set_breakpoint(&breakpoint.location, debugger).await {
                Ok(id) => {
                    debug!(breakpoint = %breakpoint, %id, "Breakpoint registered");
                    self.bindings.insert(breakpoint.key, id);
                    report.registered.push((breakpoint.key, id));
                }
                Err(err) => {
                    warn!(breakpoint = %breakpoint, error = %err, "Failed to register breakpoint");
                    report.failed.push((breakpoint.clone(), err));
                }
            }
        }

        if self.default_breakpoint.is_none() {
            match client.set_default_breakpoint(debugger).await {
                Ok(id) => self.default_breakpoint = id,
                Err(err) => warn!(error = %err, "Failed to register default breakpoint"),
            }
        }
        report.default_breakpoint = self.default_breakpoint;

        report
    }

    /// Set a single breakpoint server-side, e.g. one added while suspended.
    pub async fn register_one<C, D>(
        &mut self,
        client: &D,
        debugger: &C,
        breakpoint: &LineBreakpoint,
    ) -> DebugResult<BreakpointId>
    where
        C: DatabaseConnection,
        D: DebugProtocolClient<C>,
    {
        if let Some(id) = self.bindings.get(&breakpoint.key) {
            return Ok(*id);
        }
        let id = client.set_breakpoint(&breakpoint.location, debugger).await.during("set_breakpoint")?;
        self.bindings.insert(breakpoint.key, id);
        Ok(id)
    }

    /// Clear every binding and the default breakpoint.
    ///
    /// Issues one server call per distinct id and returns how many were made.
    /// Failures are logged; the binding is dropped regardless since its id dies
    /// with the server session anyway.
    pub async fn unregister<C, D>(&mut self, client: &D, debugger: &C) -> usize
    where
        C: DatabaseConnection,
        D: DebugProtocolClient<C>,
    {
        let mut cleared = HashSet::new();

        for (key, id) in std::mem::take(&mut self.bindings) {
            if !cleared.insert(id) {
                continue;
            }
            if let Err(err) = client.remove_breakpoint(id, debugger).await {
                warn!(?key, %id, error = %err, "Failed to unregister breakpoint");
            }
        }

        if let Some(id) = self.default_breakpoint.take() {
            if let Err(err) = client.remove_default_breakpoint(id, debugger).await {
                warn!(%id, error = %err, "Failed to unregister default breakpoint");
            }
        }

        cleared.len()
    }

    /// Drop the binding of one breakpoint. The server id is only cleared when
    /// no other breakpoint still shares it.
    pub async fn unregister_one<C, D>(
        &mut self,
        client: &D,
        debugger: &C,
        key: BreakpointKey,
    ) -> DebugResult<bool>
    where
        C: DatabaseConnection,
        D: DebugProtocolClient<C>,
    {
        let Some(id) = self.bindings.remove(&key) else {
            return Ok(false);
        };
        if self.bindings.values().any(|other| *other == id) {
            return Ok(false);
        }
        client.remove_breakpoint(id, debugger).await.during("remove_breakpoint")?;
        Ok(true)
    }

    /// Server id bound to an editor breakpoint
    pub fn binding(&self, key: BreakpointKey) -> Option<BreakpointId> {
        self.bindings.get(&key).copied()
    }

    /// Server id of the default breakpoint
    pub fn default_breakpoint(&self) -> Option<BreakpointId> {
        self.default_breakpoint
    }

    /// Number of bound editor breakpoints
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.default_breakpoint.is_none()
    }
}
