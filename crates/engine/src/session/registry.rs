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

use std::sync::Arc;

use dashmap::DashSet;
use sdb_common::types::ConnectionId;
use tracing::{debug, info};

use crate::error::{DebugError, DebugResult};

/// Connections that currently have a live debug session.
///
/// Cheap to clone; clones share the same set. A connection can host at most
/// one session, and other features consult the registry to refuse work on a
/// connection that is being debugged.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<DashSet<ConnectionId>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session on `connection`
    ///
    /// # Errors
    ///
    /// [`DebugError::DebugSessionActive`] if the connection already has one.
    pub fn register(&self, connection: &ConnectionId) -> DebugResult<()> {
        if !self.active.insert(connection.clone()) {
            return Err(DebugError::DebugSessionActive(connection.clone()));
        }
        info!(%connection, "Debug session registered");
        Ok(())
    }

    /// Forget the session on `connection`. Returns whether one was recorded.
    pub fn unregister(&self, connection: &ConnectionId) -> bool {
        let removed = self.active.remove(connection).is_some();
        debug!(%connection, removed, "Debug session unregistered");
        removed
    }

    /// Whether `connection` has a live session
    pub fn is_active(&self, connection: &ConnectionId) -> bool {
        self.active.contains(connection)
    }

    /// Refuse an operation on a connection that is being debugged.
    ///
    /// # Errors
    ///
    /// [`DebugError::DebugSessionActive`] naming the connection.
    pub fn check_forbidden_operation(&self, connection: &ConnectionId) -> DebugResult<()> {
        if self.is_active(connection) {
            return Err(DebugError::DebugSessionActive(connection.clone()));
        }
        Ok(())
    }

    /// Connections with a live session, sorted
    pub fn active_sessions(&self) -> Vec<ConnectionId> {
        let mut sessions: Vec<_> = self.active.iter().map(|id| id.key().clone()).collect();
        sessions.sort();
        sessions
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_session_on_connection_is_rejected() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new("hr@prod");

        registry.register(&conn).unwrap();
        let err = registry.register(&conn).unwrap_err();
        assert!(matches!(err, DebugError::DebugSessionActive(ref id) if *id == conn));

        registry.register(&ConnectionId::new("scott@dev")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = SessionRegistry::new();
        let other = registry.clone();
        let conn = ConnectionId::new("hr@prod");

        registry.register(&conn).unwrap();
        assert!(other.is_active(&conn));
        assert!(other.check_forbidden_operation(&conn).is_err());

        assert!(other.unregister(&conn));
        assert!(!other.unregister(&conn));
        assert!(registry.check_forbidden_operation(&conn).is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_active_sessions_sorted() {
        let registry = SessionRegistry::new();
        registry.register(&"b".into()).unwrap();
        registry.register(&"a".into()).unwrap();
        assert_eq!(registry.active_sessions(), vec![ConnectionId::new("a"), ConnectionId::new("b")]);
    }
}
