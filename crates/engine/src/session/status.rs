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
    sync::atomic::{AtomicU16, Ordering},
};

use tracing::warn;

/// Lifecycle milestones of a debug session.
///
/// Flags are independent; several hold at once and all except
/// [`StatusFlag::BreakpointSettingAllowed`] stay set once raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusFlag {
    /// The target program began executing
    TargetExecutionStarted = 1 << 0,
    /// The target program finished, successfully or not
    TargetExecutionTerminated = 1 << 1,
    /// The target program raised an error
    TargetExecutionThrewException = 1 << 2,
    /// Setting up or synchronizing the session failed
    SessionInitializationThrewException = 1 << 3,
    /// Breakpoints may be registered with the server
    BreakpointSettingAllowed = 1 << 4,
    /// The server reported that the program stopped
    ProcessStopped = 1 << 5,
    /// Teardown has begun
    ProcessTerminating = 1 << 6,
    /// Teardown finished and both connections are released
    ProcessTerminated = 1 << 7,
}

impl StatusFlag {
    /// Every flag, in declaration order
    pub const ALL: [Self; 8] = [
        Self::TargetExecutionStarted,
        Self::TargetExecutionTerminated,
        Self::TargetExecutionThrewException,
        Self::SessionInitializationThrewException,
        Self::BreakpointSettingAllowed,
        Self::ProcessStopped,
        Self::ProcessTerminating,
        Self::ProcessTerminated,
    ];

    const fn bit(self) -> u16 {
        self as u16
    }

    /// Upper-case name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Self::TargetExecutionStarted => "TARGET_EXECUTION_STARTED",
            Self::TargetExecutionTerminated => "TARGET_EXECUTION_TERMINATED",
            Self::TargetExecutionThrewException => "TARGET_EXECUTION_THREW_EXCEPTION",
            Self::SessionInitializationThrewException => "SESSION_INITIALIZATION_THREW_EXCEPTION",
            Self::BreakpointSettingAllowed => "BREAKPOINT_SETTING_ALLOWED",
            Self::ProcessStopped => "PROCESS_STOPPED",
            Self::ProcessTerminating => "PROCESS_TERMINATING",
            Self::ProcessTerminated => "PROCESS_TERMINATED",
        }
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared, lock-free set of [`StatusFlag`]s
#[derive(Debug, Default)]
pub struct SessionStatus {
    bits: AtomicU16,
}

impl SessionStatus {
    /// All flags cleared
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a flag. Returns `true` if it was not set before.
    ///
    /// Raising [`StatusFlag::ProcessTerminated`] raises
    /// [`StatusFlag::ProcessTerminating`] along with it.
    pub fn set(&self, flag: StatusFlag) -> bool {
        let mut bits = flag.bit();
        if flag == StatusFlag::ProcessTerminated {
            bits |= StatusFlag::ProcessTerminating.bit();
        }
        self.bits.fetch_or(bits, Ordering::SeqCst) & flag.bit() == 0
    }

    /// Lower a flag. Only [`StatusFlag::BreakpointSettingAllowed`] can be
    /// lowered; other requests are ignored and return `false`.
    pub fn clear(&self, flag: StatusFlag) -> bool {
        if flag != StatusFlag::BreakpointSettingAllowed {
            warn!(%flag, "Ignoring attempt to clear a sticky session flag");
            return false;
        }
        self.bits.fetch_and(!flag.bit(), Ordering::SeqCst) & flag.bit() != 0
    }

    /// Whether a flag is set
    pub fn is(&self, flag: StatusFlag) -> bool {
        self.bits.load(Ordering::SeqCst) & flag.bit() != 0
    }

    /// Whether teardown has begun or finished
    pub fn is_stopping(&self) -> bool {
        self.snapshot().contains_any(&[StatusFlag::ProcessTerminating, StatusFlag::ProcessTerminated])
    }

    /// Whether initialization or the target program failed
    pub fn has_exception(&self) -> bool {
        self.snapshot().contains_any(&[
            StatusFlag::SessionInitializationThrewException,
            StatusFlag::TargetExecutionThrewException,
        ])
    }

    /// Copy of the current flags
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot(self.bits.load(Ordering::SeqCst))
    }
}

/// Point-in-time copy of a [`SessionStatus`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StatusSnapshot(u16);

impl StatusSnapshot {
    /// Whether a flag was set
    pub fn contains(&self, flag: StatusFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Whether any of the flags was set
    pub fn contains_any(&self, flags: &[StatusFlag]) -> bool {
        flags.iter().any(|flag| self.contains(*flag))
    }

    /// Whether teardown had begun or finished
    pub fn is_stopping(&self) -> bool {
        self.contains_any(&[StatusFlag::ProcessTerminating, StatusFlag::ProcessTerminated])
    }

    /// Set flags in declaration order
    pub fn flags(&self) -> impl Iterator<Item = StatusFlag> + '_ {
        StatusFlag::ALL.into_iter().filter(|flag| self.contains(*flag))
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.flags().map(StatusFlag::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let status = SessionStatus::new();
        assert!(status.set(StatusFlag::TargetExecutionStarted));
        assert!(status.set(StatusFlag::BreakpointSettingAllowed));

        assert!(status.is(StatusFlag::TargetExecutionStarted));
        assert!(status.is(StatusFlag::BreakpointSettingAllowed));
        assert!(!status.is(StatusFlag::TargetExecutionTerminated));
        assert!(!status.is_stopping());
        assert!(!status.has_exception());
    }

    #[test]
    fn test_set_reports_first_raise_only() {
        let status = SessionStatus::new();
        assert!(status.set(StatusFlag::ProcessStopped));
        assert!(!status.set(StatusFlag::ProcessStopped));
    }

    #[test]
    fn test_terminated_implies_terminating() {
        let status = SessionStatus::new();
        status.set(StatusFlag::ProcessTerminated);
        assert!(status.is(StatusFlag::ProcessTerminating));
        assert!(status.is_stopping());
    }

    #[test]
    fn test_only_breakpoint_setting_can_be_cleared() {
        let status = SessionStatus::new();
        status.set(StatusFlag::BreakpointSettingAllowed);
        status.set(StatusFlag::ProcessTerminated);
        status.set(StatusFlag::TargetExecutionTerminated);

        assert!(status.clear(StatusFlag::BreakpointSettingAllowed));
        assert!(!status.is(StatusFlag::BreakpointSettingAllowed));
        assert!(!status.clear(StatusFlag::BreakpointSettingAllowed));

        assert!(!status.clear(StatusFlag::ProcessTerminated));
        assert!(!status.clear(StatusFlag::TargetExecutionTerminated));
        assert!(status.is(StatusFlag::ProcessTerminated));
        assert!(status.is(StatusFlag::TargetExecutionTerminated));
    }

    #[test]
    fn test_snapshot_display() {
        let status = SessionStatus::new();
        status.set(StatusFlag::SessionInitializationThrewException);
        status.set(StatusFlag::ProcessTerminated);

        let snapshot = status.snapshot();
        assert!(status.has_exception());
        assert_eq!(
            snapshot.to_string(),
            "[SESSION_INITIALIZATION_THREW_EXCEPTION, PROCESS_TERMINATING, PROCESS_TERMINATED]"
        );
        assert_eq!(snapshot.flags().count(), 3);
    }
}
