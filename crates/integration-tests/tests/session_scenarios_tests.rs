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

//! End-to-end debug session scenarios against the scripted debug API

use std::time::Duration;

use eyre::Result;
use sdb_common::types::{Backtrace, BreakpointId, DbError, LineBreakpoint, RuntimeInfo};
use sdb_engine::{
    test_utils::{ScriptedDebugApi, REASON_EXIT},
    ConnectionRole, DebugError, DebuggerConfig, SessionRegistry, StatusFlag,
};
use sdb_integration_tests::test_utils::{at, SessionFixture, TargetBehavior};
use tracing::info;

/// Fixture whose first suspension is PAYROLL:3
async fn suspended(api: ScriptedDebugApi) -> Result<SessionFixture> {
    api.push_steps([at("PAYROLL", 1), at("PAYROLL", 3)]);
    let fixture = SessionFixture::builder(api).build()?;
    fixture.start().await?;
    Ok(fixture)
}

fn assert_released_once(fixture: &SessionFixture) -> Result<()> {
    for role in [ConnectionRole::Target, ConnectionRole::Debugger] {
        assert_eq!(fixture.connection(role)?.close_count(), 1, "{role} connection");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_target_completes_without_error() -> Result<()> {
    info!("Testing a session whose target program runs to completion");

    let api = ScriptedDebugApi::new();
    api.push_steps([at("PAYROLL", 1), at("PAYROLL", 3)]);
    let fixture = SessionFixture::builder(api).target(TargetBehavior::Completes).build()?;

    fixture.session.start()?;
    fixture.wait_terminated().await?;
    fixture.wait_for(StatusFlag::TargetExecutionTerminated).await?;

    let status = fixture.session.status();
    assert!(status.contains(StatusFlag::ProcessTerminated));
    assert!(status.contains(StatusFlag::TargetExecutionStarted));
    assert!(!status.contains_any(&[
        StatusFlag::SessionInitializationThrewException,
        StatusFlag::TargetExecutionThrewException,
    ]));
    assert!(!fixture.session.is_execution_cancelled());
    assert_eq!(fixture.trigger.executions(), 1);

    assert_released_once(&fixture)?;
    assert_eq!(fixture.sink.terminations().len(), 1);
    assert!(fixture.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_initialization_failure_releases_both_connections() -> Result<()> {
    info!("Testing a session whose attach call is rejected");

    let api = ScriptedDebugApi::new();
    api.fail_on("attach_session", DbError::with_code(30677, "session is already connected"));
    let fixture = SessionFixture::builder(api).build()?;

    fixture.session.start()?;
    fixture.wait_terminated().await?;

    let status = fixture.session.status();
    assert!(status.contains(StatusFlag::SessionInitializationThrewException));
    assert!(status.contains(StatusFlag::ProcessTerminated));
    assert!(!status.contains(StatusFlag::TargetExecutionStarted));
    assert_eq!(fixture.trigger.executions(), 0);

    assert_released_once(&fixture)?;
    assert_eq!(fixture.api.call_count("disable_debugging"), 1);
    assert_eq!(fixture.api.call_count("synchronize_session"), 0);

    let failures = fixture.sink.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "initialize");
    assert!(failures[0].1.contains("attach_session failed"));

    let notice = &fixture.sink.terminations()[0];
    assert!(notice.cancelled);
    assert!(notice.reason.contains("session is already connected"));
    Ok(())
}

#[tokio::test]
async fn test_unavailable_target_connection() -> Result<()> {
    info!("Testing a session that cannot open its target connection");

    let fixture = SessionFixture::builder(ScriptedDebugApi::new()).build()?;
    fixture
        .provider
        .fail_connection(ConnectionRole::Target, DbError::with_code(12541, "no listener"));

    fixture.session.start()?;
    fixture.wait_terminated().await?;

    let status = fixture.session.status();
    assert!(status.contains(StatusFlag::SessionInitializationThrewException));
    assert!(status.contains(StatusFlag::ProcessTerminated));
    assert!(fixture.provider.opened().is_empty());
    assert!(fixture.api.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_step_to_same_location_is_surfaced() -> Result<()> {
    info!("Testing a step that lands on the position already shown");

    let fixture = suspended(ScriptedDebugApi::new()).await?;
    fixture.api.push_step(at("PAYROLL", 3));

    fixture.session.step_over()?.await?;

    let positions = fixture.sink.positions();
    assert_eq!(positions.len(), 2);
    assert_eq!(positions[1].runtime, at("PAYROLL", 3));
    assert_eq!(positions[1].skipped, 0);
    assert_eq!(fixture.api.call_count("resume_execution"), 0);
    assert!(!fixture.session.status().is_stopping());
    Ok(())
}

#[tokio::test]
async fn test_hidden_frame_resumes_to_outer_frame() -> Result<()> {
    info!("Testing a step into an internal block that the call stack does not show");

    let fixture = suspended(ScriptedDebugApi::new()).await?;
    let outer = Backtrace::new(vec![at("PAYROLL", 4), at("RUNNER", 1)]);
    fixture.api.push_step(RuntimeInfo::at(Some("SYS"), "DBMS_OUTPUT", 40));
    fixture.api.push_backtrace(outer.clone());
    fixture.api.push_step(at("PAYROLL", 4));
    fixture.api.push_backtrace(outer);

    fixture.session.step_into()?.await?;

    assert_eq!(fixture.api.call_count("resume_execution"), 1);
    let context = fixture.session.suspend_context().ok_or_else(|| eyre::eyre!("not suspended"))?;
    assert_eq!(context.runtime, at("PAYROLL", 4));
    assert_eq!(context.skipped, 1);
    assert_eq!(context.frames.len(), 2);
    assert_eq!(context.frames[1].display_name(), "RUNNER (line 1)");
    assert_eq!(fixture.session.runtime_info(), Some(at("PAYROLL", 4)));
    Ok(())
}

#[tokio::test]
async fn test_location_skip_limit_is_reported() -> Result<()> {
    info!("Testing a server that never settles on a visible frame");

    let api = ScriptedDebugApi::new();
    api.push_steps([at("PAYROLL", 1), at("PAYROLL", 3)]);
    let fixture = SessionFixture::builder(api)
        .config(DebuggerConfig::default().with_max_location_skips(3))
        .build()?;
    fixture.start().await?;

    fixture.api.endless_stepping(RuntimeInfo::at(Some("SYS"), "DBMS_OUTPUT", 5));
    fixture.api.fixed_backtrace(Backtrace::new(vec![at("PAYROLL", 20)]));
    fixture.session.step_into()?.await?;

    assert_eq!(fixture.api.call_count("resume_execution"), 3);
    let failures = fixture.sink.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "step_into");
    assert!(failures[0].1.contains("3 automatic resumes"));
    assert!(!fixture.session.status().is_stopping());

    // Cancel so teardown does not step out of the endless script.
    if let Some(handle) = fixture.session.cancel() {
        handle.await?;
    }
    assert!(fixture.session.is_terminated());
    assert_eq!(fixture.api.call_count("step_out"), 0);
    Ok(())
}

#[tokio::test]
async fn test_program_end_reported_by_server() -> Result<()> {
    info!("Testing a step that runs off the end of the program");

    let fixture = suspended(ScriptedDebugApi::new()).await?;
    fixture.session.step_over()?.await?;
    fixture.wait_terminated().await?;

    let status = fixture.session.status();
    assert!(status.contains(StatusFlag::ProcessStopped));
    assert!(status.contains(StatusFlag::ProcessTerminated));

    let notice = &fixture.sink.terminations()[0];
    assert_eq!(notice.reason_code, Some(REASON_EXIT));
    assert_eq!(notice.reason, "Program terminated");
    assert!(!notice.cancelled);
    assert!(fixture.sink.console_lines().contains(&"Session terminated: Program terminated".to_string()));
    assert_eq!(fixture.api.call_count("step_out"), 0);
    assert_released_once(&fixture)?;
    Ok(())
}

#[tokio::test]
async fn test_target_failure_stops_session() -> Result<()> {
    info!("Testing a target program that raises an error");

    let api = ScriptedDebugApi::new();
    api.push_steps([at("PAYROLL", 1), at("PAYROLL", 3)]);
    let fixture = SessionFixture::builder(api)
        .target(TargetBehavior::Fails(DbError::with_code(20001, "payroll period is closed")))
        .build()?;

    fixture.session.start()?;
    fixture.wait_terminated().await?;
    fixture.wait_for(StatusFlag::TargetExecutionTerminated).await?;

    let status = fixture.session.status();
    assert!(status.contains(StatusFlag::TargetExecutionThrewException));
    assert!(!status.contains(StatusFlag::SessionInitializationThrewException));
    assert!(fixture.session.is_execution_cancelled());
    assert_eq!(fixture.api.call_count("step_out"), 0);

    let failures = fixture.sink.failures();
    assert!(failures.iter().any(|(op, msg)| op == "run_target" && msg.contains("payroll period is closed")));
    assert_released_once(&fixture)?;
    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent() -> Result<()> {
    info!("Testing concurrent stop requests");

    let fixture = suspended(ScriptedDebugApi::new()).await?;

    let handles: Vec<_> = (0..8).filter_map(|_| fixture.session.stop()).collect();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await?;
    }
    fixture.wait_terminated().await?;
    assert!(fixture.session.stop().is_none());

    assert_eq!(fixture.api.call_count("detach_session"), 1);
    assert_eq!(fixture.api.call_count("stop_execution"), 1);
    assert_eq!(fixture.sink.terminations().len(), 1);
    assert_released_once(&fixture)?;

    let err = fixture.session.step_over().unwrap_err();
    assert!(matches!(err, DebugError::SessionTerminating));
    Ok(())
}

#[tokio::test]
async fn test_terminal_flags_never_clear() -> Result<()> {
    info!("Testing that terminal flags stay set once reached");

    let fixture = suspended(ScriptedDebugApi::new()).await?;
    let before = fixture.session.status();

    if let Some(handle) = fixture.session.stop() {
        handle.await?;
    }
    fixture.wait_for(StatusFlag::TargetExecutionTerminated).await?;
    let after = fixture.session.status();

    for flag in before.flags() {
        if flag != StatusFlag::BreakpointSettingAllowed {
            assert!(after.contains(flag), "{flag} was cleared");
        }
    }
    assert!(!after.contains(StatusFlag::BreakpointSettingAllowed));

    // Nothing issued after termination may revive the session.
    assert!(fixture.session.start().is_err());
    assert!(fixture.session.resume().is_err());
    assert_eq!(fixture.session.add_breakpoint(&LineBreakpoint::new(9, "HR.PAYROLL:2".parse()?)).await?, None);
    let last = fixture.session.status();
    for flag in after.flags() {
        assert!(last.contains(flag), "{flag} was cleared after termination");
    }
    Ok(())
}

#[tokio::test]
async fn test_shared_breakpoint_ids_are_cleared_once() -> Result<()> {
    info!("Testing that breakpoints sharing a server id are removed once");

    let breakpoints: Vec<LineBreakpoint> = [
        (1, "HR.PAYROLL:5"),
        (2, "HR.PAYROLL:6"),
        (3, "HR.PAYROLL@PACKAGE BODY:5"),
        (4, "HR.RUNNER:2"),
    ]
    .into_iter()
    .map(|(key, location)| -> Result<LineBreakpoint> {
        Ok(LineBreakpoint::new(key, location.parse()?))
    })
    .collect::<Result<_>>()?;

    let api = ScriptedDebugApi::new();
    api.assign_breakpoint_id(&breakpoints[0].location, BreakpointId(7));
    api.assign_breakpoint_id(&breakpoints[1].location, BreakpointId(7));
    api.assign_breakpoint_id(&breakpoints[2].location, BreakpointId(7));
    api.assign_breakpoint_id(&breakpoints[3].location, BreakpointId(8));
    api.push_steps([at("PAYROLL", 1), at("PAYROLL", 3)]);

    let fixture = SessionFixture::builder(api).breakpoints(breakpoints).build()?;
    fixture.start().await?;
    assert_eq!(fixture.api.call_count("set_breakpoint"), 4);

    if let Some(handle) = fixture.session.stop() {
        handle.await?;
    }

    let mut removed = fixture.api.removed_breakpoints();
    removed.sort();
    assert_eq!(removed, vec![BreakpointId(7), BreakpointId(8)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_roll_out_is_bounded_by_timeout() -> Result<()> {
    info!("Testing roll-out against a debuggee that never finishes");

    let api = ScriptedDebugApi::new().with_step_delay(Duration::from_secs(1));
    api.push_steps([at("PAYROLL", 1), at("PAYROLL", 3)]);
    api.endless_stepping(at("PAYROLL", 3));
    let fixture = SessionFixture::builder(api)
        .config(DebuggerConfig::default().with_roll_out_timeout(Duration::from_secs(20)))
        .build()?;

    let handle = fixture.session.start()?;
    handle.await?;

    let stopped_at = tokio::time::Instant::now();
    let Some(handle) = fixture.session.stop() else {
        eyre::bail!("stop was not claimed");
    };
    handle.await?;

    let step_outs = fixture.api.call_count("step_out");
    assert!((19..=20).contains(&step_outs), "{step_outs} step outs");
    assert!(stopped_at.elapsed() >= Duration::from_secs(20));
    assert_eq!(fixture.api.call_count("stop_execution"), 1);
    assert!(fixture.session.is_terminated());
    Ok(())
}

#[tokio::test]
async fn test_second_session_on_connection_is_rejected() -> Result<()> {
    info!("Testing the one-session-per-connection rule");

    let registry = SessionRegistry::new();
    let first = SessionFixture::builder(ScriptedDebugApi::new())
        .connection("hr@prod")
        .registry(registry.clone())
        .build()?;

    let second = SessionFixture::builder(ScriptedDebugApi::new())
        .connection("hr@prod")
        .registry(registry.clone())
        .build();
    assert!(second.is_err());
    assert!(registry.check_forbidden_operation(first.session.connection_id()).is_err());

    // A different connection is unaffected.
    let other = SessionFixture::builder(ScriptedDebugApi::new())
        .connection("hr@test")
        .registry(registry.clone())
        .build()?;
    assert_eq!(registry.len(), 2);

    first.session.start()?;
    first.wait_terminated().await?;
    assert!(registry.check_forbidden_operation(first.session.connection_id()).is_ok());
    assert!(registry.is_active(other.session.connection_id()));

    SessionFixture::builder(ScriptedDebugApi::new())
        .connection("hr@prod")
        .registry(registry)
        .build()?;
    Ok(())
}

#[tokio::test]
async fn test_unstarted_session_releases_connection_on_drop() -> Result<()> {
    info!("Testing a session that is built and discarded without starting");

    let registry = SessionRegistry::new();
    let abandoned = SessionFixture::builder(ScriptedDebugApi::new())
        .connection("hr@prod")
        .registry(registry.clone())
        .build()?;
    assert!(registry.is_active(abandoned.session.connection_id()));
    drop(abandoned);

    assert!(registry.is_empty());
    let rebuilt = SessionFixture::builder(ScriptedDebugApi::new())
        .connection("hr@prod")
        .registry(registry.clone())
        .build()?;
    assert!(registry.is_active(rebuilt.session.connection_id()));
    Ok(())
}
