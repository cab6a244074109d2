//! End-to-end cycle loop tests against scripted relay and device doubles.
//!
//! All tests run on a paused clock, so multi-second cycles finish instantly.

mod common;

use std::time::Duration;

use common::{Event, FakeDevice, RecordingRelayLink, Rig, OFF, ON};
use relay_soak::cycle::{CycleController, SuccessMode};
use relay_soak::rules::RuleCategory;
use relay_soak::shutdown::{StopKind, StopState};

const PARAM_INVALID: &str = "[E/app] param is invalid";
const BOOT_MARKER: &str = "motor power on";

fn controller(rig: &Rig, cycles: u32, device: FakeDevice) -> CycleController<FakeDevice> {
    CycleController::new(
        common::quick_cycles(cycles),
        common::default_rules(),
        rig.relay.clone(),
        device,
        rig.stats.clone(),
        rig.stop.clone(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_error_burst_aborts_first_cycle() {
    let rig = Rig::new();
    let script = vec![vec![
        Event::line(0.5, PARAM_INVALID),
        Event::line(1.2, PARAM_INVALID),
        Event::line(2.0, PARAM_INVALID),
    ]];
    let mut ctl = controller(&rig, 5, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Abort);
    assert_eq!(outcome.exit_code(), 1);
    let burst = outcome.burst.expect("burst report");
    assert_eq!(burst.category, RuleCategory::Error);
    assert_eq!(burst.pattern, "param is invalid");
    assert_eq!(burst.count, 3);
    assert_eq!(burst.window, Duration::from_secs(3));

    let session = rig.stats.session();
    assert_eq!(session.total, 1);
    assert_eq!(session.success, 0);
    assert!(session.aborted);

    let log = rig.bench.lock();
    assert_eq!(log.power_ons(), 1, "no cycle may start after the abort");
    assert_eq!(log.last_command(), Some(vec![OFF]));
    assert!(log.device_closed);
    assert!(log.relay_closed);
}

#[tokio::test(start_paused = true)]
async fn test_critical_burst_beats_error_rules() {
    let rig = Rig::new();
    let critical = "[E/motor] reg_addr(00) is unviald";
    let script = vec![(0..5).map(|i| Event::line(0.1 + 0.1 * i as f64, critical)).collect()];
    let mut ctl = controller(&rig, 3, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    let burst = outcome.burst.expect("burst report");
    assert_eq!(burst.category, RuleCategory::Critical);
    assert_eq!(burst.count, 3);
    assert_eq!(burst.window, Duration::from_secs(1));
    assert_eq!(rig.stop.state(), StopState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_critical_hits_spread_over_window_do_not_abort() {
    let rig = Rig::new();
    let critical = "[E/motor] reg_addr(00) is unviald";
    // Three hits, but never three inside one second.
    let script = vec![vec![
        Event::line(0.1, critical),
        Event::line(0.7, critical),
        Event::line(1.3, critical),
    ]];
    let mut ctl = controller(&rig, 1, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    assert!(outcome.burst.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_spaced_errors_never_abort() {
    let rig = Rig::new();
    // One match per cycle: windows are cleared at every power-on.
    let script = (0..5).map(|_| vec![Event::line(0.5, PARAM_INVALID)]).collect();
    let mut ctl = controller(&rig, 5, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.reason, "completed 5 cycles");
    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (5, 0, 5));
    assert!(!session.aborted);
    assert_eq!(rig.bench.lock().power_ons(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_boot_markers_count_as_success() {
    let rig = Rig::new();
    let script = (0..3)
        .map(|_| vec![Event::line(0.3, BOOT_MARKER), Event::line(1.4, "power_off_system")])
        .collect();
    let mut ctl = controller(&rig, 3, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (3, 3, 0));
    assert!(outcome.summary.contains("success_rate=3/3 (100.0%)"));
}

#[tokio::test(start_paused = true)]
async fn test_all_mode_requires_every_marker() {
    let rig = Rig::new();
    let script = vec![
        vec![Event::line(0.3, BOOT_MARKER)],
        vec![
            Event::line(0.3, BOOT_MARKER),
            Event::line(0.6, "pm_acc_tim=12"),
            Event::line(1.4, "power_off_system"),
        ],
    ];
    let mut config = common::quick_cycles(2);
    config.success_mode = SuccessMode::All;
    let mut ctl = CycleController::new(
        config,
        common::default_rules(),
        rig.relay.clone(),
        FakeDevice::new(rig.bench.clone(), script),
        rig.stats.clone(),
        rig.stop.clone(),
    );

    ctl.run().await;

    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (2, 1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_exceptions_are_tallied_without_abort() {
    let rig = Rig::new();
    let script = vec![vec![
        Event::line(0.2, "assertion failed at function foo"),
        Event::line(0.4, "assertion failed at function bar"),
        Event::line(0.6, BOOT_MARKER),
    ]];
    let mut ctl = controller(&rig, 1, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!(session.exception_count, 2);
    assert_eq!(session.success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_cycle_and_loop_continues() {
    let rig = Rig::new();
    let script = vec![
        vec![Event::Disconnect(0.4), Event::line(0.6, BOOT_MARKER)],
        vec![Event::line(0.3, BOOT_MARKER)],
    ];
    let mut ctl = controller(&rig, 2, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (2, 1, 1));
    assert_eq!(session.disconnect_count, 1);
    assert_eq!(rig.bench.lock().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_aborts() {
    let rig = Rig::new();
    let script = vec![vec![Event::Disconnect(0.3)]];
    let device = FakeDevice::new(rig.bench.clone(), script).with_reconnects(&[false, false]);
    let mut ctl = controller(&rig, 10, device).with_reconnect_budget(2);

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Abort);
    assert!(outcome.burst.is_none());
    assert!(outcome.reason.contains("reconnect failed 2 times"), "{}", outcome.reason);

    let session = rig.stats.session();
    assert_eq!(session.total, 2);
    assert_eq!(session.success, 0);
    assert!(session.aborted);

    let log = rig.bench.lock();
    assert_eq!(log.reconnects, 2);
    assert_eq!(log.power_ons(), 1, "second cycle aborts before power-on");
    assert_eq!(log.last_command(), Some(vec![OFF]));
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_keeps_power_cadence() {
    let rig = Rig::new();
    let script = vec![vec![Event::Disconnect(0.2)], vec![Event::line(0.3, BOOT_MARKER)]];
    let device = FakeDevice::new(rig.bench.clone(), script).with_reconnects(&[false, true]);
    let mut ctl = controller(&rig, 2, device);

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!((session.total, session.success), (2, 1));

    // The first cycle still held power for its full on-time.
    let log = rig.bench.lock();
    let on = log.commands[1].0;
    let off = log.commands[2].0;
    assert_eq!(log.commands[1].1, vec![ON]);
    assert_eq!(log.commands[2].1, vec![OFF]);
    let held = off - on;
    assert!(held >= Duration::from_secs(1) && held < Duration::from_millis(1_050), "{held:?}");
}

#[tokio::test(start_paused = true)]
async fn test_user_interrupt_stops_cleanly() {
    let rig = Rig::new();
    let mut ctl = controller(&rig, 0, FakeDevice::new(rig.bench.clone(), Vec::new()));
    let stop = rig.stop.clone();

    // Cycle 1 spans 0.0-2.5s (on, drain), off until 3.0s; cycle 2 is mid-monitoring at 3.5s.
    let (outcome, ()) = tokio::join!(ctl.run(), async move {
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        stop.request_stop();
    });

    assert_eq!(outcome.kind, StopKind::Shutdown);
    assert_eq!(outcome.reason, "interrupted by user");
    assert!(outcome.relay_released);

    let session = rig.stats.session();
    assert_eq!(session.total, 1, "the interrupted cycle is not counted");
    assert!(!session.aborted);

    let log = rig.bench.lock();
    assert_eq!(log.power_ons(), 2);
    assert_eq!(log.last_command(), Some(vec![OFF]));
    assert!(log.device_closed);
}

#[tokio::test(start_paused = true)]
async fn test_relay_power_on_failure_fails_cycle() {
    let bench = common::bench();
    // Write 1 is the initial release, write 2 the first power-on.
    let rig = Rig::with_link(bench.clone(), RecordingRelayLink::new(bench).failing(&[2]));
    let script = vec![vec![Event::line(0.3, BOOT_MARKER)], vec![Event::line(0.3, BOOT_MARKER)]];
    let mut ctl = controller(&rig, 2, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (2, 1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_unreleasable_relay_aborts() {
    let bench = common::bench();
    let rig = Rig::with_link(bench.clone(), RecordingRelayLink::new(bench).failing(&[1, 2, 3]));
    let mut ctl = controller(&rig, 2, FakeDevice::new(rig.bench.clone(), Vec::new()));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Abort);
    assert!(outcome.reason.contains("relay"), "{}", outcome.reason);
    assert_eq!(rig.bench.lock().power_ons(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lines_are_persisted_to_memory_logs() {
    let rig = Rig::new();
    let script = vec![vec![Event::line(0.3, BOOT_MARKER), Event::line(0.5, PARAM_INVALID)]];
    let mut ctl = controller(&rig, 1, FakeDevice::new(rig.bench.clone(), script));

    ctl.run().await;

    let logs = rig.stats.retained();
    assert!(logs.full.iter().any(|l| l.contains("[SUCCESS] motor power on")));
    assert!(logs.error.iter().any(|l| l.contains("param is invalid")));
    assert_eq!(logs.raw.len(), 2);
    assert!(logs.full.iter().any(|l| l.contains("summary: total=1")));
}

#[tokio::test(start_paused = true)]
async fn test_output_from_off_period_does_not_count_for_next_cycle() {
    let rig = Rig::new();
    // Cycle 1 drains until 2.5 s; its late shutdown line lands in the off pause.
    let script = vec![
        vec![Event::line(0.3, BOOT_MARKER), Event::line(2.7, "power_off_system")],
        Vec::new(),
    ];
    let mut ctl = controller(&rig, 2, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (2, 1, 1));

    let logs = rig.stats.retained();
    assert!(logs.full.iter().any(|l| l.contains("received while powered off")));
    assert!(!logs.full.iter().any(|l| l.contains("[SUCCESS] power_off_system")));
}

#[tokio::test(start_paused = true)]
async fn test_logs_flush_during_long_cycle() {
    let rig = Rig::flushing_every(Duration::from_secs(1));
    let script = vec![vec![Event::line(0.5, BOOT_MARKER)]];
    let mut config = common::quick_cycles(1);
    config.on_min_secs = 5.0;
    config.on_max_secs = 5.0;
    let mut ctl = CycleController::new(
        config,
        common::default_rules(),
        rig.relay.clone(),
        FakeDevice::new(rig.bench.clone(), script),
        rig.stats.clone(),
        rig.stop.clone(),
    );
    let stats = rig.stats.clone();

    let (_, flushed_mid_cycle) = tokio::join!(ctl.run(), async move {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        stats.retained().full.iter().any(|l| l.contains("motor power on"))
    });

    assert!(flushed_mid_cycle, "entries reach the sink while the DUT is still powered");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_draining_fails_cycle() {
    let rig = Rig::new();
    // Power is cut at 1.0 s; the port drops during the drain.
    let script = vec![
        vec![Event::line(0.3, BOOT_MARKER), Event::Disconnect(1.8)],
        vec![Event::line(0.3, BOOT_MARKER)],
    ];
    let mut ctl = controller(&rig, 2, FakeDevice::new(rig.bench.clone(), script));

    let outcome = ctl.run().await;

    assert_eq!(outcome.kind, StopKind::Shutdown);
    let session = rig.stats.session();
    assert_eq!((session.total, session.success, session.failure), (2, 1, 1));
    assert_eq!(session.disconnect_count, 1);

    let log = rig.bench.lock();
    assert_eq!(log.reconnects, 1);
    assert_eq!(log.power_ons(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_monitoring_cuts_power_early() {
    let rig = Rig::new();
    let mut config = common::quick_cycles(1);
    config.on_min_secs = 5.0;
    config.on_max_secs = 5.0;
    let mut ctl = CycleController::new(
        config,
        common::default_rules(),
        rig.relay.clone(),
        FakeDevice::new(rig.bench.clone(), Vec::new()),
        rig.stats.clone(),
        rig.stop.clone(),
    );
    let stop = rig.stop.clone();

    let (outcome, ()) = tokio::join!(ctl.run(), async move {
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        stop.request_stop();
    });

    assert_eq!(outcome.reason, "interrupted by user");
    let log = rig.bench.lock();
    let on = log.commands.iter().find(|(_, c)| c == &vec![ON]).map(|(at, _)| *at).unwrap();
    let off = log.commands.iter().rev().find(|(_, c)| c == &vec![OFF]).map(|(at, _)| *at).unwrap();
    assert!(off - on < Duration::from_millis(1_100), "power held {:?}", off - on);
}
