#[path = "common/mod.rs"]
mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{Harness, config_with, is_process_alive, wait_for_process_exit, wait_until};
use toolboxd::{
    config::DaemonDescriptor,
    process::OutputSinks,
    registry::Action,
    respawn::{DaemonEvent, DaemonStatus},
    service::ServiceType,
};

fn record_events(harness: &Harness) -> Arc<Mutex<Vec<DaemonEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    harness
        .respawn
        .add_hook(move |event: &DaemonEvent| sink.lock().unwrap().push(event.clone()));
    events
}

fn statuses(events: &Arc<Mutex<Vec<DaemonEvent>>>, id: u64) -> Vec<DaemonStatus> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.descriptor_id == id)
        .map(|event| event.status)
        .collect()
}

#[test]
fn crashing_daemon_exhausts_its_budget() {
    let mut crasher = DaemonDescriptor::new(4, "crasher", "sh");
    crasher.args = vec!["-c".into(), "exit 3".into()];
    crasher.respawn = 3;
    crasher.backoff = Duration::from_millis(50);

    let mut config = config_with(vec![]);
    config.daemons.push(crasher);
    let harness = Harness::new(config);
    let events = record_events(&harness);

    harness
        .registry
        .apply(Action::Start, Some("daemon.4"), &OutputSinks::default())
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        harness
            .respawn
            .status(4)
            .is_some_and(|state| state.status == DaemonStatus::Exited && state.remaining == 0)
    }));
    // Hooks are dispatched asynchronously; wait for the final event.
    assert!(wait_until(Duration::from_secs(2), || {
        statuses(&events, 4).last() == Some(&DaemonStatus::Exited)
            && statuses(&events, 4)
                .iter()
                .filter(|status| **status == DaemonStatus::Restarted)
                .count()
                == 3
    }));

    let seen = statuses(&events, 4);
    assert_eq!(seen.first(), Some(&DaemonStatus::Started));
    let state = harness.respawn.status(4).unwrap();
    assert_eq!(state.last_error.as_deref(), Some("exited with exit code 3"));
    assert_eq!(state.pid, None);
}

#[test]
fn operator_stop_does_not_respawn() {
    let mut sleeper = DaemonDescriptor::new(9, "sleeper", "sleep");
    sleeper.args = vec!["30".into()];
    sleeper.respawn = 5;

    let mut config = config_with(vec![]);
    config.daemons.push(sleeper);
    let harness = Harness::new(config);
    let events = record_events(&harness);

    let adapter = harness.registry.adapter(ServiceType::Daemon).unwrap();
    adapter.start(&OutputSinks::default()).unwrap();
    assert!(harness.respawn.wait_for(9, DaemonStatus::Running, Duration::from_secs(5)));
    let pid = harness.respawn.status(9).and_then(|state| state.pid).unwrap();
    assert!(is_process_alive(pid));
    assert!(adapter.is_running(Some(9)));

    adapter.stop_instance(Some(9)).unwrap();
    wait_for_process_exit(pid);
    assert!(harness.respawn.wait_for(9, DaemonStatus::Stopped, Duration::from_secs(5)));

    std::thread::sleep(Duration::from_millis(300));
    let state = harness.respawn.status(9).unwrap();
    assert_eq!(state.status, DaemonStatus::Stopped);
    assert_eq!(state.remaining, 5);
    assert!(!statuses(&events, 9).contains(&DaemonStatus::Restarted));
}

#[test]
fn disabled_descriptors_are_not_started() {
    let mut disabled = DaemonDescriptor::new(2, "off", "sleep");
    disabled.args = vec!["30".into()];
    disabled.disabled = true;

    let mut config = config_with(vec![]);
    config.daemons.push(disabled);
    let harness = Harness::new(config);

    harness
        .registry
        .apply(Action::Start, Some("daemon"), &OutputSinks::default())
        .unwrap();
    assert!(harness.respawn.status(2).is_none());
    assert!(
        harness
            .registry
            .apply(Action::Start, Some("daemon.2"), &OutputSinks::default())
            .is_err()
    );
}
