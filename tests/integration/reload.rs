#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use common::{
    Harness, config_with, is_process_alive, shell_service, wait_for_lines,
    wait_for_process_exit, wait_until,
};
use toolboxd::{
    config::ServiceTypeConfig,
    process::{OutputSinks, SpawnSpec},
    registry::Action,
    service::{ServiceKey, ServiceType},
};

fn singleton(script: String, live_reload: Option<bool>) -> ServiceTypeConfig {
    let mut config = shell_service(&script, &[]);
    config.live_reload = live_reload;
    config
        .settings
        .insert("listen".into(), serde_json::Value::from(":8443"));
    config
}

#[test]
fn live_reload_keeps_the_process() {
    let harness = Harness::new(config_with(vec![]));
    let marker = harness.dir().join("commands.log");
    let script = format!(
        "while read line; do echo \"$line\" >> {}; done",
        marker.display()
    );
    harness
        .store
        .update(|config| {
            config
                .services
                .insert(ServiceType::WebFront, singleton(script, None));
        })
        .unwrap();

    harness
        .registry
        .apply(Action::Start, Some("webfront"), &OutputSinks::default())
        .unwrap();
    let key = ServiceKey::singleton(ServiceType::WebFront);
    let pid = harness.table.pid(&key).unwrap();
    assert!(harness.table.has_pipe(&key));

    harness
        .store
        .update(|config| {
            let webfront = config.services.get_mut(&ServiceType::WebFront).unwrap();
            webfront
                .settings
                .insert("listen".into(), serde_json::Value::from(":9443"));
        })
        .unwrap();
    harness
        .registry
        .apply(Action::Reload, Some("webfront"), &OutputSinks::default())
        .unwrap();

    assert_eq!(wait_for_lines(&marker, 1), vec!["reload"]);
    assert_eq!(harness.table.pid(&key), Some(pid));
    let written = fs::read_to_string(harness.conf_file("webfront.json")).unwrap();
    assert!(written.contains(":9443"));
}

#[test]
fn reload_without_pipe_restarts() {
    let harness = Harness::new(config_with(vec![(
        ServiceType::FtpServer,
        singleton("sleep 30".into(), None),
    )]));
    let adapter = harness.registry.adapter(ServiceType::FtpServer).unwrap();
    assert!(!adapter.supports_live_reload());

    adapter.start(&OutputSinks::default()).unwrap();
    let key = ServiceKey::singleton(ServiceType::FtpServer);
    let before = harness.table.pid(&key).unwrap();
    assert!(!harness.table.has_pipe(&key));

    adapter.reload_instance(None).unwrap();
    let after = harness.table.pid(&key).unwrap();
    assert_ne!(before, after);
    wait_for_process_exit(before);
    assert!(is_process_alive(after));
}

#[test]
fn live_reload_can_be_switched_off_per_type() {
    let mut clients = shell_service("sleep 30", &[3]);
    clients.live_reload = Some(false);
    let harness = Harness::new(config_with(vec![(ServiceType::FrpClient, clients)]));
    let adapter = harness.registry.adapter(ServiceType::FrpClient).unwrap();
    assert!(!adapter.supports_live_reload());

    adapter.start(&OutputSinks::default()).unwrap();
    let key = ServiceKey::instance(ServiceType::FrpClient, 3);
    let before = harness.table.pid(&key).unwrap();

    adapter.reload().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        harness.table.pid(&key).is_some_and(|pid| pid != before)
    }));
    wait_for_process_exit(before);
}

#[test]
fn reload_waits_for_an_operation_in_flight() {
    let harness = Harness::new(config_with(vec![]));
    let marker = harness.dir().join("commands.log");
    let script = format!(
        "while read line; do echo \"$line $$\" >> {}; done",
        marker.display()
    );
    let service = singleton(script.clone(), Some(true));
    harness
        .store
        .update(|config| {
            config.services.insert(ServiceType::WebFront, service);
        })
        .unwrap();
    harness
        .registry
        .apply(Action::Start, Some("webfront"), &OutputSinks::default())
        .unwrap();
    let key = ServiceKey::singleton(ServiceType::WebFront);
    let old = harness.table.pid(&key).unwrap();

    let lock = harness.table.op_lock(&key).unwrap();
    let guard = lock.lock().unwrap();
    let adapter = harness.registry.adapter(ServiceType::WebFront).unwrap();
    let reloader = thread::spawn(move || adapter.reload_instance(None));
    thread::sleep(Duration::from_millis(300));
    assert!(!reloader.is_finished());

    harness.table.stop(&key).unwrap();
    let spec = SpawnSpec::new("webfront", "sh")
        .args(["-c", script.as_str()])
        .stdin_pipe(true);
    let new = harness.table.spawn(key, spec).unwrap();
    drop(guard);
    reloader.join().unwrap().unwrap();

    assert_eq!(wait_for_lines(&marker, 1), vec![format!("reload {new}")]);
    assert_eq!(harness.table.pid(&key), Some(new));
    assert!(!is_process_alive(old));
}
