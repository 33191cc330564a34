#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{Harness, config_with, shell_service, wait_for_lines, wait_until};
use toolboxd::{
    process::OutputSinks,
    registry::Action,
    service::{ServiceKey, ServiceType},
    watcher::{ConfigReconciler, ConfigWatcher, Reconciled},
};

fn reconciler(harness: &Harness) -> ConfigReconciler {
    ConfigReconciler::new(harness.registry.clone(), harness.instances.clone())
}

#[test]
fn edited_file_reaches_the_restarted_instance() {
    let harness = Harness::new(config_with(vec![]));
    let seen = harness.dir().join("seen.toml");
    let servers = shell_service(
        &format!("cp '{{config}}' '{}'; exec sleep 30", seen.display()),
        &[1, 2],
    );
    harness
        .store
        .update(|config| {
            config.services.insert(ServiceType::FrpServer, servers);
        })
        .unwrap();
    harness
        .registry
        .apply(Action::Start, Some("frpserver"), &OutputSinks::default())
        .unwrap();
    let one = ServiceKey::instance(ServiceType::FrpServer, 1);
    let two = ServiceKey::instance(ServiceType::FrpServer, 2);
    let before_one = harness.table.pid(&one).unwrap();
    let before_two = harness.table.pid(&two).unwrap();

    let _watcher = ConfigWatcher::with_debounce(reconciler(&harness), Duration::from_millis(100))
        .unwrap();
    fs::write(harness.conf_file("frpserver/1.toml"), "bindPort = 9999\n").unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        harness.table.pid(&one).is_some_and(|pid| pid != before_one)
    }));
    // The new process starts from the edited file, which is left as written.
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(&seen).is_ok_and(|content| content.contains("9999"))
    }));
    assert_eq!(
        fs::read_to_string(harness.conf_file("frpserver/1.toml")).unwrap(),
        "bindPort = 9999\n"
    );

    // Applying the edit must not trigger another restart.
    let after_one = harness.table.pid(&one).unwrap();
    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(harness.table.pid(&one), Some(after_one));
    assert_eq!(harness.table.pid(&two), Some(before_two));
}

#[test]
fn events_for_stopped_or_foreign_files_are_ignored() {
    let harness = Harness::new(config_with(vec![(
        ServiceType::FrpClient,
        shell_service("sleep 30", &[4]),
    )]));
    let reconciler = reconciler(&harness);

    let key = ServiceKey::instance(ServiceType::FrpClient, 4);
    let path = harness
        .instances
        .write(&key, &serde_json::Map::new(), &serde_json::Map::new())
        .unwrap();
    assert_eq!(reconciler.handle_path(&path), Reconciled::NotRunning(key));

    let notes = harness.conf_file("frpclient/notes.txt");
    fs::write(&notes, "not a config").unwrap();
    assert_eq!(reconciler.handle_path(&notes), Reconciled::Ignored);

    let stray = harness.conf_file("frpclient/backup.toml");
    fs::write(&stray, "x = 1\n").unwrap();
    assert_eq!(reconciler.handle_path(&stray), Reconciled::Ignored);
}

#[test]
fn unchanged_content_is_skipped() {
    let harness = Harness::new(config_with(vec![(
        ServiceType::FrpServer,
        shell_service("sleep 30", &[1]),
    )]));
    harness
        .registry
        .apply(Action::Start, Some("frpserver.1"), &OutputSinks::default())
        .unwrap();
    let key = ServiceKey::instance(ServiceType::FrpServer, 1);
    let pid = harness.table.pid(&key).unwrap();

    let path = harness.conf_file("frpserver/1.toml");
    assert_eq!(reconciler(&harness).handle_path(&path), Reconciled::Unchanged(key));
    assert_eq!(harness.table.pid(&key), Some(pid));
}

#[test]
fn live_reload_types_get_a_reload_token() {
    let harness = Harness::new(config_with(vec![]));
    let marker = harness.dir().join("tokens.log");
    let mut clients = shell_service(
        &format!("while read line; do echo \"$line\" >> {}; done", marker.display()),
        &[2],
    );
    clients.live_reload = Some(true);
    harness
        .store
        .update(|config| {
            config.services.insert(ServiceType::FrpClient, clients);
        })
        .unwrap();
    harness
        .registry
        .apply(Action::Start, Some("frpclient.2"), &OutputSinks::default())
        .unwrap();
    let key = ServiceKey::instance(ServiceType::FrpClient, 2);
    let pid = harness.table.pid(&key).unwrap();

    let path = harness.conf_file("frpclient/2.toml");
    fs::write(&path, "serverAddr = \"10.0.0.2\"\n").unwrap();
    assert_eq!(reconciler(&harness).handle_path(&path), Reconciled::Reloaded(key));

    assert_eq!(wait_for_lines(&marker, 1), vec!["reload"]);
    assert_eq!(harness.table.pid(&key), Some(pid));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "serverAddr = \"10.0.0.2\"\n"
    );
}
