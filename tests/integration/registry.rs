#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc, thread, time::Duration};

use common::{
    Harness, config_with, is_process_alive, shell_service, wait_for_process_exit, wait_until,
};
use toolboxd::{
    error::ServiceError,
    process::{OutputSinks, SpawnSpec},
    registry::Action,
    service::{ServiceKey, ServiceType},
};

fn frp_harness() -> Harness {
    Harness::new(config_with(vec![
        (ServiceType::FrpServer, shell_service("sleep 30", &[1, 2])),
        (ServiceType::FrpClient, shell_service("sleep 30", &[1])),
    ]))
}

fn pid_of(harness: &Harness, key: &str) -> u32 {
    let key: ServiceKey = key.parse().unwrap();
    harness
        .table
        .pid(&key)
        .unwrap_or_else(|| panic!("'{key}' is not running"))
}

#[test]
fn group_stop_and_start_by_prefix() {
    let harness = frp_harness();
    harness
        .registry
        .apply(Action::Start, None, &OutputSinks::default())
        .unwrap();

    let server_one = pid_of(&harness, "frpserver.1");
    let server_two = pid_of(&harness, "frpserver.2");
    let client = pid_of(&harness, "frpclient.1");
    assert!(harness.conf_file("frpserver/1.toml").exists());
    assert!(harness.conf_file("frpserver/2.toml").exists());
    assert!(harness.pid_file("frpserver/1.pid").exists());

    let stopped = harness.registry.stop_group("frpserver.").unwrap();
    assert_eq!(stopped, 2);
    wait_for_process_exit(server_one);
    wait_for_process_exit(server_two);
    assert!(!harness.pid_file("frpserver/1.pid").exists());
    assert!(!harness.pid_file("frpserver/2.pid").exists());

    // Clients share the `frp` prefix but not `frpserver.`.
    assert!(is_process_alive(client));
    assert_eq!(pid_of(&harness, "frpclient.1"), client);

    harness
        .registry
        .start_group("frpserver.", &OutputSinks::default())
        .unwrap();
    let restarted_one = pid_of(&harness, "frpserver.1");
    let restarted_two = pid_of(&harness, "frpserver.2");
    assert_ne!(restarted_one, server_one);
    assert_ne!(restarted_two, server_two);
    assert!(is_process_alive(restarted_one));
    assert!(is_process_alive(restarted_two));
}

#[test]
fn at_most_one_process_per_key() {
    let harness = frp_harness();
    let adapter = harness.registry.adapter(ServiceType::FrpServer).unwrap();

    adapter
        .start_instance(Some(1), &OutputSinks::default())
        .unwrap();
    let first = pid_of(&harness, "frpserver.1");

    adapter
        .start_instance(Some(1), &OutputSinks::default())
        .unwrap();
    let second = pid_of(&harness, "frpserver.1");
    assert_ne!(first, second);
    wait_for_process_exit(first);
    assert!(is_process_alive(second));

    let key = ServiceKey::instance(ServiceType::FrpServer, 1);
    let spec = SpawnSpec::new("frpserver.1", "sleep").args(["30"]);
    match harness.table.spawn(key, spec) {
        Err(ServiceError::AlreadyRunning { pid, .. }) => assert_eq!(pid, second),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    assert_eq!(harness.table.snapshot().unwrap().len(), 1);
}

#[test]
fn interleaved_operations_keep_one_process_per_key() {
    let harness = Harness::new(config_with(vec![]));
    let log = harness.dir().join("pids.log");
    let script = format!(
        "echo $$ >> '{}'; while read line; do :; done",
        log.display()
    );
    harness
        .store
        .update(|config| {
            let mut client = shell_service(&script, &[1]);
            client.live_reload = Some(true);
            config.services.insert(ServiceType::FrpClient, client);
        })
        .unwrap();
    let adapter = harness.registry.adapter(ServiceType::FrpClient).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let adapter = Arc::clone(&adapter);
            thread::spawn(move || {
                let sinks = OutputSinks::default();
                for round in 0..5 {
                    let result = match (worker + round) % 4 {
                        0 => adapter.restart_instance(Some(1), &sinks),
                        1 => adapter.reload_instance(Some(1)),
                        2 => adapter.reconcile_instance(Some(1)).map(|_| ()),
                        _ => adapter.start_instance(Some(1), &sinks),
                    };
                    result.unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let key = ServiceKey::instance(ServiceType::FrpClient, 1);
    let live = pid_of(&harness, "frpclient.1");
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(&log)
            .map(|content| content.lines().any(|line| line == live.to_string()))
            .unwrap_or(false)
    }));
    let survivors: Vec<u32> = fs::read_to_string(&log)
        .unwrap()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .filter(|pid| is_process_alive(*pid))
        .collect();
    assert_eq!(survivors, vec![live]);
    assert_eq!(harness.table.snapshot().unwrap(), vec![(key, live)]);
    let recorded = fs::read_to_string(harness.pid_file("frpclient/1.pid")).unwrap();
    assert_eq!(recorded.trim(), live.to_string());
}

#[test]
fn disabled_rows_lose_their_files_and_processes() {
    let harness = frp_harness();
    harness
        .registry
        .apply(Action::Start, Some("frpserver"), &OutputSinks::default())
        .unwrap();
    let disabled_pid = pid_of(&harness, "frpserver.2");

    harness
        .store
        .update(|config| {
            let servers = config.services.get_mut(&ServiceType::FrpServer).unwrap();
            servers.instances[1].disabled = true;
        })
        .unwrap();
    harness
        .registry
        .apply(Action::Restart, Some("frpserver"), &OutputSinks::default())
        .unwrap();

    wait_for_process_exit(disabled_pid);
    assert!(!harness.conf_file("frpserver/2.toml").exists());
    assert!(harness.conf_file("frpserver/1.toml").exists());

    let keys: Vec<String> = harness
        .registry
        .status()
        .into_iter()
        .filter(|entry| entry.key.service == ServiceType::FrpServer)
        .map(|entry| entry.key.to_string())
        .collect();
    assert_eq!(keys, vec!["frpserver.1"]);
}

#[test]
fn unexpected_exit_clears_the_table_entry() {
    let harness = Harness::new(config_with(vec![(
        ServiceType::FrpServer,
        shell_service("sleep 0.2", &[5]),
    )]));
    harness
        .registry
        .apply(Action::Start, Some("frpserver.5"), &OutputSinks::default())
        .unwrap();

    let key: ServiceKey = "frpserver.5".parse().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !harness
        .table
        .is_running(&key)));
    assert!(wait_until(Duration::from_secs(2), || !harness
        .pid_file("frpserver/5.pid")
        .exists()));
}
