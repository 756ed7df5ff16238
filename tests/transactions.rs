// tests/transactions.rs

//! End-to-end transaction tests against a daemon on a temporary socket.

mod common;

use common::{TestDaemon, recording_script, wait_for};
use pkgworker::transaction::{PackageMap, Property};
use pkgworker::{
    Capabilities, Error, ExitStatus, MirrorEvent, PackageAction, Role, Status, TransactionRequest,
};
use std::time::Duration;

fn commit_request(packages: &[(&str, PackageAction)]) -> TransactionRequest {
    let map: PackageMap = packages
        .iter()
        .map(|(name, action)| (name.to_string(), *action))
        .collect();
    TransactionRequest::new(Role::CommitChanges).with_packages(map)
}

/// Follow a transaction until it finishes, returning every event seen
fn follow_to_end(daemon: &TestDaemon, id: &str) -> Vec<MirrorEvent> {
    let subscription = daemon.client().subscribe(id).unwrap();
    let mut events = Vec::new();
    for event in subscription {
        let done = matches!(event, MirrorEvent::Finished(_) | MirrorEvent::WorkerDisappeared);
        events.push(event);
        if done {
            break;
        }
    }
    events
}

#[test]
fn test_health() {
    let daemon = TestDaemon::start(|_| "exit 0".to_string(), Duration::from_secs(5));
    let health = daemon.client().health().unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.pid, std::process::id());
    assert_eq!(health.active, None);
    assert_eq!(health.queued, 0);
}

#[test]
fn test_health_counts_open_streams() {
    let daemon = TestDaemon::start(|_| "exit 0".to_string(), Duration::from_millis(200));
    let client = daemon.client();
    assert_eq!(client.health().unwrap().streams, 0);

    let tx = client.create(&TransactionRequest::new(Role::Empty)).unwrap();
    let subscription = client.subscribe(&tx.id).unwrap();
    assert_eq!(client.health().unwrap().streams, 1);

    client.run(&tx.id).unwrap();
    let events: Vec<MirrorEvent> = subscription.collect();
    assert!(events.contains(&MirrorEvent::Finished(ExitStatus::Success)));

    // The property stream ends with the transaction
    assert!(wait_for(Duration::from_secs(5), || {
        matches!(client.properties(&tx.id), Err(Error::NotFoundError(_)))
    }));
    assert!(wait_for(Duration::from_secs(5), || {
        client.health().unwrap().streams == 0
    }));
}

#[test]
fn test_commit_changes_succeeds() {
    let daemon = TestDaemon::start(
        |dir| recording_script(&dir.join("commits.log"), "0"),
        Duration::from_millis(300),
    );
    let client = daemon.client();

    let request = commit_request(&[("foo", PackageAction::Install), ("bar", PackageAction::Remove)]);
    let tx = client.create(&request).unwrap();
    assert_eq!(tx.status, Status::Setup);
    assert_eq!(tx.role, Role::CommitChanges);

    let subscription = client.subscribe(&tx.id).unwrap();
    client.run(&tx.id).unwrap();

    let mut statuses = Vec::new();
    let mut finished = None;
    let mut subscription = subscription;
    for event in subscription.by_ref() {
        match event {
            MirrorEvent::StatusChanged(status) => statuses.push(status),
            MirrorEvent::Finished(exit) => {
                finished = Some(exit);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(finished, Some(ExitStatus::Success));
    assert_eq!(subscription.mirror().progress(), 100);
    assert!(subscription.mirror().error().is_none());
    assert!(statuses.contains(&Status::Committing));
    assert_eq!(statuses.last(), Some(&Status::Finished));

    let log = std::fs::read_to_string(daemon.path("commits.log")).unwrap();
    assert!(log.contains("install=foo"));
    assert!(log.contains("remove=bar"));

    // Gone once the grace period is over
    assert!(wait_for(Duration::from_secs(5), || {
        matches!(client.properties(&tx.id), Err(Error::NotFoundError(_)))
    }));
}

#[test]
fn test_queue_runs_in_submission_order() {
    let daemon = TestDaemon::start(
        |dir| recording_script(&dir.join("commits.log"), "0.3"),
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let ids: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let tx = client
                .create(&commit_request(&[(*name, PackageAction::Install)]))
                .unwrap();
            client.run(&tx.id).unwrap();
            tx.id
        })
        .collect();

    assert!(wait_for(Duration::from_secs(5), || {
        client.queue().unwrap().active.as_deref() == Some(ids[0].as_str())
    }));
    // The active transaction stays at the head until it completes
    let queue = client.queue().unwrap();
    assert_eq!(queue.queued, ids);

    let events = follow_to_end(&daemon, &ids[2]);
    assert_eq!(events.last(), Some(&MirrorEvent::Finished(ExitStatus::Success)));

    let log = std::fs::read_to_string(daemon.path("commits.log")).unwrap();
    let order: Vec<&str> = log.lines().collect();
    assert_eq!(order, vec!["install=a", "install=b", "install=c"]);

    for id in &ids {
        let properties = client.properties(id).unwrap();
        assert!(properties.contains(&Property::ExitStatus(ExitStatus::Success)));
    }
    assert!(client.queue().unwrap().active.is_none());
}

#[test]
fn test_cancel_waiting_transaction() {
    let daemon = TestDaemon::start(
        |dir| recording_script(&dir.join("commits.log"), "0.5"),
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let first = client
        .create(&commit_request(&[("a", PackageAction::Install)]))
        .unwrap();
    let second = client
        .create(&commit_request(&[("b", PackageAction::Install)]))
        .unwrap();
    client.run(&first.id).unwrap();
    client.run(&second.id).unwrap();

    client.cancel(&second.id).unwrap();
    let events = follow_to_end(&daemon, &second.id);
    assert_eq!(events.last(), Some(&MirrorEvent::Finished(ExitStatus::Cancelled)));

    let events = follow_to_end(&daemon, &first.id);
    assert_eq!(events.last(), Some(&MirrorEvent::Finished(ExitStatus::Success)));

    let log = std::fs::read_to_string(daemon.path("commits.log")).unwrap();
    assert_eq!(log.lines().collect::<Vec<_>>(), vec!["install=a"]);
}

#[test]
fn test_cancel_in_setup_finishes_immediately() {
    let daemon = TestDaemon::start(|_| "exit 0".to_string(), Duration::from_secs(5));
    let client = daemon.client();

    let tx = client.create(&TransactionRequest::new(Role::UpdateCache)).unwrap();
    let summary = client.cancel(&tx.id).unwrap();
    assert_eq!(summary.status, Status::Finished);
    assert_eq!(summary.exit_status, ExitStatus::Cancelled);

    // A finished transaction cannot be queued again
    assert!(matches!(client.run(&tx.id), Err(Error::InvalidState(_))));
}

#[test]
fn test_failed_commit_reports_error() {
    let daemon = TestDaemon::start(
        |_| "echo 'pmerror:foo:20:broken maintainer script' >&$PKGWORKER_STATUS_FD; exit 1"
            .to_string(),
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let tx = client
        .create(&commit_request(&[("foo", PackageAction::Install)]))
        .unwrap();
    let mut subscription = client.subscribe(&tx.id).unwrap();
    client.run(&tx.id).unwrap();

    let finished = subscription
        .by_ref()
        .find_map(|event| match event {
            MirrorEvent::Finished(exit) => Some(exit),
            _ => None,
        });
    assert_eq!(finished, Some(ExitStatus::Failed));

    let mirror = subscription.mirror();
    assert!(mirror.error().is_some());
    assert!(
        mirror
            .error_log()
            .iter()
            .any(|line| line.contains("broken maintainer script"))
    );
}

#[test]
fn test_config_file_prompt_round_trip() {
    let daemon = TestDaemon::start(
        |_| {
            "echo \"pmconffile:/etc/foo.conf:40:'/etc/foo.conf' '/etc/foo.conf.new'\" >&$PKGWORKER_STATUS_FD; \
             read answer <&$PKGWORKER_STATUS_FD; \
             test \"$answer\" = Y"
                .to_string()
        },
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let request = commit_request(&[("foo", PackageAction::Install)])
        .with_capabilities(Capabilities::CONFIG_FILE);
    let tx = client.create(&request).unwrap();
    let mut subscription = client.subscribe(&tx.id).unwrap();
    client.run(&tx.id).unwrap();

    let mut prompted = false;
    let mut finished = None;
    while let Some(event) = subscription.next() {
        match event {
            MirrorEvent::ConfigFileConflict(conflict) => {
                assert_eq!(conflict.old_path, "/etc/foo.conf");
                assert_eq!(conflict.new_path, "/etc/foo.conf.new");
                subscription
                    .client()
                    .resolve_conffile(&tx.id, &conflict.old_path, true)
                    .unwrap();
                prompted = true;
            }
            MirrorEvent::Finished(exit) => {
                finished = Some(exit);
                break;
            }
            _ => {}
        }
    }

    assert!(prompted);
    assert_eq!(finished, Some(ExitStatus::Success));
}

#[test]
fn test_terminal_output_readable_after_finish() {
    let daemon = TestDaemon::start(
        |_| "echo 'Unpacking foo (1.0)'; echo 'Setting up foo (1.0)'".to_string(),
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let tx = client
        .create(&commit_request(&[("foo", PackageAction::Install)]))
        .unwrap();
    let subscription = client.subscribe(&tx.id).unwrap();
    client.run(&tx.id).unwrap();
    let events: Vec<MirrorEvent> = subscription.collect();
    assert_eq!(events.last(), Some(&MirrorEvent::Finished(ExitStatus::Success)));

    let output = client.terminal_output(&tx.id).unwrap();
    assert!(output.iter().any(|line| line.contains("Unpacking foo (1.0)")));
    assert!(output.iter().any(|line| line.contains("Setting up foo (1.0)")));

    assert!(matches!(
        client.terminal_output("no-such-transaction"),
        Err(Error::NotFoundError(_))
    ));
}

#[test]
fn test_daemon_exit_reported_once() {
    let daemon = TestDaemon::start(
        |_| {
            "echo \"pmconffile:/etc/foo.conf:40:'/etc/foo.conf' '/etc/foo.conf.new'\" >&$PKGWORKER_STATUS_FD; \
             read answer <&$PKGWORKER_STATUS_FD"
                .to_string()
        },
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let request = commit_request(&[("foo", PackageAction::Install)])
        .with_capabilities(Capabilities::CONFIG_FILE);
    let tx = client.create(&request).unwrap();
    let mut subscription = client.subscribe(&tx.id).unwrap();
    client.run(&tx.id).unwrap();

    // Park the transaction at the prompt, then take the daemon away
    let parked = subscription
        .by_ref()
        .any(|event| matches!(event, MirrorEvent::ConfigFileConflict(_)));
    assert!(parked);
    daemon.kill();

    let rest: Vec<MirrorEvent> = subscription.by_ref().collect();
    let disappeared = rest
        .iter()
        .filter(|event| **event == MirrorEvent::WorkerDisappeared)
        .count();
    assert_eq!(disappeared, 1);
    assert_eq!(rest.last(), Some(&MirrorEvent::WorkerDisappeared));
    assert!(!rest.iter().any(|event| matches!(event, MirrorEvent::Finished(_))));
    assert!(subscription.next().is_none());
}

#[test]
fn test_session_properties_only_in_setup() {
    let daemon = TestDaemon::start(|_| "exit 0".to_string(), Duration::from_secs(5));
    let client = daemon.client();

    let tx = client.create(&TransactionRequest::new(Role::Empty)).unwrap();
    client
        .set_property(&tx.id, &Property::Locale("de_DE.UTF-8".to_string()))
        .unwrap();
    let properties = client.properties(&tx.id).unwrap();
    assert!(properties.contains(&Property::Locale("de_DE.UTF-8".to_string())));

    let events = {
        client.run(&tx.id).unwrap();
        follow_to_end(&daemon, &tx.id)
    };
    // The empty role may finish before the subscription attaches
    assert!(
        events.is_empty() || events.last() == Some(&MirrorEvent::Finished(ExitStatus::Success))
    );

    let result = client.set_property(&tx.id, &Property::Locale("C".to_string()));
    assert!(matches!(result, Err(Error::InvalidState(_))));
}

#[test]
fn test_unknown_transaction() {
    let daemon = TestDaemon::start(|_| "exit 0".to_string(), Duration::from_secs(5));
    let client = daemon.client();
    assert!(matches!(
        client.properties("does-not-exist"),
        Err(Error::NotFoundError(_))
    ));
    assert!(matches!(
        client.cancel("does-not-exist"),
        Err(Error::NotFoundError(_))
    ));
}

#[test]
fn test_queue_stream_reports_changes() {
    let daemon = TestDaemon::start(
        |dir| recording_script(&dir.join("commits.log"), "0.2"),
        Duration::from_secs(5),
    );
    let client = daemon.client();

    let mut stream = client.queue_stream().unwrap();
    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.event, "queue");

    let tx = client
        .create(&commit_request(&[("foo", PackageAction::Install)]))
        .unwrap();
    client.run(&tx.id).unwrap();

    let mut saw_active = false;
    for event in stream.by_ref() {
        let event = event.unwrap();
        if event.event != "queue" {
            continue;
        }
        let queue: pkgworker::transaction::QueueChange = serde_json::from_str(&event.data).unwrap();
        if queue.active.as_deref() == Some(tx.id.as_str()) {
            saw_active = true;
        } else if saw_active && queue.active.is_none() {
            break;
        }
    }
    assert!(saw_active);
}

#[test]
fn test_client_without_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let client = pkgworker::DaemonClient::with_socket_path(dir.path().join("missing.sock"));
    assert!(matches!(client.health(), Err(Error::DaemonError(_))));
}
