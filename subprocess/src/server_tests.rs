// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::start_controller;
use crate::types::{
    ControllerOptions, Priority, SubProcessEvent, SubProcessId, SubProcessReq,
    SubProcessSetOption, TerminateError, Weight,
};

fn sleep_req(id: SubProcessId, millis: u64, priority: Priority, weight: Weight) -> SubProcessReq {
    SubProcessReq {
        id,
        trace_id: format!("test-{id}"),
        prog: "/bin/sh".into(),
        argv: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("sleep {}", millis as f64 / 1000.0),
        ],
        envs: vec!["PATH=/bin:/usr/bin".to_string()],
        cwd: std::env::temp_dir(),
        stdout_file: None,
        stderr_file: None,
        priority,
        weight,
        detach: false,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SubProcessEvent>) -> SubProcessEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Replays the event stream until `count` terminations, asserting the §scheduling caps over the
/// implied running set at every step.
async fn collect_with_caps(
    events: &mut mpsc::UnboundedReceiver<SubProcessEvent>,
    weights: &HashMap<SubProcessId, Weight>,
    max_running: usize,
    max_heavy: usize,
    count: usize,
) -> Vec<SubProcessEvent> {
    let mut log = Vec::new();
    let mut running: HashSet<SubProcessId> = HashSet::new();
    let mut terminated = 0;

    while terminated < count {
        let event = next_event(events).await;
        match &event {
            SubProcessEvent::Started(started) => {
                running.insert(started.id);
            }
            SubProcessEvent::Terminated(done) => {
                running.remove(&done.id);
                terminated += 1;
            }
            SubProcessEvent::Closed => panic!("unexpected close"),
        }
        assert!(running.len() <= max_running, "cap exceeded: {running:?}");
        let heavy = running
            .iter()
            .filter(|id| weights.get(id) == Some(&Weight::Heavy))
            .count();
        assert!(heavy <= max_heavy, "heavy cap exceeded: {running:?}");
        log.push(event);
    }
    log
}

#[tokio::test]
async fn runs_a_subprocess_to_completion() {
    let (controller, mut events) = start_controller(ControllerOptions::default());
    controller.register(sleep_req(1, 10, Priority::High, Weight::Light));

    match next_event(&mut events).await {
        SubProcessEvent::Started(started) => assert_eq!(started.id, 1),
        other => panic!("expected Started, got {other:?}"),
    }
    match next_event(&mut events).await {
        SubProcessEvent::Terminated(terminated) => {
            assert_eq!(terminated.id, 1);
            assert_eq!(terminated.status, Some(0));
            assert_eq!(terminated.error, None);
        }
        other => panic!("expected Terminated, got {other:?}"),
    }
}

#[tokio::test]
async fn spawn_failure_is_synthetic_termination() {
    let (controller, mut events) = start_controller(ControllerOptions::default());
    let mut req = sleep_req(1, 10, Priority::High, Weight::Light);
    req.prog = "/no/such/binary".into();
    controller.register(req);

    match next_event(&mut events).await {
        SubProcessEvent::Terminated(terminated) => {
            assert_eq!(terminated.id, 1);
            assert_eq!(terminated.error, Some(TerminateError::FailedToSpawn));
        }
        other => panic!("expected Terminated, got {other:?}"),
    }
}

#[tokio::test]
async fn detached_spawn_failure_is_silent() {
    let (controller, mut events) = start_controller(ControllerOptions::default());
    let mut bad = sleep_req(1, 10, Priority::High, Weight::Light);
    bad.prog = "/no/such/binary".into();
    bad.detach = true;
    controller.register(bad);
    // A good subprocess after it: the first event we see belongs to the good one.
    controller.register(sleep_req(2, 10, Priority::High, Weight::Light));

    match next_event(&mut events).await {
        SubProcessEvent::Started(started) => assert_eq!(started.id, 2),
        other => panic!("expected Started for id 2, got {other:?}"),
    }
}

#[tokio::test]
async fn kill_of_unknown_id_reports_lookup_failure() {
    let (controller, mut events) = start_controller(ControllerOptions::default());
    controller.kill(42);
    match next_event(&mut events).await {
        SubProcessEvent::Terminated(terminated) => {
            assert_eq!(terminated.id, 42);
            assert_eq!(terminated.error, Some(TerminateError::FailedToLookup));
        }
        other => panic!("expected Terminated, got {other:?}"),
    }
}

#[tokio::test]
async fn kill_resolves_to_termination() {
    let (controller, mut events) = start_controller(ControllerOptions::default());
    controller.register(sleep_req(1, 60_000, Priority::High, Weight::Light));
    match next_event(&mut events).await {
        SubProcessEvent::Started(_) => {}
        other => panic!("expected Started, got {other:?}"),
    }

    controller.kill(1);
    match next_event(&mut events).await {
        SubProcessEvent::Terminated(terminated) => {
            assert_eq!(terminated.id, 1);
            // Killed by signal: no exit code.
            assert_eq!(terminated.status, None);
            assert_eq!(terminated.error, Some(TerminateError::Killed));
        }
        other => panic!("expected Terminated, got {other:?}"),
    }
}

#[tokio::test]
async fn pending_kill_is_synthetic() {
    let options = ControllerOptions {
        max_subprocs: 1,
        ..ControllerOptions::default()
    };
    let (controller, mut events) = start_controller(options);
    controller.register(sleep_req(1, 60_000, Priority::High, Weight::Light));
    match next_event(&mut events).await {
        SubProcessEvent::Started(_) => {}
        other => panic!("expected Started, got {other:?}"),
    }
    // Id 2 can never start while id 1 runs.
    controller.register(sleep_req(2, 10, Priority::High, Weight::Light));
    controller.kill(2);

    match next_event(&mut events).await {
        SubProcessEvent::Terminated(terminated) => {
            assert_eq!(terminated.id, 2);
            assert_eq!(terminated.error, Some(TerminateError::Killed));
        }
        other => panic!("expected Terminated, got {other:?}"),
    }
    controller.kill(1);
}

#[tokio::test]
async fn concurrency_caps_hold() {
    let options = ControllerOptions {
        max_subprocs: 2,
        max_subprocs_low_priority: 1,
        max_subprocs_heavy_weight: 1,
        ..ControllerOptions::default()
    };
    let (controller, mut events) = start_controller(options);

    // LIGHT:A, HEAVY:B, HEAVY:C, LIGHT:D.
    let requests = vec![
        sleep_req(1, 100, Priority::High, Weight::Light),
        sleep_req(2, 400, Priority::High, Weight::Heavy),
        sleep_req(3, 200, Priority::High, Weight::Heavy),
        sleep_req(4, 200, Priority::High, Weight::Light),
    ];
    let weights: HashMap<SubProcessId, Weight> =
        requests.iter().map(|r| (r.id, r.weight)).collect();
    for req in requests {
        controller.register(req);
    }

    let log = collect_with_caps(&mut events, &weights, 2, 1, 4).await;

    // The light D must have been able to run while a heavy one was running: it starts before
    // the second heavy does.
    let start_order: Vec<SubProcessId> = log
        .iter()
        .filter_map(|event| match event {
            SubProcessEvent::Started(started) => Some(started.id),
            _ => None,
        })
        .collect();
    let position = |id: SubProcessId| start_order.iter().position(|x| *x == id).unwrap();
    assert_eq!(start_order.len(), 4);
    assert!(position(4) < position(3));
}

#[tokio::test]
async fn low_priority_cap_holds_until_raised() {
    let options = ControllerOptions {
        max_subprocs: 3,
        max_subprocs_low_priority: 1,
        max_subprocs_heavy_weight: 3,
        ..ControllerOptions::default()
    };
    let (controller, mut events) = start_controller(options);

    controller.register(sleep_req(1, 60_000, Priority::Low, Weight::Light));
    controller.register(sleep_req(2, 60_000, Priority::Low, Weight::Light));
    match next_event(&mut events).await {
        SubProcessEvent::Started(started) => assert_eq!(started.id, 1),
        other => panic!("expected Started, got {other:?}"),
    }

    // Id 2 is low priority and the low cap is already full. Raising it lets it run.
    controller.request_run(2);
    match next_event(&mut events).await {
        SubProcessEvent::Started(started) => assert_eq!(started.id, 2),
        other => panic!("expected Started for raised id 2, got {other:?}"),
    }

    controller.kill(1);
    controller.kill(2);
}

#[tokio::test]
async fn shutdown_kills_and_closes() {
    let (controller, mut events) = start_controller(ControllerOptions::default());
    controller.register(sleep_req(1, 60_000, Priority::High, Weight::Light));
    match next_event(&mut events).await {
        SubProcessEvent::Started(_) => {}
        other => panic!("expected Started, got {other:?}"),
    }

    controller.shutdown();
    let mut saw_termination = false;
    loop {
        match next_event(&mut events).await {
            SubProcessEvent::Terminated(terminated) => {
                assert_eq!(terminated.id, 1);
                saw_termination = true;
            }
            SubProcessEvent::Closed => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_termination);
}

#[tokio::test]
async fn set_option_rejects_zero() {
    let options = ControllerOptions {
        max_subprocs: 1,
        ..ControllerOptions::default()
    };
    let (controller, mut events) = start_controller(options);
    // Zero is refused, so the cap stays at 1 and the second request stays pending.
    controller.set_option(SubProcessSetOption {
        max_subprocs: Some(0),
        ..SubProcessSetOption::default()
    });
    controller.register(sleep_req(1, 60_000, Priority::High, Weight::Light));
    controller.register(sleep_req(2, 60_000, Priority::High, Weight::Light));

    match next_event(&mut events).await {
        SubProcessEvent::Started(started) => assert_eq!(started.id, 1),
        other => panic!("expected Started, got {other:?}"),
    }
    // Raising the cap releases the second.
    controller.set_option(SubProcessSetOption {
        max_subprocs: Some(2),
        ..SubProcessSetOption::default()
    });
    match next_event(&mut events).await {
        SubProcessEvent::Started(started) => assert_eq!(started.id, 2),
        other => panic!("expected Started, got {other:?}"),
    }
    controller.kill(1);
    controller.kill(2);
}
