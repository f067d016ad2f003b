mod support;

use std::time::Duration;

use support::{harness, statuses_of, wait_until, CallKind, ScriptedEngine, Step, WAIT};
use toklabs_engine::events::EventPayload;
use toklabs_engine::models::{DownloadStatus, RowToken};

#[test]
fn never_runs_more_than_the_limit_at_once() {
    let urls: Vec<String> = (0..6).map(|i| format!("https://x/held-{i}")).collect();
    let mut engine = ScriptedEngine::new();
    for url in &urls {
        engine = engine.plan(url, vec![Step::Block]);
    }
    let h = harness(2, engine);
    for url in &urls {
        h.pool.submit(h.request(url), None).expect("submit");
    }

    wait_until("two transfers are running", || {
        h.engine.calls().iter().filter(|c| c.kind == CallKind::Transfer).count() == 2
    });
    assert_eq!(h.pool.active_count(), 2);
    assert_eq!(h.pool.queued_count(), 4);

    h.engine.release();
    assert!(h.pool.wait_idle(WAIT));
    h.collect(6);
    assert_eq!(h.engine.high_water(), 2);
    assert_eq!(h.pool.active_count(), 0);
}

#[test]
fn single_slot_runs_tasks_in_submission_order() {
    let h = harness(1, ScriptedEngine::new());
    for url in ["https://x/a", "https://x/b", "https://x/c"] {
        h.pool.submit(h.request(url), None).expect("submit");
    }
    assert!(h.pool.wait_idle(WAIT));
    h.collect(3);

    let resolved: Vec<String> = h
        .engine
        .calls()
        .into_iter()
        .filter(|c| c.kind == CallKind::Resolve)
        .map(|c| c.url)
        .collect();
    assert_eq!(resolved, ["https://x/a", "https://x/b", "https://x/c"]);
}

#[test]
fn status_sequences_only_move_forward() {
    let engine = ScriptedEngine::new()
        .unresolvable("https://x/gone")
        .plan(
            "https://x/retry",
            vec![Step::Fail("ERROR: Requested format is not available")],
        )
        .plan("https://x/fatal", vec![Step::Fail("ERROR: HTTP Error 403: Forbidden")]);
    let h = harness(3, engine);

    let urls = [
        "https://x/ok",
        "https://x/gone",
        "https://x/retry",
        "https://x/fatal",
    ];
    let handles: Vec<_> = urls
        .iter()
        .map(|url| h.pool.submit(h.request(url), None).expect("submit"))
        .collect();
    let events = h.collect(urls.len());
    assert!(h.pool.wait_idle(WAIT));

    for handle in &handles {
        let statuses = statuses_of(&events, handle.id());
        assert_eq!(statuses.first(), Some(&DownloadStatus::Pending));
        let terminal: Vec<_> = statuses.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "{statuses:?}");
        assert!(statuses.last().is_some_and(|s| s.is_terminal()), "{statuses:?}");

        for pair in statuses.windows(2) {
            let retry_edge = pair[0] == DownloadStatus::Downloading && pair[1] == DownloadStatus::Downloading;
            assert!(
                retry_edge || pair[0].can_transition_to(pair[1]),
                "illegal edge {} -> {} in {statuses:?}",
                pair[0],
                pair[1]
            );
        }

        let last = events
            .iter()
            .rev()
            .find(|e| e.task.id == handle.id())
            .expect("events for task");
        assert!(matches!(last.payload, EventPayload::Completed { .. }));
    }
}

#[test]
fn cancelling_a_queued_task_never_reaches_the_engine() {
    let engine = ScriptedEngine::new().plan("https://x/first", vec![Step::Block]);
    let h = harness(1, engine);

    let first = h.pool.submit(h.request("https://x/first"), None).expect("submit");
    let queued = h
        .pool
        .submit(h.request("https://x/second"), Some(RowToken(7)))
        .expect("submit");
    assert_eq!(h.pool.queued_count(), 1);

    h.pool.cancel(queued.id()).expect("cancel");
    assert_eq!(h.pool.queued_count(), 0);

    h.engine.release();
    let events = h.collect(2);
    assert!(h.pool.wait_idle(WAIT));

    assert!(h.engine.calls().iter().all(|c| c.url != "https://x/second"));
    assert_eq!(
        statuses_of(&events, queued.id()),
        [DownloadStatus::Pending, DownloadStatus::Cancelled]
    );

    let outcome = h.pool.take_outcome(queued.id()).expect("outcome");
    assert_eq!(outcome.status, DownloadStatus::Cancelled);
    assert_eq!(outcome.row, Some(RowToken(7)));
    assert_eq!(
        h.pool.take_outcome(first.id()).map(|o| o.status),
        Some(DownloadStatus::Completed)
    );
}

#[test]
fn cancelling_a_running_task_aborts_the_transfer() {
    let engine = ScriptedEngine::new().plan("https://x/slow", vec![Step::Block]);
    let h = harness(1, engine);

    let handle = h.pool.submit(h.request("https://x/slow"), None).expect("submit");
    h.wait_for_status(handle.id(), DownloadStatus::Downloading);
    h.pool.cancel(handle.id()).expect("cancel");

    h.collect(1);
    assert!(h.pool.wait_idle(WAIT));
    let outcome = h.pool.take_outcome(handle.id()).expect("outcome");
    assert_eq!(outcome.status, DownloadStatus::Cancelled);
    assert!(outcome.error.is_none());
    assert_eq!(h.engine.calls_for("https://x/slow", CallKind::Transfer).len(), 1);
}

#[test]
fn cancel_all_flags_running_and_drains_queued() {
    let engine = ScriptedEngine::new().plan("https://x/one", vec![Step::Block]);
    let h = harness(1, engine);

    let handles: Vec<_> = ["https://x/one", "https://x/two", "https://x/three"]
        .iter()
        .map(|url| h.pool.submit(h.request(url), None).expect("submit"))
        .collect();
    h.wait_for_status(handles[0].id(), DownloadStatus::Downloading);

    assert_eq!(h.pool.cancel_all(), 3);
    h.collect(3);
    assert!(h.pool.wait_idle(WAIT));

    for handle in &handles {
        let outcome = h.pool.take_outcome(handle.id()).expect("outcome");
        assert_eq!(outcome.status, DownloadStatus::Cancelled);
    }
    assert!(h.engine.calls().iter().all(|c| c.url == "https://x/one"));
}

#[test]
fn raising_the_limit_dispatches_waiting_tasks() {
    let urls = ["https://x/p", "https://x/q", "https://x/r"];
    let mut engine = ScriptedEngine::new();
    for url in urls {
        engine = engine.plan(url, vec![Step::Block]);
    }
    let h = harness(1, engine);
    for url in urls {
        h.pool.submit(h.request(url), None).expect("submit");
    }
    wait_until("one transfer is running", || h.pool.active_count() == 1);
    assert_eq!(h.pool.queued_count(), 2);

    assert_eq!(h.pool.set_concurrency_limit(3), 3);
    wait_until("all three transfers are running", || {
        h.engine.calls().iter().filter(|c| c.kind == CallKind::Transfer).count() == 3
    });

    h.engine.release();
    h.collect(3);
    assert!(h.pool.wait_idle(WAIT));
}

#[test]
fn three_tasks_on_two_slots_all_complete_at_full_progress() {
    let h = harness(2, ScriptedEngine::new());
    let handles: Vec<_> = (0..3)
        .map(|row| {
            h.pool
                .submit(h.request("https://x/video"), Some(RowToken(row)))
                .expect("submit")
        })
        .collect();

    let events = h.collect(3);
    assert!(h.pool.wait_idle(Duration::from_secs(10)));

    for handle in &handles {
        let mine: Vec<_> = events.iter().filter(|e| e.task.id == handle.id()).collect();
        assert!(mine.iter().all(|e| e.task.row == handle.row()));

        let last_progress = mine
            .iter()
            .rev()
            .find_map(|e| match &e.payload {
                EventPayload::ProgressUpdated { progress } => Some(progress.percentage),
                _ => None,
            })
            .expect("progress events");
        assert!((last_progress - 100.0).abs() < f64::EPSILON);

        match &mine.last().expect("events").payload {
            EventPayload::Completed { success, status, error } => {
                assert!(*success);
                assert_eq!(*status, DownloadStatus::Completed);
                assert!(error.is_none());
            }
            other => panic!("expected completion last, got {other:?}"),
        }
    }
    assert_eq!(h.history.entries().len(), 3);
    assert!(h.engine.high_water() <= 2);
}
