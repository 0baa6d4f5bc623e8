//! End-to-end scenarios driving the replication machine over in-process
//! endpoints. Timer-driven cases run under paused tokio time.

use std::sync::Arc;

use snapsync_endpoint::{
    CancelToken, EndpointError, EndpointPair, FilesystemVersion, InMemEndpoint,
};
use snapsync_repl::{DriverConfig, FsState, Replication, ReplicationState, RetrySignal};

fn make_version(name: &str, creation_us: u64) -> FilesystemVersion {
    FilesystemVersion::new(name, creation_us)
}

fn make_endpoints() -> (Arc<InMemEndpoint>, Arc<InMemEndpoint>, EndpointPair) {
    let sender = Arc::new(InMemEndpoint::new());
    let receiver = Arc::new(InMemEndpoint::new());
    let ep = EndpointPair::new(sender.clone(), receiver.clone());
    (sender, receiver, ep)
}

fn eof() -> EndpointError {
    EndpointError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
}

/// Spawn a driver task for `repl` over `ep`.
fn spawn_driver(
    repl: &Arc<Replication>,
    ep: &EndpointPair,
    ctx: &CancelToken,
    retry_now: &RetrySignal,
) -> tokio::task::JoinHandle<()> {
    let repl = Arc::clone(repl);
    let ep = ep.clone();
    let ctx = ctx.clone();
    let retry_now = retry_now.clone();
    tokio::spawn(async move {
        repl.drive(&ep, &ctx, &retry_now).await;
    })
}

/// Busy-poll until the run reaches `state`. Yielding keeps the runtime from
/// auto-advancing paused time, so the run cannot slip past a wait state
/// while we watch for it.
async fn wait_for_state(repl: &Replication, state: ReplicationState) {
    for _ in 0..100_000 {
        if repl.state().await == state {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("run never reached {state:?}");
}

#[tokio::test]
async fn scenario_incremental_send_completes() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    receiver
        .add_filesystem("tank/a", vec![make_version("@v1", 100)])
        .await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].state, FsState::Completed);
    assert_eq!(report.completed[0].completed_steps.len(), 1);
    assert_eq!(
        report.completed[0].completed_steps[0].from.as_deref(),
        Some("@v1")
    );
    assert_eq!(report.completed[0].completed_steps[0].to, "@v2");
    assert_eq!(receiver.versions_of("tank/a").await.len(), 2);
}

#[tokio::test]
async fn scenario_full_send_to_empty_receiver() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.completed.len(), 1);
    let steps = &report.completed[0].completed_steps;
    assert_eq!(steps.len(), 1);
    assert!(steps[0].from.is_none());
    assert_eq!(steps[0].to, "@v2");
    assert_eq!(
        receiver.versions_of("tank/a").await,
        vec![make_version("@v2", 200)]
    );
}

#[tokio::test]
async fn scenario_single_version_sender_is_permanent_error() {
    let (sender, _, ep) = make_endpoints();
    sender
        .add_filesystem("tank/a", vec![make_version("@v1", 100)])
        .await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].state, FsState::PermanentError);
    assert_eq!(
        report.completed[0].permanent_error.as_deref(),
        Some("sender does not have any versions")
    );
}

#[tokio::test]
async fn scenario_scheduler_promotes_earlier_next_step_first() {
    let (sender, _, ep) = make_endpoints();
    // Both need a full send; fsA's newest version is older than fsB's, so
    // fsA is worked first even though fsB lists first.
    sender
        .add_filesystem(
            "tank/b",
            vec![make_version("@u1", 150), make_version("@u2", 300)],
        )
        .await;
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    let report = repl.report().await;
    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.completed[0].path, "tank/a");
    assert_eq!(report.completed[1].path, "tank/b");
}

#[tokio::test(start_paused = true)]
async fn scenario_eof_twice_then_success() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    receiver
        .add_filesystem("tank/a", vec![make_version("@v1", 100)])
        .await;
    sender.push_send_fault(eof()).await;
    sender.push_send_fault(eof()).await;

    let repl = Arc::new(Replication::default());
    let ctx = CancelToken::new();
    let retry_now = RetrySignal::new();
    let handle = spawn_driver(&repl, &ep, &ctx, &retry_now);

    // First transient failure parks the run and the filesystem in a wait.
    wait_for_state(&repl, ReplicationState::WorkingWait).await;
    let report = repl.report().await;
    let active = report.active.expect("a filesystem is active");
    assert_eq!(active.state, FsState::RetryWait);
    assert_eq!(active.retries_since_last_error, 1);

    // Let the retry timers fire (paused time auto-advances).
    handle.await.unwrap();

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].state, FsState::Completed);
    assert_eq!(report.completed[0].retries_since_last_error, 0);
    assert_eq!(sender.stats().await.send_calls, 3);
    assert_eq!(receiver.versions_of("tank/a").await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_cancellation_during_working_wait_is_prompt() {
    let (sender, _, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    for _ in 0..64 {
        sender.push_send_fault(eof()).await;
    }

    let repl = Arc::new(Replication::default());
    let ctx = CancelToken::new();
    let retry_now = RetrySignal::new();
    let handle = spawn_driver(&repl, &ep, &ctx, &retry_now);

    wait_for_state(&repl, ReplicationState::WorkingWait).await;
    let calls_at_cancel = sender.stats().await.send_calls;
    let cancelled_at = tokio::time::Instant::now();
    ctx.cancel("operator shutdown");
    handle.await.unwrap();

    // The run left the wait on the cancellation branch, not the 10 s timer.
    assert!(cancelled_at.elapsed() < DriverConfig::default().working_retry_interval);
    assert_eq!(repl.state().await, ReplicationState::ContextDone);
    let report = repl.report().await;
    assert_eq!(report.context_error.as_deref(), Some("operator shutdown"));
    assert_eq!(sender.stats().await.send_calls, calls_at_cancel);
}

#[tokio::test(start_paused = true)]
async fn wakeup_signal_cuts_the_working_wait_short() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    receiver
        .add_filesystem("tank/a", vec![make_version("@v1", 100)])
        .await;
    sender.push_send_fault(eof()).await;

    let repl = Arc::new(Replication::default());
    let ctx = CancelToken::new();
    let retry_now = RetrySignal::new();
    let handle = spawn_driver(&repl, &ep, &ctx, &retry_now);

    wait_for_state(&repl, ReplicationState::WorkingWait).await;
    let woken_at = tokio::time::Instant::now();
    // The signal is best-effort and lost unless the waiter is parked, so
    // keep nudging until the run moves on.
    for _ in 0..100_000 {
        retry_now.trigger();
        if repl.state().await != ReplicationState::WorkingWait {
            break;
        }
        tokio::task::yield_now().await;
    }
    handle.await.unwrap();

    assert!(woken_at.elapsed() < DriverConfig::default().working_retry_interval);
    assert_eq!(repl.state().await, ReplicationState::Completed);
}

#[tokio::test(start_paused = true)]
async fn planning_error_cools_down_then_replans() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    receiver
        .add_filesystem("tank/a", vec![make_version("@v1", 100)])
        .await;
    sender
        .push_list_filesystems_fault(EndpointError::Network {
            msg: "daemon restarting".into(),
        })
        .await;

    let repl = Arc::new(Replication::default());
    let ctx = CancelToken::new();
    let retry_now = RetrySignal::new();
    let handle = spawn_driver(&repl, &ep, &ctx, &retry_now);

    wait_for_state(&repl, ReplicationState::PlanningError).await;
    let report = repl.report().await;
    assert!(report.planning_error.unwrap().contains("daemon restarting"));
    // The sleep deadline is published one lock acquisition after the state
    // flips, so poll for it.
    for _ in 0..100_000 {
        if repl.report().await.sleep_until_us.is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(repl.report().await.sleep_until_us.is_some());

    // After the cooldown the second planning pass succeeds and the run
    // finishes the transfer.
    handle.await.unwrap();
    assert_eq!(repl.state().await, ReplicationState::Completed);
    assert_eq!(receiver.versions_of("tank/a").await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_planning_error_is_prompt() {
    let (sender, _, ep) = make_endpoints();
    for _ in 0..64 {
        sender
            .push_list_filesystems_fault(EndpointError::Network {
                msg: "unreachable".into(),
            })
            .await;
    }

    let repl = Arc::new(Replication::default());
    let ctx = CancelToken::new();
    let retry_now = RetrySignal::new();
    let handle = spawn_driver(&repl, &ep, &ctx, &retry_now);

    wait_for_state(&repl, ReplicationState::PlanningError).await;
    let cancelled_at = tokio::time::Instant::now();
    ctx.cancel("giving up");
    handle.await.unwrap();

    assert!(cancelled_at.elapsed() < DriverConfig::default().planning_retry_interval);
    assert_eq!(repl.state().await, ReplicationState::ContextDone);
}

#[tokio::test]
async fn empty_sender_completes_immediately() {
    let (_, _, ep) = make_endpoints();
    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.filesystem_count(), 0);
}

#[tokio::test]
async fn filtered_filesystem_does_not_stop_the_others() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/skip",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    sender
        .add_filesystem(
            "tank/keep",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    receiver
        .add_filesystem("tank/skip", vec![make_version("@v1", 100)])
        .await;
    receiver.mark_filtered("tank/skip").await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.filesystem_count(), 1);
    assert_eq!(report.completed[0].path, "tank/keep");
    assert!(receiver.versions_of("tank/skip").await.len() == 1);
    assert_eq!(receiver.versions_of("tank/keep").await.len(), 1);
}

#[tokio::test]
async fn permanent_step_failure_settles_filesystem_but_not_the_run() {
    let (sender, receiver, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/bad",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;
    sender
        .add_filesystem(
            "tank/good",
            vec![make_version("@w1", 300), make_version("@w2", 400)],
        )
        .await;
    // tank/bad is scheduled first (earlier head) and its send dies hard.
    sender
        .push_send_fault(EndpointError::Other {
            msg: "dataset is busy".into(),
        })
        .await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    assert_eq!(repl.state().await, ReplicationState::Completed);
    let report = repl.report().await;
    assert_eq!(report.completed.len(), 2);
    assert_eq!(report.completed[0].path, "tank/bad");
    assert_eq!(report.completed[0].state, FsState::PermanentError);
    assert_eq!(report.completed[1].path, "tank/good");
    assert_eq!(report.completed[1].state, FsState::Completed);
    assert_eq!(receiver.versions_of("tank/good").await.len(), 1);
    assert!(receiver.versions_of("tank/bad").await.is_empty());
}

#[tokio::test]
async fn report_is_serializable_end_to_end() {
    let (sender, _, ep) = make_endpoints();
    sender
        .add_filesystem(
            "tank/a",
            vec![make_version("@v1", 100), make_version("@v2", 200)],
        )
        .await;

    let repl = Replication::default();
    repl.drive(&ep, &CancelToken::new(), &RetrySignal::new())
        .await;

    let report = repl.report().await;
    let json = serde_json::to_string(&report).unwrap();
    let back: snapsync_repl::ReplicationReport = serde_json::from_str(&json).unwrap();
    assert_eq!(report, back);
    assert!(report.one_line_summary().contains("Completed"));
}
