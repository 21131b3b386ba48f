//! Incremental backup across consecutive runs sharing one destination.

mod common;

use bitvault_core::application::CancelToken;
use bitvault_core::domain::{Issue, RunOptions};
use bitvault_core::port::git_backend::mocks::MockGitBackend;
use bitvault_core::port::GitOperation;

use common::{client, pr, ts, Harness};

#[tokio::test]
async fn test_second_run_fetches_only_newer_pull_requests() {
    let client = client(&["api"]).with_pull_requests("api", vec![pr(1, ts(100)), pr(2, ts(200))]);
    let h = Harness::new(client, MockGitBackend::new_success());
    let orch = h.orchestrator();

    let first = orch.run(RunOptions::default(), CancelToken::never()).await.unwrap();
    assert!(!first.manifest.incremental);
    assert_eq!(first.manifest.counters.pull_requests, 2);
    assert_eq!(h.client.since_seen("api", "pull_requests"), Some(None));
    assert_eq!(h.state().await.last_pr_updated("api"), Some(ts(200)));

    // PR 1 is untouched, PR 2 was edited, PR 3 is new
    h.client.set_pull_requests(
        "api",
        vec![pr(1, ts(100)), pr(2, ts(250)), pr(3, ts(300))],
    );
    std::fs::remove_file(h.path("acme/repositories/api/pull_requests/1.json")).unwrap();
    h.clock.advance(chrono::Duration::hours(1));

    let second = orch.run(RunOptions::default(), CancelToken::never()).await.unwrap();
    assert!(second.manifest.incremental);
    assert_eq!(second.manifest.counters.pull_requests, 2);
    assert_eq!(h.client.since_seen("api", "pull_requests"), Some(Some(ts(200))));

    assert!(!h.path("acme/repositories/api/pull_requests/1.json").exists());
    assert_eq!(
        h.read_json("acme/repositories/api/pull_requests/2.json")["updated_on"],
        ts(250).to_rfc3339()
    );
    assert!(h.path("acme/repositories/api/pull_requests/3.json").exists());

    let state = h.state().await;
    assert_eq!(state.last_pr_updated("api"), Some(ts(300)));
    assert!(state.snapshot().last_incremental_backup.is_some());

    // The existing mirror is fetched, not cloned again
    let ops: Vec<GitOperation> = h.git.calls().into_iter().map(|(op, _)| op).collect();
    assert_eq!(ops, vec![GitOperation::Clone, GitOperation::Fetch]);
}

#[tokio::test]
async fn test_empty_streams_advance_to_fetch_start() {
    let h = Harness::new(client(&["quiet"]), MockGitBackend::new_success());
    let orch = h.orchestrator();

    orch.run(RunOptions::default(), CancelToken::never()).await.unwrap();

    // Fixed clock: the fetch started at ts(10_000)
    let state = h.state().await;
    assert_eq!(state.last_pr_updated("quiet"), Some(ts(10_000)));
    assert_eq!(state.last_issue_updated("quiet"), Some(ts(10_000)));

    h.clock.advance(chrono::Duration::minutes(5));
    orch.run(RunOptions::default(), CancelToken::never()).await.unwrap();
    assert_eq!(
        h.client.since_seen("quiet", "pull_requests"),
        Some(Some(ts(10_000)))
    );
    assert_eq!(h.client.since_seen("quiet", "issues"), Some(Some(ts(10_000))));
    assert_eq!(
        h.state().await.last_pr_updated("quiet"),
        Some(ts(10_000) + chrono::Duration::minutes(5))
    );
}

#[tokio::test]
async fn test_full_flag_ignores_recorded_timestamps() {
    let issue = Issue {
        id: 7,
        title: "Crash on start".to_string(),
        updated_on: ts(50),
        raw: serde_json::json!({ "id": 7 }),
    };
    let client = client(&["api"])
        .with_pull_requests("api", vec![pr(1, ts(100))])
        .with_issues("api", vec![issue]);
    let h = Harness::new(client, MockGitBackend::new_success());
    let orch = h.orchestrator();

    orch.run(RunOptions::default(), CancelToken::never()).await.unwrap();

    let options = RunOptions {
        full: true,
        ..Default::default()
    };
    let report = orch.run(options, CancelToken::never()).await.unwrap();

    assert!(!report.manifest.incremental);
    assert_eq!(report.manifest.counters.pull_requests, 1);
    assert_eq!(report.manifest.counters.issues, 1);
    assert_eq!(h.client.since_seen("api", "pull_requests"), Some(None));
    assert_eq!(h.client.since_seen("api", "issues"), Some(None));
    assert!(h.path("acme/repositories/api/issues/7.json").exists());
}

#[tokio::test]
async fn test_state_survives_on_disk_between_orchestrators() {
    let client = client(&["api"]).with_pull_requests("api", vec![pr(1, ts(100))]);
    let h = Harness::new(client, MockGitBackend::new_success());

    h.orchestrator()
        .run(RunOptions::default(), CancelToken::never())
        .await
        .unwrap();

    let raw = h.read_json("acme/.bitvault-state.json");
    assert_eq!(raw["workspace"], "acme");
    assert!(raw["repositories"]["api"]["last_commit"].is_string());

    // A fresh orchestrator picks up where the last one stopped
    let report = h
        .orchestrator()
        .run(RunOptions::default(), CancelToken::never())
        .await
        .unwrap();
    assert!(report.manifest.incremental);
    assert_eq!(report.manifest.counters.pull_requests, 0);
}
