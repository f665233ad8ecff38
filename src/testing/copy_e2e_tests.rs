#[cfg(test)]
mod tests {
    use crate::command::{start_copy, start_diff};
    use crate::config::{RetryConfig, WorkerConfig};
    use crate::error::{Error, ErrorCategory};
    use crate::metrics::WorkerMetrics;
    use crate::stats::poll_for_stats;
    use crate::testing::{init_tracing, seed_rows, LifecycleEvent, MemoryCluster};
    use crate::types::{KeyspaceId, Row, ShardTarget, TabletAlias};
    use crate::worker::{SplitCloneWorker, WorkerState};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const SOURCE: &str = "test_keyspace/0";
    const LEFT: &str = "test_keyspace/-80";
    const RIGHT: &str = "test_keyspace/80-";

    const POLL_TIMEOUT: Duration = Duration::from_secs(10);
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    fn shard(path: &str) -> ShardTarget {
        ShardTarget::parse_path(path).unwrap()
    }

    /// Source master 100, destination masters 200 and 300, replicas at +1.
    fn cluster(rows: u64) -> MemoryCluster {
        let cluster = MemoryCluster::new("test_nj");
        cluster.add_shard(&shard(SOURCE), 100);
        cluster.add_shard(&shard(LEFT), 200);
        cluster.add_shard(&shard(RIGHT), 300);
        cluster.load_source(&shard(SOURCE), seed_rows(rows), 100);
        cluster
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new("test_nj")
            .with_retry_config(RetryConfig::fast())
            .with_startup_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_reparent_during_copy() {
        init_tracing();
        let cluster = cluster(3000);
        let release = cluster.hold_source_after(3);

        let copy = start_copy(
            SOURCE,
            &[LEFT, RIGHT],
            "-populate_blp_checkpoint",
            config(),
            cluster.collaborators(),
        )
        .await
        .unwrap();

        // Both destinations resolved and the held batches are on the old masters.
        poll_for_stats(
            copy.stats_addr(),
            |s| s.state == WorkerState::Copying && s.actual_resolves >= 2 && s.batches_written >= 6,
            POLL_TIMEOUT,
            POLL_INTERVAL,
        )
        .await
        .unwrap();

        cluster.reparent(&shard(LEFT), 201).unwrap();
        cluster.reparent(&shard(RIGHT), 301).unwrap();
        release.notify_one();

        let stats = poll_for_stats(
            copy.stats_addr(),
            |s| s.state == WorkerState::Done,
            POLL_TIMEOUT,
            POLL_INTERVAL,
        )
        .await
        .unwrap();
        assert!(!stats.retry_count.is_empty());
        assert!(stats.retries(ErrorCategory::StaleMaster) >= 2);
        assert!(stats.attempted_resolves > 2);
        assert!(stats.actual_resolves > 2);
        assert!(stats.attempted_resolves >= stats.actual_resolves);
        assert_eq!(stats.rows_copied, 3000);
        for path in [LEFT, RIGHT] {
            let per_shard = stats.shard(&shard(path)).unwrap();
            assert!(per_shard.retries.get("stale_master").copied().unwrap_or(0) >= 1);
        }

        let metrics = Arc::clone(copy.metrics());
        let summary = copy.wait().await.unwrap();
        assert_eq!(summary.total_rows(), 3000);
        assert_eq!(summary.masters[&shard(LEFT).label()].uid, 201);
        assert_eq!(summary.masters[&shard(RIGHT).label()].uid, 301);

        // The demoted masters kept only the batches written before the hold.
        let fleet = cluster.fleet();
        for (old, new) in [(200, 201), (300, 301)] {
            let before = fleet.applied_by(&TabletAlias::new("test_nj", old));
            let after = fleet.applied_by(&TabletAlias::new("test_nj", new));
            assert_eq!(before, 3, "tablet {} applied {} batches", old, before);
            assert_eq!(before + after, 30);
        }
        assert!(fleet.stale_rejections() >= 2);

        let events = cluster.lifecycle_events();
        assert!(events.contains(&LifecycleEvent::BlpCheckpoint {
            source: shard(SOURCE),
            destination: shard(LEFT),
        }));

        for path in [LEFT, RIGHT] {
            let diff = start_diff(
                SOURCE,
                path,
                &config(),
                Arc::clone(&metrics),
                cluster.fleet().clone(),
                cluster.lifecycle().clone(),
            )
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
            assert!(diff.is_empty(), "{} differs: {:?}", path, diff);
            assert!(diff.source_rows > 0);
        }
        assert!(cluster.lifecycle().out_of_rotation().is_empty());
    }

    #[tokio::test]
    async fn test_diff_reports_extra_row() {
        let cluster = cluster(200);
        let copy = start_copy(SOURCE, &[LEFT, RIGHT], "", config(), cluster.collaborators())
            .await
            .unwrap();
        let metrics = Arc::clone(copy.metrics());
        copy.wait().await.unwrap();

        let extra = Row::new(
            1_000_000,
            KeyspaceId(0x10 << 56),
            vec![Bytes::from_static(b"not on the source")],
        );
        cluster.insert_row(&shard(LEFT), extra.clone());

        let diff = start_diff(
            SOURCE,
            LEFT,
            &config(),
            Arc::clone(&metrics),
            cluster.fleet().clone(),
            cluster.lifecycle().clone(),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
        assert_eq!(diff.extra, vec![extra]);
        assert!(diff.missing.is_empty());
        assert!(diff.mismatched.is_empty());
        assert!(matches!(diff.into_result(), Err(Error::DataMismatch { extra: 1, .. })));

        let right = start_diff(
            SOURCE,
            RIGHT,
            &config(),
            metrics,
            cluster.fleet().clone(),
            cluster.lifecycle().clone(),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
        assert!(right.is_empty());
    }

    #[tokio::test]
    async fn test_diff_before_done_is_rejected() {
        let cluster = cluster(10);
        let metrics = Arc::new(WorkerMetrics::new());
        metrics.set_state(WorkerState::FindingTargets).unwrap();
        metrics.set_state(WorkerState::Copying).unwrap();

        let err = start_diff(
            SOURCE,
            LEFT,
            &config(),
            metrics,
            cluster.fleet().clone(),
            cluster.lifecycle().clone(),
        )
        .await
        .unwrap_err();
        match err {
            Error::PrematureDiff { state } => assert_eq!(state, "copying"),
            other => panic!("expected PrematureDiff, got {other:?}"),
        }
        assert!(cluster.lifecycle_events().is_empty());
    }

    #[tokio::test]
    async fn test_diff_restores_rotation_on_failure() {
        let cluster = cluster(50);
        let copy = start_copy(SOURCE, &[LEFT, RIGHT], "", config(), cluster.collaborators())
            .await
            .unwrap();
        let metrics = Arc::clone(copy.metrics());
        copy.wait().await.unwrap();

        // No such shard in the cluster, so reading it fails after removal.
        let err = start_diff(
            SOURCE,
            "test_keyspace/80-c0",
            &config(),
            metrics,
            cluster.fleet().clone(),
            cluster.lifecycle().clone(),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TopologyUnavailable);

        let removed = cluster
            .lifecycle_events()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::RemovedFromRotation(_)))
            .count();
        assert_eq!(removed, 2);
        assert!(cluster.lifecycle().out_of_rotation().is_empty());
    }

    #[tokio::test]
    async fn test_restart_resets_counters() {
        let cluster = cluster(100);
        cluster.set_schema(&shard(RIGHT), "v0");
        cluster.topology().fail_next(&shard(LEFT), 1);
        let metrics = Arc::new(WorkerMetrics::new());

        let first = SplitCloneWorker::new(
            config(),
            shard(SOURCE),
            vec![shard(LEFT), shard(RIGHT)],
            cluster.collaborators(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        )
        .unwrap();
        let err = first.run().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::SchemaMismatch);
        let failed = metrics.snapshot();
        assert_eq!(failed.state, WorkerState::Error);
        assert_eq!(failed.retries(ErrorCategory::TopologyUnavailable), 1);

        cluster.set_schema(&shard(RIGHT), "v1");
        let second = SplitCloneWorker::new(
            config(),
            shard(SOURCE),
            vec![shard(LEFT), shard(RIGHT)],
            cluster.collaborators(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        )
        .unwrap();
        let summary = second.run().await.unwrap();

        let done = metrics.snapshot();
        assert_ne!(done.run_id, failed.run_id);
        assert_eq!(done.run_id, summary.run_id);
        assert_eq!(done.state, WorkerState::Done);
        assert!(done.retry_count.is_empty());
        assert_eq!(done.attempted_resolves, 2);
        assert_eq!(done.actual_resolves, 2);
        assert_eq!(done.last_error_category, None);
    }

    #[tokio::test]
    async fn test_cancelled_copy_reports_error_state() {
        let cluster = cluster(1000);
        let _hold = cluster.hold_source_after(1);
        let copy = start_copy(SOURCE, &[LEFT, RIGHT], "", config(), cluster.collaborators())
            .await
            .unwrap();

        poll_for_stats(
            copy.stats_addr(),
            |s| s.state == WorkerState::Copying,
            POLL_TIMEOUT,
            POLL_INTERVAL,
        )
        .await
        .unwrap();
        copy.cancel();
        let metrics = Arc::clone(copy.metrics());

        let err = copy.wait().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let snap = metrics.snapshot();
        assert_eq!(snap.state, WorkerState::Error);
        assert_eq!(snap.last_error_category, Some(ErrorCategory::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_strategy_flag_rejected() {
        let cluster = cluster(10);
        let err = start_copy(SOURCE, &[LEFT, RIGHT], "-bogus", config(), cluster.collaborators())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
