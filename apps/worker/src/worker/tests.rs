/// Tests for the worker loop
///
/// These tests run the loop against an in-memory log, a scripted prober and
/// a store that fails on demand, checking:
/// - Acknowledgment only after a successful persistence call
/// - Isolation of per-entry probe faults
/// - Idle backoff when the log is empty
use super::*;
use crate::config::Identity;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use streams::memory::MemoryLog;
use streams::{CLAIM_CURSOR_START, CheckRequest};
use timeseries::{EventRow, EventStore, PersistenceError, UptimeStatus};

#[derive(Clone, Copy)]
enum Behaviour {
    Down,
    Fault,
    Panic,
}

/// Prober that answers UP unless told otherwise for a URL
#[derive(Default)]
struct ScriptedProbe {
    script: HashMap<String, Behaviour>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn with(mut self, url: &str, behaviour: Behaviour) -> Self {
        self.script.insert(url.to_string(), behaviour);
        self
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, url: &str) -> Result<ProbeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.get(url) {
            None => Ok(ProbeOutcome::up(42, Utc::now())),
            Some(Behaviour::Down) => Ok(ProbeOutcome::down(Utc::now())),
            Some(Behaviour::Fault) => Err(anyhow!("probe exploded for {}", url)),
            Some(Behaviour::Panic) => panic!("probe panicked for {}", url),
        }
    }
}

/// Store whose inserts fail while `failing_inserts` is positive
#[derive(Default)]
struct FlakyStore {
    commands: AtomicUsize,
    failing_commands: AtomicUsize,
    failing_inserts: AtomicUsize,
    batches: Mutex<Vec<Vec<EventRow>>>,
}

impl FlakyStore {
    fn stored_websites(&self) -> Vec<String> {
        self.batches.lock().unwrap().iter().flatten().map(|row| row.website_id.clone()).collect()
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn command(&self, _statement: &str) -> Result<(), PersistenceError> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_commands) {
            return Err(PersistenceError::Rejected { status: 500, body: "provisioning".into() });
        }
        Ok(())
    }

    async fn insert_rows(&self, _table: &str, rows: &[EventRow]) -> Result<(), PersistenceError> {
        if take_failure(&self.failing_inserts) {
            return Err(PersistenceError::Rejected { status: 503, body: "unavailable".into() });
        }
        self.batches.lock().unwrap().push(rows.to_vec());
        Ok(())
    }
}

struct Harness {
    log: Arc<MemoryLog>,
    store: Arc<FlakyStore>,
    prober: Arc<ScriptedProbe>,
    worker: Worker,
}

const GROUP: &str = "eu-west";

fn settings() -> LoopSettings {
    LoopSettings {
        read_count: 5,
        read_block: Duration::ZERO,
        idle_delay: Duration::from_millis(1_000),
        reclaim_idle: Some(Duration::from_secs(60)),
    }
}

fn harness(prober: ScriptedProbe, settings: LoopSettings) -> Harness {
    let log = Arc::new(MemoryLog::new());
    let store = Arc::new(FlakyStore::default());
    let prober = Arc::new(prober);
    let sink = Arc::new(TimeSeriesSink::new(store.clone(), "uptime_events"));
    let identity = Identity { region_id: GROUP.to_string(), worker_id: "worker-1".to_string() };
    let worker = Worker::new(log.clone(), sink, prober.clone(), identity, settings);
    Harness { log, store, prober, worker }
}

fn url(i: usize) -> String {
    format!("https://site-{}.example", i)
}

async fn enqueue(log: &MemoryLog, count: usize) -> Vec<String> {
    let requests: Vec<_> = (1..=count).map(|i| CheckRequest::new(url(i), format!("site-{}", i))).collect();
    log.append(&requests, 250).await.unwrap()
}

/// One poll plus processing, `None` when nothing was delivered
async fn cycle(worker: &Worker) -> Option<CycleOutcome> {
    let entries = worker.poll().await;
    if entries.is_empty() {
        return None;
    }
    Some(worker.process(entries).await)
}

#[tokio::test]
async fn test_faulted_probe_is_left_pending() {
    let h = harness(ScriptedProbe::default().with(&url(3), Behaviour::Fault), settings());
    let ids = enqueue(&h.log, 5).await;

    let outcome = cycle(&h.worker).await;

    assert_eq!(
        outcome,
        Some(CycleOutcome::Completed { persisted: 4, acknowledged: 4, ack_failures: 0, faulted: 1 })
    );
    assert_eq!(h.store.batch_count(), 1);
    let stored = h.store.stored_websites();
    assert_eq!(stored.len(), 4);
    assert!(!stored.contains(&"site-3".to_string()));
    assert_eq!(h.log.pending_ids(GROUP), vec![ids[2].clone()]);
}

#[tokio::test]
async fn test_panicking_probe_does_not_abort_siblings() {
    let h = harness(ScriptedProbe::default().with(&url(2), Behaviour::Panic), settings());
    let ids = enqueue(&h.log, 3).await;

    let outcome = cycle(&h.worker).await;

    assert!(matches!(outcome, Some(CycleOutcome::Completed { persisted: 2, faulted: 1, .. })));
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.log.pending_ids(GROUP), vec![ids[1].clone()]);
}

#[tokio::test]
async fn test_down_outcomes_are_persisted_and_acknowledged() {
    let h = harness(
        ScriptedProbe::default().with(&url(1), Behaviour::Down).with(&url(2), Behaviour::Down),
        settings(),
    );
    enqueue(&h.log, 2).await;

    let outcome = cycle(&h.worker).await;

    assert!(matches!(outcome, Some(CycleOutcome::Completed { persisted: 2, acknowledged: 2, .. })));
    let batches = h.store.batches.lock().unwrap();
    assert!(batches[0].iter().all(|row| row.status == UptimeStatus::Down));
    assert!(batches[0].iter().all(|row| row.response_time_ms.is_none()));
    assert!(batches[0].iter().all(|row| row.region_id == GROUP));
    drop(batches);
    assert!(h.log.pending_ids(GROUP).is_empty());
}

#[tokio::test]
async fn test_every_probe_faulting_persists_nothing() {
    let h = harness(
        ScriptedProbe::default().with(&url(1), Behaviour::Fault).with(&url(2), Behaviour::Fault),
        settings(),
    );
    enqueue(&h.log, 2).await;

    let outcome = cycle(&h.worker).await;

    assert_eq!(outcome, Some(CycleOutcome::NothingProbed { faulted: 2 }));
    assert_eq!(h.store.commands.load(Ordering::SeqCst), 0);
    assert_eq!(h.log.pending_ids(GROUP).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_ack_before_persist_across_failures() {
    let h = harness(ScriptedProbe::default(), settings());
    let ids = enqueue(&h.log, 5).await;
    h.store.failing_inserts.store(3, Ordering::SeqCst);

    for attempt in 0..3 {
        let outcome = cycle(&h.worker).await;

        assert_eq!(outcome, Some(CycleOutcome::Abandoned { probed: 5, faulted: 0 }), "attempt {}", attempt);
        assert_eq!(h.log.pending_ids(GROUP), ids, "attempt {}", attempt);
        assert_eq!(h.store.batch_count(), 0);

        // Nothing new and nothing stale yet: the batch waits for redelivery
        assert_eq!(cycle(&h.worker).await, None);
        tokio::time::advance(Duration::from_secs(61)).await;
    }

    let outcome = cycle(&h.worker).await;

    assert!(matches!(outcome, Some(CycleOutcome::Completed { persisted: 5, acknowledged: 5, .. })));
    assert_eq!(h.store.batch_count(), 1);
    assert!(h.log.pending_ids(GROUP).is_empty());
}

#[tokio::test]
async fn test_acknowledged_ids_match_persisted_batch() {
    let h = harness(ScriptedProbe::default().with(&url(1), Behaviour::Fault), settings());
    let ids = enqueue(&h.log, 3).await;
    h.store.failing_inserts.store(1, Ordering::SeqCst);

    cycle(&h.worker).await;
    assert_eq!(h.log.pending_ids(GROUP), ids);

    // Fresh work succeeds while the abandoned batch is still pending
    let fresh = h
        .log
        .append(
            &[
                CheckRequest::new("https://fresh-a.example", "fresh-a"),
                CheckRequest::new("https://fresh-b.example", "fresh-b"),
            ],
            250,
        )
        .await
        .unwrap();
    let outcome = cycle(&h.worker).await;

    assert!(matches!(outcome, Some(CycleOutcome::Completed { persisted: 2, acknowledged: 2, .. })));
    let pending: HashSet<String> = h.log.pending_ids(GROUP).into_iter().collect();
    assert_eq!(pending, ids.iter().cloned().collect::<HashSet<_>>());
    assert!(fresh.iter().all(|id| !pending.contains(id)));
}

#[tokio::test]
async fn test_failed_ack_leaves_entry_pending() {
    let h = harness(ScriptedProbe::default(), settings());
    let ids = enqueue(&h.log, 3).await;
    h.log.fail_ack_for(&ids[0]);

    let outcome = cycle(&h.worker).await;

    assert_eq!(
        outcome,
        Some(CycleOutcome::Completed { persisted: 3, acknowledged: 2, ack_failures: 1, faulted: 0 })
    );
    assert_eq!(h.log.pending_ids(GROUP), vec![ids[0].clone()]);
}

#[tokio::test]
async fn test_provisioning_failure_abandons_batch_then_recovers() {
    let h = harness(ScriptedProbe::default(), settings());
    enqueue(&h.log, 2).await;
    h.store.failing_commands.store(1, Ordering::SeqCst);

    let first = cycle(&h.worker).await;
    assert_eq!(first, Some(CycleOutcome::Abandoned { probed: 2, faulted: 0 }));

    enqueue(&h.log, 1).await;
    let second = cycle(&h.worker).await;

    assert!(matches!(second, Some(CycleOutcome::Completed { persisted: 1, .. })));
    assert_eq!(h.store.commands.load(Ordering::SeqCst), 2);
    assert_eq!(h.log.pending_ids(GROUP).len(), 2);
}

#[tokio::test]
async fn test_malformed_entries_are_never_probed() {
    let h = harness(ScriptedProbe::default(), settings());
    h.log.push_raw(&[("url", "https://no-id.example")]);
    enqueue(&h.log, 1).await;

    let outcome = cycle(&h.worker).await;

    assert!(matches!(outcome, Some(CycleOutcome::Completed { persisted: 1, .. })));
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);
    assert!(h.log.pending_ids(GROUP).is_empty());
}

#[tokio::test]
async fn test_malformed_entries_do_not_stay_pending_after_a_failed_batch() {
    let h = harness(ScriptedProbe::default(), settings());
    h.log.push_raw(&[("id", "no-url")]);
    let ids = enqueue(&h.log, 1).await;
    h.store.failing_inserts.store(1, Ordering::SeqCst);

    let outcome = cycle(&h.worker).await;

    assert_eq!(outcome, Some(CycleOutcome::Abandoned { probed: 1, faulted: 0 }));
    assert_eq!(h.log.pending_ids(GROUP), ids);
}

#[tokio::test(start_paused = true)]
async fn test_stale_entries_behind_a_fresh_pending_head_are_reclaimed() {
    let h = harness(ScriptedProbe::default(), LoopSettings { read_count: 1, ..settings() });
    let ids = enqueue(&h.log, 15).await;
    h.log.read_group(GROUP, "crashed", 15, Duration::ZERO).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    // Another consumer refreshes the first ten pending entries
    h.log.claim_stale(GROUP, "busy", Duration::from_secs(60), 10, CLAIM_CURSOR_START).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    // The first scan window only holds fresh entries
    assert_eq!(cycle(&h.worker).await, None);
    let outcome = cycle(&h.worker).await;

    assert!(matches!(outcome, Some(CycleOutcome::Completed { persisted: 1, acknowledged: 1, .. })));
    assert_eq!(h.store.stored_websites(), vec!["site-11".to_string()]);
    assert!(!h.log.pending_ids(GROUP).contains(&ids[10]));
    assert_eq!(h.log.pending_ids(GROUP).len(), 14);
}

#[tokio::test(start_paused = true)]
async fn test_idle_log_is_polled_once_per_idle_delay() {
    let h = harness(ScriptedProbe::default(), LoopSettings { reclaim_idle: None, ..settings() });

    h.worker.run_until(tokio::time::sleep(Duration::from_millis(10_500))).await.unwrap();

    let reads = h.log.read_calls();
    assert!(reads <= 11, "polled {} times in 10.5s", reads);
    assert!(reads >= 10, "polled only {} times in 10.5s", reads);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_processes_then_stops() {
    let h = harness(ScriptedProbe::default(), settings());
    enqueue(&h.log, 7).await;

    h.worker.run_until(tokio::time::sleep(Duration::from_secs(3))).await.unwrap();

    assert_eq!(h.store.stored_websites().len(), 7);
    assert_eq!(h.store.batch_count(), 2);
    assert!(h.log.pending_ids(GROUP).is_empty());
}

#[test]
fn test_loop_settings_from_tuning() {
    let tuning = crate::config::Tuning { reclaim_idle_ms: 0, read_count: 0, ..Default::default() };

    let settings = LoopSettings::from(&tuning);

    assert_eq!(settings.reclaim_idle, None);
    assert_eq!(settings.read_count, 1);
    assert_eq!(settings.read_block, Duration::from_millis(1_000));
}
