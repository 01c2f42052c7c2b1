//! Event loop: coalesces change events per identity, runs at most one attempt per
//! identity, bounds concurrency across identities, requeues retryable failures and
//! periodically resyncs everything.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use apiary_core::{ApiaryError, ApiaryResult, Delta, DeltaKind, Kind, ResourceId};
use apiary_store::WorkQueue;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::reconciler::{Action, Outcome, Reconciler};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub attempts: u64,
    pub errors: u64,
    pub requeues: u64,
    pub skipped_events: u64,
}

pub struct Runner {
    reconciler: Arc<Reconciler>,
    workers: usize,
    requeue: Duration,
    resync: Option<Duration>,
    queue_cap: usize,
}

/// Bridge a broadcast feed (e.g. `MemoryStore::subscribe`) into the runner's channel.
pub fn forward(mut rx: broadcast::Receiver<Delta>, cap: usize) -> mpsc::Receiver<Delta> {
    let (tx, out) = mpsc::channel(cap.max(1));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(d) => {
                    if tx.send(d).await.is_err() { break; }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "runner: event feed lagged; resync will catch up"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Runner {
    pub fn new(reconciler: Arc<Reconciler>, settings: &Settings) -> Self {
        Self {
            reconciler,
            workers: settings.workers.max(1),
            requeue: settings.requeue,
            resync: settings.resync,
            queue_cap: settings.queue_cap,
        }
    }

    /// Run until `shutdown` resolves, or until the event channel is closed and no
    /// work (queued, in flight, or waiting to be requeued) remains.
    pub async fn run<S>(self, mut events: mpsc::Receiver<Delta>, shutdown: S) -> RunStats
    where
        S: Future<Output = ()>,
    {
        let mut stats = RunStats::default();
        let mut queue = WorkQueue::with_capacity(self.queue_cap);
        let mut tasks: JoinSet<(ResourceId, ApiaryResult<Outcome>)> = JoinSet::new();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<ResourceId>();
        let mut timers = 0usize;
        let mut last_seen: FxHashMap<ResourceId, (i64, bool)> = FxHashMap::default();
        let mut events_open = true;
        let mut tick = self.resync.map(|d| tokio::time::interval_at(tokio::time::Instant::now() + d, d));
        tokio::pin!(shutdown);
        info!(workers = self.workers, resync_secs = ?self.resync.map(|d| d.as_secs()), "runner: start");

        loop {
            while tasks.len() < self.workers {
                let Some(id) = queue.next() else { break };
                let rec = self.reconciler.clone();
                tasks.spawn(async move {
                    let inner_id = id.clone();
                    let res = tokio::spawn(async move { rec.reconcile(&inner_id).await })
                        .await
                        .unwrap_or_else(|e| Err(ApiaryError::Internal(format!("reconcile task failed: {}", e))));
                    (id, res)
                });
            }
            if !events_open && queue.pending() == 0 && tasks.is_empty() && timers == 0 {
                break;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("runner: shutdown requested");
                    break;
                }
                ev = events.recv(), if events_open => match ev {
                    Some(d) => {
                        if !accept(&d, &mut last_seen) {
                            stats.skipped_events += 1;
                            continue;
                        }
                        queue.push(d.id);
                    }
                    None => {
                        debug!("runner: event channel closed");
                        events_open = false;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let Ok((id, res)) = joined else { continue };
                    queue.done(&id);
                    stats.attempts += 1;
                    let after = match res {
                        Ok(out) => {
                            for other in out.enqueue { queue.push(other); }
                            match out.action {
                                Action::Done => None,
                                Action::Requeue(d) => Some(d),
                            }
                        }
                        Err(e) => {
                            stats.errors += 1;
                            if e.is_retryable() { Some(self.requeue) } else { None }
                        }
                    };
                    if let Some(d) = after {
                        stats.requeues += 1;
                        timers += 1;
                        let tx = requeue_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(d).await;
                            let _ = tx.send(id);
                        });
                    }
                }
                Some(id) = requeue_rx.recv() => {
                    timers = timers.saturating_sub(1);
                    queue.push(id);
                }
                _ = next_tick(&mut tick) => {
                    let mut n = 0usize;
                    for kind in Kind::ALL {
                        match self.reconciler.store().list(kind).await {
                            Ok(objs) => {
                                for o in objs { queue.push(o.id()); n += 1; }
                            }
                            Err(e) => warn!(kind = %kind, error = %e, "runner: resync list failed"),
                        }
                    }
                    debug!(objects = n, "runner: resync");
                }
            }
        }
        tasks.shutdown().await;
        info!(attempts = stats.attempts, errors = stats.errors, requeues = stats.requeues, dropped = queue.dropped(), "runner: stop");
        stats
    }
}

/// Drop `Applied` events that carry nothing new for the reconciler: same generation
/// and same deletion state as the last accepted one. Secrets have no generation.
fn accept(d: &Delta, last_seen: &mut FxHashMap<ResourceId, (i64, bool)>) -> bool {
    match d.kind {
        DeltaKind::Deleted => {
            last_seen.remove(&d.id);
            true
        }
        DeltaKind::Applied if d.id.kind == Kind::Secret => true,
        DeltaKind::Applied => {
            let seen = (d.generation, d.deleting);
            if last_seen.get(&d.id) == Some(&seen) { return false; }
            last_seen.insert(d.id.clone(), seen);
            true
        }
    }
}
