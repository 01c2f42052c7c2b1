//! List+watch per kind, translated into store change events.

use apiary_core::{Delta, Kind};
use futures::TryStreamExt;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{convert, dynamic_api};

fn applied(kind: Kind, obj: &DynamicObject) -> Option<Delta> {
    match convert::decode(kind, obj) {
        Ok(r) => Some(Delta::applied(&r)),
        Err(e) => {
            metrics::counter!("watch_decode_errors", 1u64, "kind" => kind.as_str());
            warn!(kind = %kind, name = ?obj.metadata.name, error = %e, "watch: undecodable object skipped");
            None
        }
    }
}

/// Watch one kind until the stream fails or the receiver goes away.
/// A restart replays every live object as applied.
pub async fn watch_kind(client: Client, kind: Kind, namespace: Option<String>, tx: mpsc::Sender<Delta>) -> anyhow::Result<()> {
    let api = dynamic_api(&client, kind, namespace.as_deref());
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watch: started");
    while let Some(ev) = stream.try_next().await? {
        let deltas: Vec<Delta> = match ev {
            Event::Applied(o) => applied(kind, &o).into_iter().collect(),
            Event::Deleted(o) => convert::identity(kind, &o).map(Delta::deleted).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(kind = %kind, count = list.len(), "watch: restart");
                list.iter().filter_map(|o| applied(kind, o)).collect()
            }
        };
        for d in deltas {
            metrics::counter!("watch_events", 1u64, "kind" => kind.as_str());
            if tx.send(d).await.is_err() {
                debug!(kind = %kind, "watch: receiver closed");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind, "watch: stream ended");
    Ok(())
}

/// One watcher task per kind feeding `tx`. Failed streams are restarted after `backoff`.
pub fn spawn_watchers(
    client: Client,
    namespace: Option<String>,
    tx: mpsc::Sender<Delta>,
    backoff: std::time::Duration,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    for kind in Kind::ALL {
        let (client, namespace, tx) = (client.clone(), namespace.clone(), tx.clone());
        tasks.spawn(async move {
            loop {
                match watch_kind(client.clone(), kind, namespace.clone(), tx.clone()).await {
                    Ok(()) if tx.is_closed() => return,
                    Ok(()) => {}
                    Err(e) => warn!(kind = %kind, error = %e, "watch: stream failed"),
                }
                tokio::time::sleep(backoff).await;
            }
        });
    }
    tasks
}
