//! Connectivity Monitor: a watch channel of online/offline state. The daemon
//! drives it from an HTTP reachability probe; tests and embedders flip it
//! directly via `set_online`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publish a transition. Subscribers are only woken on actual changes.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            info!(online, "connectivity changed");
            true
        });
    }
}

/// Background reachability probe for the daemon: HEAD the remote at a fixed
/// interval and publish the result.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    probe_url: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        loop {
            let reachable = match client.head(&probe_url).send().await {
                Ok(resp) => !resp.status().is_server_error(),
                Err(err) => {
                    debug!(?err, "connectivity probe failed");
                    false
                }
            };
            monitor.set_online(reachable);
            tokio::time::sleep(interval).await;
        }
    })
}
