use std::sync::Arc;

use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::StoreResult;

use super::store::ManagedFileStore;

/// Background task that flushes the store every `flush_interval`.
pub struct FlushService {
    store: Arc<ManagedFileStore>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushService {
    /// Spawn the flush loop on the current tokio runtime.
    pub fn start(store: Arc<ManagedFileStore>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let period = store.options().flush_interval;
        let task_store = store.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Flush service started, interval {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let store = task_store.clone();
                        match tokio::task::spawn_blocking(move || store.flush()).await {
                            Ok(Ok(durable)) => debug!("Periodic flush, durable index {:?}", durable),
                            Ok(Err(e)) => warn!("Periodic flush failed: {}", e),
                            Err(e) => warn!("Flush task panicked: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("Flush service stopped");
        });

        Self {
            store,
            shutdown_tx,
            handle,
        }
    }

    /// Stop the loop and run a last flush so that nothing written before the call is lost.
    pub async fn stop(self) -> StoreResult<Option<u64>> {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("Flush service task ended abnormally: {}", e);
        }
        self.store.flush()
    }
}
