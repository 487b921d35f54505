use std::{sync::Arc, time::Duration};

use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::AssetCache;

/// Background task that periodically removes cache entries older than
/// `max_age`. The first sweep runs immediately.
#[derive(Debug)]
pub struct CacheSweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheSweeper {
    pub fn spawn(cache: Arc<AssetCache>, every: Duration, max_age: Duration) -> Self {
        let (shutdown, mut stop) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?every, ?max_age, root = ?cache.root(), "cache sweeper started");
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        match cache.sweep(max_age).await {
                            Ok(0) => debug!("cache sweep found nothing to remove"),
                            Ok(removed) => info!(removed, "cache sweep finished"),
                            Err(error) => warn!("cache sweep failed: {error}"),
                        }
                    }
                }
            }
            debug!("cache sweeper stopped");
        });
        Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    /// Stops the sweeper, letting a sweep in progress finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                warn!("cache sweeper task ended abnormally: {error}");
            }
        }
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
