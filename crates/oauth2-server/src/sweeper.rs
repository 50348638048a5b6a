//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use oauth2_server_core::{CallContext, CredentialStore, StoreResult};

use crate::config::ServerOptions;

/// Periodically deletes token rows whose every stage has expired.
///
/// Failures are logged and the loop keeps going. Overlapping sweeps are
/// harmless since deletes are idempotent.
#[derive(Debug)]
pub struct ExpirySweeper {
    handle: JoinHandle<()>,
    shutdown_token: CancellationToken,
}

impl ExpirySweeper {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(
        store: Arc<dyn CredentialStore>,
        period: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self::spawn_with_timeout(store, period, None, shutdown_token)
    }

    /// Sweep every `sweep_interval_secs`, each run bounded by `store_timeout_ms`.
    pub fn from_options(
        store: Arc<dyn CredentialStore>,
        options: &ServerOptions,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self::spawn_with_timeout(
            store,
            options.sweep_interval(),
            options.store_timeout(),
            shutdown_token,
        )
    }

    /// Like [`spawn`](Self::spawn), bounding each sweep by `timeout`.
    pub fn spawn_with_timeout(
        store: Arc<dyn CredentialStore>,
        period: Duration,
        timeout: Option<Duration>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let token = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(period_secs = period.as_secs(), "expiry sweeper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("expiry sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let mut ctx = CallContext::new().with_cancellation(token.child_token());
                if let Some(limit) = timeout {
                    ctx = ctx.with_timeout(limit);
                }
                match sweep_once(store.as_ref(), &ctx).await {
                    Ok(0) => tracing::debug!("expiry sweep found nothing"),
                    Ok(removed) => tracing::info!(removed, "expired tokens swept"),
                    Err(e) if e.is_interrupted() && token.is_cancelled() => break,
                    Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                }
            }
        });

        Self {
            handle,
            shutdown_token,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "expiry sweeper task failed");
        }
    }
}

/// Run one sweep.
pub async fn sweep_once(store: &dyn CredentialStore, ctx: &CallContext) -> StoreResult<u64> {
    ctx.run(store.delete_expired_tokens()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use oauth2_server_memory::MemoryStore;
    use oauth2_server_test_utils::fixtures;

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_client(fixtures::confidential_client("c1")).await.unwrap();
        store
            .create_token(fixtures::aged_lineage_params("c1", 120, 60, 60))
            .await
            .unwrap();
        store
            .create_token(fixtures::lineage_params("c1", fixtures::now(), 3600, 7200))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_sweep_once() {
        let store = seeded().await;
        let removed = sweep_once(store.as_ref(), &CallContext::new()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.token_count().await, 1);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_runs_and_stops() {
        let store = seeded().await;
        let sweeper = ExpirySweeper::spawn(
            store.clone(),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        for _ in 0..50 {
            if store.token_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.token_count().await, 1);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_from_options_sweeps_on_start() {
        let store = seeded().await;
        let options = ServerOptions {
            sweep_interval_secs: 3600,
            store_timeout_ms: 500,
            ..Default::default()
        };
        let sweeper = ExpirySweeper::from_options(store.clone(), &options, CancellationToken::new());

        for _ in 0..50 {
            if store.token_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.token_count().await, 1);
        assert!(!sweeper.is_finished());

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_loop() {
        let store = seeded().await;
        let token = CancellationToken::new();
        let sweeper = ExpirySweeper::spawn(store, Duration::from_secs(3600), token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
            .await
            .unwrap();
    }
}
