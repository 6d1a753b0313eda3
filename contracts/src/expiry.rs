//! Background expiration checker
//!
//! Sweeps active contracts past their expiry at a fixed interval until
//! stopped. Per-item failures never escape the loop; stop is one-shot and
//! a second stop is a no-op.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use pact_common::{Actor, CallContext};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::ContractEngine;
use crate::store::ContractStore;

pub const DEFAULT_EXPIRATION_INTERVAL: Duration = Duration::from_secs(60);

pub struct ExpirationChecker {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationChecker {
    /// Spawn the checker task.
    pub fn spawn<S: ContractStore>(
        engine: Arc<ContractEngine<S>>,
        period: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ctx = CallContext::with_actor(Actor::system());
                        match engine.check_expired(&ctx).await {
                            Ok(0) => {}
                            Ok(resolved) => debug!("expiration pass resolved {resolved} contract(s)"),
                            Err(err) => warn!("expiration pass failed: {err}"),
                        }
                    }
                    _ = stopped.changed() => {
                        debug!("expiration checker stopping");
                        break;
                    }
                }
            }
        });
        Self {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryContractStore;
    use pact_ledger::{Ledger, LedgerService, MemoryLedgerStore};

    fn engine() -> Arc<ContractEngine<MemoryContractStore>> {
        let ledger: Arc<dyn LedgerService> =
            Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new())));
        Arc::new(ContractEngine::new(Arc::new(MemoryContractStore::new()), ledger))
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let checker = ExpirationChecker::spawn(engine(), Duration::from_millis(10));
        checker.stop().await;
        // Second stop must be a no-op
        checker.stop().await;
    }
}
