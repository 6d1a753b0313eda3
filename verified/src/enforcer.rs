//! Background guarantee enforcer
//!
//! Samples every active verification at a fixed interval: fetch the
//! agent's newest seller-side calls from the contract-call provider, skip
//! agents whose window is not yet full, and record a violation when the
//! window rate falls below the guarantee. A provider failure or panic on
//! one agent never stops the sweep.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, warn};
use pact_common::{Actor, CallContext};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::VerifiedEngine;
use crate::error::VerificationError;
use crate::providers::ContractCallProvider;
use crate::store::VerificationStore;
use crate::verification::Verification;

pub const DEFAULT_ENFORCER_INTERVAL: Duration = Duration::from_secs(30);
/// Bounded page of active verifications per sweep
pub const ENFORCER_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub interval: Duration,
    /// Destination for forfeited bonds; empty burns them
    pub fund_addr: String,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ENFORCER_INTERVAL,
            fund_addr: String::new(),
        }
    }
}

impl<S: VerificationStore> VerifiedEngine<S> {
    /// One enforcement sweep. Returns the number of violations recorded.
    pub async fn enforce_guarantees(
        &self,
        ctx: &CallContext,
        calls: &dyn ContractCallProvider,
        fund_addr: &str,
    ) -> Result<usize, VerificationError> {
        let active = self.store().list_active(ctx, ENFORCER_PAGE_SIZE).await?;
        let mut violations = 0usize;
        for verification in active {
            if ctx.is_cancelled() {
                break;
            }
            let agent = verification.agent_addr.to_string();
            let sampled = std::panic::AssertUnwindSafe(
                self.sample_one(ctx, &verification, calls, fund_addr),
            )
            .catch_unwind()
            .await;
            match sampled {
                Ok(Ok(true)) => violations += 1,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => warn!("enforcer failed to sample agent {agent}: {err}"),
                Err(_) => error!("panic while sampling agent {agent}; continuing sweep"),
            }
        }
        Ok(violations)
    }

    /// Sample a single verification; true when a violation was recorded.
    async fn sample_one(
        &self,
        ctx: &CallContext,
        verification: &Verification,
        calls: &dyn ContractCallProvider,
        fund_addr: &str,
    ) -> Result<bool, VerificationError> {
        let stats = calls
            .seller_call_stats(
                ctx,
                verification.agent_addr.as_str(),
                verification.sla_window_size,
            )
            .await?;

        // Monitoring counters move on every sweep, violation or not
        let mut monitored = verification.clone();
        monitored.total_calls_monitored = stats.total;
        monitored.touch();
        self.store().update(ctx, &monitored).await?;

        if stats.total < verification.sla_window_size as u64 {
            return Ok(false);
        }
        let rate = 100.0 * stats.successful as f64 / stats.total as f64;
        if rate >= verification.guaranteed_success_rate {
            return Ok(false);
        }

        warn!(
            "guarantee breach for {}: window {:.2}% below guaranteed {:.2}%",
            verification.agent_addr, rate, verification.guaranteed_success_rate
        );
        self.record_violation(ctx, verification.agent_addr.as_str(), rate, fund_addr)
            .await?;
        Ok(true)
    }
}

pub struct Enforcer {
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Enforcer {
    pub fn spawn<S: VerificationStore>(
        engine: Arc<VerifiedEngine<S>>,
        calls: Arc<dyn ContractCallProvider>,
        config: EnforcerConfig,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ctx = CallContext::with_actor(Actor::system());
                        match engine
                            .enforce_guarantees(&ctx, calls.as_ref(), &config.fund_addr)
                            .await
                        {
                            Ok(0) => {}
                            Ok(violations) => {
                                debug!("enforcer sweep recorded {violations} violation(s)")
                            }
                            Err(err) => warn!("enforcer sweep failed: {err}"),
                        }
                    }
                    _ = stopped.changed() => {
                        debug!("enforcer stopping");
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
