//! Swap coordinator
//!
//! Turns watcher events and timer ticks into status transitions and chain
//! actions. Work for one swap is funnelled through [`SwapQueue`] and every
//! write is conditional on the status it was computed from, so redelivered
//! events and overlapping sweeps resolve to no-ops.

use super::clock::Clock;
use super::queue::SwapQueue;
use crate::chain::aptos::normalize_address;
use crate::chain::{ChainAdapters, HtlcParams, HtlcState};
use crate::config::RelayerConfig;
use crate::error::{ChainError, FailureClass, RelayerError, RelayerResult};
use crate::events::{HtlcEvent, HtlcEventKind};
use crate::state::{SwapStore, SwapUpdate};
use crate::swap::{Chain, Hashlock, Preimage, Swap, SwapRequest, SwapStatus};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Resolves when queued work for an event has finished
pub type Completion = oneshot::Receiver<RelayerResult<()>>;

/// Coordinator tuning, taken from `[relayer]`
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub timelock_safety_margin_secs: u64,
    pub min_timelock_window_secs: u64,
    pub sweep_interval: Duration,
    pub retry_interval: Duration,
    /// Extra attempts for transient state queries
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl From<&RelayerConfig> for CoordinatorSettings {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            timelock_safety_margin_secs: config.timelock_safety_margin_secs,
            min_timelock_window_secs: config.min_timelock_window_secs,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepOutcome {
    Refunded,
    Completed,
    Failed,
    /// Left for the next tick
    Retry,
    /// No longer eligible when its turn came
    Skipped,
}

/// Result of one refund sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub selected: usize,
    pub refunded: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: SweepOutcome) {
        match outcome {
            SweepOutcome::Refunded => self.refunded += 1,
            SweepOutcome::Completed => self.completed += 1,
            SweepOutcome::Failed => self.failed += 1,
            SweepOutcome::Retry => self.retrying += 1,
            SweepOutcome::Skipped => {}
        }
    }
}

/// Public reason stored on a failed swap; the chain's own message only goes
/// to the log.
fn failure_reason(action: &str, err: &ChainError) -> String {
    match err.class() {
        FailureClass::InvalidInput => format!("{} was rejected by the contract", action),
        FailureClass::Transient => format!("{} could not reach the chain", action),
        FailureClass::BenignDuplicate | FailureClass::Fatal => format!("{} failed", action),
    }
}

/// Parked events are deduplicated on this key
fn event_key(event: &HtlcEvent) -> String {
    format!("{}:{}:{}", event.chain, event.contract_id, event.name())
}

/// Holds a running flag until dropped
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag.clone()))
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn same_address(chain: Chain, a: &str, b: &str) -> bool {
    match chain {
        Chain::Evm => a.trim().eq_ignore_ascii_case(b.trim()),
        Chain::Aptos => normalize_address(a) == normalize_address(b),
    }
}

/// Drives every swap from initiation to a terminal state
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn SwapStore>,
    adapters: ChainAdapters,
    clock: Arc<dyn Clock>,
    queue: SwapQueue,
    settings: CoordinatorSettings,
    /// Events whose handling hit a retryable error, replayed by the retry pass
    parked: Arc<DashMap<String, HtlcEvent>>,
    retry_running: Arc<AtomicBool>,
    sweep_running: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn SwapStore>,
        adapters: ChainAdapters,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            adapters,
            clock,
            queue: SwapQueue::new(),
            settings,
            parked: Arc::new(DashMap::new()),
            retry_running: Arc::new(AtomicBool::new(false)),
            sweep_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Swaps with queued or running work
    pub fn active_swaps(&self) -> usize {
        self.queue.active()
    }

    /// Validate and persist a new `PENDING` swap, returning its id
    pub async fn initiate_swap(&self, request: SwapRequest) -> RelayerResult<String> {
        let destination_timelock = self.validate_request(&request, self.clock.now())?;

        if let Some(existing) = self.store.find_by_hashlock(&request.hashlock).await? {
            return Err(RelayerError::Validation(format!(
                "hashlock {} is already used by swap {}",
                request.hashlock, existing.id
            )));
        }

        let swap = Swap::new(
            Uuid::new_v4().to_string(),
            request,
            destination_timelock,
            Utc::now(),
        );
        self.store.insert_swap(&swap).await?;

        crate::metrics::record_swap_initiated(swap.direction);
        info!(
            "Swap {} initiated: {} amount {} timelock {} (destination {})",
            swap.id,
            swap.direction.as_str(),
            swap.amount,
            swap.timelock,
            swap.destination_timelock
        );
        Ok(swap.id)
    }

    /// Returns the destination leg's timelock
    fn validate_request(&self, request: &SwapRequest, now: u64) -> RelayerResult<u64> {
        let required = [
            ("sender", &request.sender),
            ("recipient", &request.recipient),
            ("fromTokenAddress", &request.from_token_address),
            ("toTokenAddress", &request.to_token_address),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(RelayerError::Validation(format!("{} must not be empty", field)));
            }
        }
        if request.amount.is_zero() {
            return Err(RelayerError::Validation("amount must be positive".into()));
        }

        let destination_timelock = request
            .timelock
            .saturating_sub(self.settings.timelock_safety_margin_secs);
        let earliest = now + self.settings.min_timelock_window_secs;
        if destination_timelock <= earliest {
            return Err(RelayerError::Validation(format!(
                "timelock {} is too soon: the destination leg would expire at {}, which must be after {}",
                request.timelock, destination_timelock, earliest
            )));
        }

        Ok(destination_timelock)
    }

    /// Queue an event behind earlier work for its swap.
    ///
    /// Returns `None` when the event belongs to no known swap. The returned
    /// receiver may be dropped; the work still runs.
    pub async fn handle_event(&self, event: HtlcEvent) -> RelayerResult<Option<Completion>> {
        let Some(swap) = self.locate(&event).await? else {
            debug!(
                "No swap for {} {} on {}",
                event.name(),
                event.contract_id,
                event.chain
            );
            return Ok(None);
        };

        let this = self.clone();
        let swap_id = swap.id;
        let key = swap_id.clone();
        Ok(Some(self.queue.submit(&key, async move {
            let result = this.apply_event(&swap_id, event.clone()).await;
            match &result {
                Err(e) if e.is_retryable() => {
                    warn!("Event for swap {} not applied, will replay: {}", swap_id, e);
                    this.park(event);
                }
                Err(e) => warn!("Event for swap {} not applied: {}", swap_id, e),
                Ok(()) => {}
            }
            result
        })))
    }

    /// Keep an event for the next retry pass. Watchers checkpoint once an
    /// event is queued, so nothing else would deliver it again.
    fn park(&self, event: HtlcEvent) {
        self.parked.insert(event_key(&event), event);
    }

    /// Dispatch parked events again and wait for them; returns how many ran
    async fn replay_parked(&self) -> usize {
        let keys: Vec<String> = self.parked.iter().map(|entry| entry.key().clone()).collect();
        let events: Vec<HtlcEvent> = keys
            .iter()
            .filter_map(|key| self.parked.remove(key).map(|(_, event)| event))
            .collect();
        if events.is_empty() {
            return 0;
        }
        debug!("Replaying {} parked events", events.len());

        let mut pending = Vec::new();
        for event in events {
            match self.handle_event(event.clone()).await {
                Ok(Some(done)) => pending.push(done),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!("Parked {} still undeliverable: {}", event.name(), e);
                    self.park(event);
                }
                Err(e) => error!("Dropping parked {}: {}", event.name(), e),
            }
        }

        let count = pending.len();
        // Failures re-park themselves in the worker
        for done in pending {
            let _ = done.await;
        }
        count
    }

    async fn locate(&self, event: &HtlcEvent) -> RelayerResult<Option<Swap>> {
        match &event.kind {
            // First sighting of a leg: its address is not stored yet
            HtlcEventKind::Created { hashlock, .. } => self.store.find_by_hashlock(hashlock).await,
            HtlcEventKind::Withdrawn { preimage } => {
                let found = self
                    .store
                    .find_by_htlc_address(event.chain, &event.contract_id)
                    .await?;
                match found {
                    Some(swap) => Ok(Some(swap)),
                    None => {
                        self.store
                            .find_by_hashlock(&Hashlock::from_preimage(preimage))
                            .await
                    }
                }
            }
            HtlcEventKind::Refunded => {
                self.store
                    .find_by_htlc_address(event.chain, &event.contract_id)
                    .await
            }
        }
    }

    async fn apply_event(&self, swap_id: &str, event: HtlcEvent) -> RelayerResult<()> {
        // Re-read: earlier queued work may have moved the swap on
        let swap = self
            .store
            .get_swap(swap_id)
            .await?
            .ok_or_else(|| RelayerError::SwapNotFound {
                swap_id: swap_id.to_string(),
            })?;

        match &event.kind {
            HtlcEventKind::Created { .. } => self.on_created(swap, &event).await,
            HtlcEventKind::Withdrawn { preimage } => {
                self.on_withdrawn(swap, event.chain, &event.contract_id, preimage.clone())
                    .await
            }
            HtlcEventKind::Refunded => self.on_refunded(swap).await,
        }
    }

    async fn on_created(&self, swap: Swap, event: &HtlcEvent) -> RelayerResult<()> {
        let HtlcEventKind::Created {
            sender,
            receiver,
            token,
            amount,
            timelock,
            ..
        } = &event.kind
        else {
            return Ok(());
        };

        let source = swap.source_chain();
        if event.chain != source {
            return self.adopt_destination_leg(swap, event, sender, *timelock).await;
        }
        if swap.status != SwapStatus::Pending {
            debug!(
                "Ignoring repeated HTLCCreated {} for swap {} in {}",
                event.contract_id, swap.id, swap.status
            );
            return Ok(());
        }

        let relayer = self.adapters.get(source).relayer_address();
        if *timelock != swap.timelock_for(source)
            || *amount != swap.amount
            || !same_address(source, receiver, &relayer)
            || !same_address(source, token, swap.token_for(source))
        {
            warn!(
                "HTLC {} on {} does not match swap {} (timelock {}, amount {}, receiver {}, token {}); ignoring",
                event.contract_id, source, swap.id, timelock, amount, receiver, token
            );
            return Ok(());
        }

        match self.query_state(source, &event.contract_id).await? {
            HtlcState::Locked => {}
            state => {
                warn!(
                    "HTLC {} on {} is {:?}, not locked; ignoring creation event",
                    event.contract_id, source, state
                );
                return Ok(());
            }
        }

        let Some(swap) = self
            .transition(
                &swap,
                SwapStatus::created_for(source),
                SwapUpdate::htlc_address(source, &event.contract_id),
            )
            .await?
        else {
            return Ok(());
        };

        self.create_destination_leg(swap).await
    }

    /// Record a destination lock the relayer made but never stored, e.g.
    /// when confirmation timed out after the transaction landed.
    async fn adopt_destination_leg(
        &self,
        swap: Swap,
        event: &HtlcEvent,
        sender: &str,
        timelock: u64,
    ) -> RelayerResult<()> {
        let destination = swap.destination_chain();
        if !swap.status.is_htlc_created() || swap.htlc_address(destination).is_some() {
            return Ok(());
        }

        let relayer = self.adapters.get(destination).relayer_address();
        if !same_address(destination, sender, &relayer) || timelock != swap.timelock_for(destination) {
            debug!(
                "HTLC {} on {} shares swap {}'s hashlock but is not our destination leg",
                event.contract_id, destination, swap.id
            );
            return Ok(());
        }

        info!(
            "Recording destination HTLC {} on {} for swap {}",
            event.contract_id, destination, swap.id
        );
        self.transition(
            &swap,
            swap.status,
            SwapUpdate::htlc_address(destination, &event.contract_id),
        )
        .await?;
        Ok(())
    }

    /// Lock the relayer's funds for the recipient on the destination chain
    async fn create_destination_leg(&self, swap: Swap) -> RelayerResult<()> {
        let destination = swap.destination_chain();
        if !swap.status.is_htlc_created() || swap.htlc_address(destination).is_some() {
            return Ok(());
        }

        let now = self.clock.now();
        if now + self.settings.min_timelock_window_secs > swap.destination_timelock {
            warn!(
                "Too late to lock the destination leg of swap {} (would expire at {}); leaving the source leg to the refund sweep",
                swap.id, swap.destination_timelock
            );
            return Ok(());
        }

        let params = HtlcParams {
            receiver: swap.recipient.clone(),
            hashlock: swap.hashlock,
            timelock: swap.destination_timelock,
            token: swap.to_token_address.clone(),
            amount: swap.amount.clone(),
        };

        match self.adapters.get(destination).create_htlc(&params).await {
            Ok(receipt) => {
                info!(
                    "Locked destination HTLC {} on {} for swap {} in {}",
                    receipt.contract_id, destination, swap.id, receipt.tx_hash
                );
                let stored = self
                    .transition(
                        &swap,
                        swap.status,
                        SwapUpdate::htlc_address(destination, receipt.contract_id.clone()),
                    )
                    .await?;
                if stored.is_none() {
                    error!(
                        "Swap {} moved on while locking destination HTLC {}; the lock is not recorded",
                        swap.id, receipt.contract_id
                    );
                }
                Ok(())
            }
            Err(e) if e.class() == FailureClass::Transient => {
                warn!(
                    "Destination lock for swap {} failed, will retry: {}",
                    swap.id, e
                );
                Ok(())
            }
            Err(e) => {
                self.fail_on(&swap, "destination HTLC creation", &e).await?;
                Ok(())
            }
        }
    }

    async fn on_withdrawn(
        &self,
        swap: Swap,
        chain: Chain,
        contract_id: &str,
        preimage: Preimage,
    ) -> RelayerResult<()> {
        if !swap.status.is_htlc_created() && swap.status != SwapStatus::PreimageRevealed {
            debug!("Ignoring reveal for swap {} in {}", swap.id, swap.status);
            return Ok(());
        }
        if !preimage.verify(&swap.hashlock) {
            warn!(
                "Rejecting reveal from HTLC {} on {}: preimage does not match swap {}",
                contract_id, chain, swap.id
            );
            return Err(RelayerError::Validation(format!(
                "preimage does not match hashlock {} of swap {}",
                swap.hashlock, swap.id
            )));
        }

        if swap.leg_for_address(chain, contract_id).is_none() {
            debug!(
                "Reveal for swap {} came from untracked HTLC {} on {}",
                swap.id, contract_id, chain
            );
        }

        self.reveal(swap, preimage, Some((chain, contract_id)))
            .await
            .map(|_| ())
    }

    /// Store the preimage, then claim the source leg with it
    async fn reveal(
        &self,
        swap: Swap,
        preimage: Preimage,
        revealed_on: Option<(Chain, &str)>,
    ) -> RelayerResult<Swap> {
        let swap = if swap.status.is_htlc_created() {
            match self
                .transition(&swap, SwapStatus::PreimageRevealed, SwapUpdate::preimage(preimage))
                .await?
            {
                Some(updated) => updated,
                None => return Ok(swap),
            }
        } else if swap.status == SwapStatus::PreimageRevealed {
            swap
        } else {
            return Ok(swap);
        };

        self.complete_revealed(swap, revealed_on).await
    }

    /// Withdraw the source leg, which the relayer receives, and complete the
    /// swap once the chain shows it withdrawn.
    async fn complete_revealed(
        &self,
        swap: Swap,
        revealed_on: Option<(Chain, &str)>,
    ) -> RelayerResult<Swap> {
        let source = swap.source_chain();
        let Some(source_id) = swap.htlc_address(source).map(str::to_string) else {
            return self
                .fail(&swap, "preimage revealed but the source HTLC is unknown")
                .await;
        };
        let Some(preimage) = swap.preimage.clone() else {
            return Err(RelayerError::Internal(format!(
                "swap {} is {} without a preimage",
                swap.id, swap.status
            )));
        };

        if revealed_on != Some((source, source_id.as_str())) {
            match self.query_state(source, &source_id).await {
                Ok(HtlcState::Withdrawn { .. }) => {}
                Ok(HtlcState::Locked) => {
                    match self.adapters.get(source).withdraw(&source_id, &preimage).await {
                        Ok(receipt) => info!(
                            "Withdrew source HTLC {} on {} for swap {} in {}",
                            source_id, source, swap.id, receipt.tx_hash
                        ),
                        Err(ChainError::AlreadyWithdrawn { .. }) => {
                            debug!("Source HTLC {} already withdrawn", source_id)
                        }
                        Err(e) if e.class() == FailureClass::Transient => {
                            warn!(
                                "Withdrawal for swap {} failed, will retry: {}",
                                swap.id, e
                            );
                            return Ok(swap);
                        }
                        Err(e) => {
                            return self.fail_on(&swap, "source HTLC withdrawal", &e).await;
                        }
                    }
                }
                Ok(HtlcState::Refunded) => {
                    return self
                        .fail(&swap, "source HTLC was refunded before it could be withdrawn")
                        .await;
                }
                Ok(HtlcState::Missing) => {
                    return self
                        .fail(&swap, format!("source HTLC {} not found on {}", source_id, source))
                        .await;
                }
                Err(e) if e.class() == FailureClass::Transient => {
                    warn!("Could not read source HTLC of swap {}, will retry: {}", swap.id, e);
                    return Ok(swap);
                }
                Err(e) => {
                    return self.fail_on(&swap, "source HTLC query", &e).await;
                }
            }
        }

        // Events are hints; only the chain decides completion
        match self.query_state(source, &source_id).await {
            Ok(HtlcState::Withdrawn { .. }) => {
                let updated = self
                    .transition(&swap, SwapStatus::Completed, SwapUpdate::completed(Utc::now()))
                    .await?;
                Ok(updated.unwrap_or(swap))
            }
            Ok(state) => {
                warn!(
                    "Source HTLC {} of swap {} is {:?} after withdrawal; will check again",
                    source_id, swap.id, state
                );
                Ok(swap)
            }
            Err(e) => {
                warn!("Could not confirm withdrawal for swap {}: {}", swap.id, e);
                Ok(swap)
            }
        }
    }

    /// Reconcile to `REFUNDED` once every existing leg is refunded
    async fn on_refunded(&self, swap: Swap) -> RelayerResult<()> {
        if swap.status.is_terminal() || swap.preimage.is_some() {
            return Ok(());
        }

        let legs = swap.legs();
        if legs.is_empty() {
            return Ok(());
        }
        for (chain, contract_id) in &legs {
            match self.query_state(*chain, contract_id).await? {
                HtlcState::Refunded => {}
                state => {
                    debug!(
                        "Swap {} leg {} on {} is {:?}; not reconciling yet",
                        swap.id, contract_id, chain, state
                    );
                    return Ok(());
                }
            }
        }

        self.transition(&swap, SwapStatus::Refunded, SwapUpdate::cancelled(Utc::now()))
            .await?;
        Ok(())
    }

    /// Run a sweep unless one is already running; `None` means it was busy
    pub async fn sweep_now(&self) -> RelayerResult<Option<SweepReport>> {
        let Some(_guard) = RunGuard::acquire(&self.sweep_running) else {
            debug!("Refund sweep already running");
            return Ok(None);
        };
        self.sweep_expired().await.map(Some)
    }

    /// Refund every expired swap whose legs are still locked
    pub async fn sweep_expired(&self) -> RelayerResult<SweepReport> {
        let now = self.clock.now();
        let expired = self.store.find_expired_unresolved(now).await?;

        let mut report = SweepReport {
            selected: expired.len(),
            ..Default::default()
        };
        if expired.is_empty() {
            return Ok(report);
        }
        info!("Refund sweep selected {} expired swaps", expired.len());

        let pending: Vec<_> = expired
            .into_iter()
            .map(|swap| {
                let this = self.clone();
                let id = swap.id.clone();
                let done = self
                    .queue
                    .submit(&swap.id, async move { this.sweep_one(&id).await });
                (swap.id, done)
            })
            .collect();

        for (id, done) in pending {
            match done.await {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(e)) => {
                    error!("Refund sweep failed for swap {}: {}", id, e);
                    report.errors += 1;
                }
                Err(_) => {
                    error!("Refund sweep for swap {} was dropped", id);
                    report.errors += 1;
                }
            }
        }

        crate::metrics::record_sweep(report.refunded, report.failed);
        info!("Refund sweep finished: {:?}", report);
        Ok(report)
    }

    async fn sweep_one(&self, id: &str) -> RelayerResult<SweepOutcome> {
        let Some(swap) = self.store.get_swap(id).await? else {
            return Ok(SweepOutcome::Skipped);
        };
        if !swap.status.is_htlc_created() || !swap.is_expired(self.clock.now()) {
            return Ok(SweepOutcome::Skipped);
        }

        let mut settled = true;
        // Destination first: if the recipient claimed it, the source leg
        // must be withdrawn rather than refunded.
        let mut legs = swap.legs();
        legs.reverse();

        for (chain, contract_id) in legs {
            let state = match self.query_state(chain, &contract_id).await {
                Ok(state) => state,
                Err(e) if e.class() == FailureClass::Transient => {
                    warn!("Could not read HTLC {} on {}: {}", contract_id, chain, e);
                    settled = false;
                    continue;
                }
                Err(e) => {
                    self.fail_on(&swap, &format!("state query for HTLC {}", contract_id), &e)
                        .await?;
                    return Ok(SweepOutcome::Failed);
                }
            };

            match state {
                HtlcState::Locked => match self.adapters.get(chain).refund(&contract_id).await {
                    Ok(receipt) => info!(
                        "Refunded HTLC {} on {} for swap {} in {}",
                        contract_id, chain, swap.id, receipt.tx_hash
                    ),
                    Err(ChainError::AlreadyRefunded { .. }) => {
                        debug!("HTLC {} on {} already refunded", contract_id, chain)
                    }
                    Err(ChainError::AlreadyWithdrawn { .. }) => {
                        // Completed between selection and refund
                        match self.query_state(chain, &contract_id).await {
                            Ok(HtlcState::Withdrawn {
                                preimage: Some(preimage),
                            }) => {
                                return self.sweep_reveal(swap, chain, &contract_id, preimage).await;
                            }
                            _ => settled = false,
                        }
                    }
                    Err(e) if e.class() == FailureClass::Transient => {
                        warn!("Refund of HTLC {} on {} failed, will retry: {}", contract_id, chain, e);
                        settled = false;
                    }
                    Err(e) => {
                        self.fail_on(&swap, &format!("refund of HTLC {}", contract_id), &e)
                            .await?;
                        return Ok(SweepOutcome::Failed);
                    }
                },
                HtlcState::Refunded => {}
                HtlcState::Withdrawn {
                    preimage: Some(preimage),
                } => {
                    return self.sweep_reveal(swap, chain, &contract_id, preimage).await;
                }
                HtlcState::Withdrawn { preimage: None } => {
                    warn!(
                        "HTLC {} on {} was withdrawn but its preimage is unknown; waiting for the event",
                        contract_id, chain
                    );
                    settled = false;
                }
                HtlcState::Missing => warn!(
                    "HTLC {} on {} for swap {} no longer exists; treating it as settled",
                    contract_id, chain, swap.id
                ),
            }
        }

        if !settled {
            return Ok(SweepOutcome::Retry);
        }

        match self
            .transition(&swap, SwapStatus::Refunded, SwapUpdate::cancelled(Utc::now()))
            .await?
        {
            Some(_) => Ok(SweepOutcome::Refunded),
            None => Ok(SweepOutcome::Skipped),
        }
    }

    async fn sweep_reveal(
        &self,
        swap: Swap,
        chain: Chain,
        contract_id: &str,
        preimage: Preimage,
    ) -> RelayerResult<SweepOutcome> {
        if !preimage.verify(&swap.hashlock) {
            self.fail(&swap, format!("HTLC {} on {} holds a foreign preimage", contract_id, chain))
                .await?;
            return Ok(SweepOutcome::Failed);
        }

        info!(
            "Swap {} was claimed on {} before the sweep; completing instead of refunding",
            swap.id, chain
        );
        let swap = self.reveal(swap, preimage, Some((chain, contract_id))).await?;
        Ok(match swap.status {
            SwapStatus::Completed => SweepOutcome::Completed,
            SwapStatus::Failed => SweepOutcome::Failed,
            _ => SweepOutcome::Retry,
        })
    }

    /// Replay parked events, retry destination locks and withdrawals that
    /// stalled on transient errors, and fail pending swaps whose source lock
    /// never arrived. Returns the number of events and swaps revisited.
    pub async fn retry_stalled(&self) -> RelayerResult<usize> {
        let replayed = self.replay_parked().await;

        let now = self.clock.now();
        let mut candidates = Vec::new();

        for swap in self.store.find_by_status(SwapStatus::Pending).await? {
            if swap.is_expired(now) {
                candidates.push(swap.id);
            }
        }
        for status in [SwapStatus::EvmHtlcCreated, SwapStatus::AptosHtlcCreated] {
            for swap in self.store.find_by_status(status).await? {
                if swap.htlc_address(swap.destination_chain()).is_none() && !swap.is_expired(now) {
                    candidates.push(swap.id);
                }
            }
        }
        for swap in self.store.find_by_status(SwapStatus::PreimageRevealed).await? {
            candidates.push(swap.id);
        }

        let count = candidates.len();
        let pending: Vec<_> = candidates
            .into_iter()
            .map(|id| {
                let this = self.clone();
                let key = id.clone();
                let done = self.queue.submit(&key, async move { this.retry_one(&id).await });
                (key, done)
            })
            .collect();

        for (id, done) in pending {
            match done.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Retry for swap {} failed: {}", id, e),
                Err(_) => error!("Retry for swap {} was dropped", id),
            }
        }

        if count > 0 {
            debug!("Retried {} stalled swaps", count);
        }
        Ok(replayed + count)
    }

    async fn retry_one(&self, id: &str) -> RelayerResult<()> {
        let Some(swap) = self.store.get_swap(id).await? else {
            return Ok(());
        };
        let now = self.clock.now();

        match swap.status {
            SwapStatus::Pending if swap.is_expired(now) => {
                self.fail(&swap, "source HTLC was not locked before the timelock expired")
                    .await?;
            }
            status if status.is_htlc_created() && !swap.is_expired(now) => {
                self.create_destination_leg(swap).await?;
            }
            SwapStatus::PreimageRevealed => {
                self.complete_revealed(swap, None).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Consume watcher events and timer ticks until shutdown
    pub async fn run(self, mut events: mpsc::Receiver<HtlcEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = interval(self.settings.sweep_interval);
        let mut retry = interval(self.settings.retry_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Swap coordinator started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}

                event = events.recv() => match event {
                    // Completion is reported by the worker
                    Some(event) => {
                        match self.handle_event(event.clone()).await {
                            Ok(_) => {}
                            Err(e) if e.is_retryable() => {
                                warn!("Could not dispatch {}, will replay: {}", event.name(), e);
                                self.park(event);
                            }
                            Err(e) => error!("Error dispatching event: {}", e),
                        }
                    }
                    None => {
                        info!("Event queue closed");
                        break;
                    }
                },

                _ = retry.tick() => self.spawn_retry(),

                _ = sweep.tick() => self.spawn_sweep(),
            }
        }

        info!("Swap coordinator stopped");
    }

    fn spawn_retry(&self) {
        let Some(guard) = RunGuard::acquire(&self.retry_running) else {
            debug!("Previous retry pass still running");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.retry_stalled().await {
                error!("Retry pass failed: {}", e);
            }
        });
    }

    fn spawn_sweep(&self) {
        let Some(guard) = RunGuard::acquire(&self.sweep_running) else {
            debug!("Previous refund sweep still running");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.retry_stalled().await {
                error!("Retry pass failed: {}", e);
            }
            if let Err(e) = this.sweep_expired().await {
                error!("Refund sweep failed: {}", e);
            }
        });
    }

    /// Conditional write from the status `swap` was read in
    async fn transition(
        &self,
        swap: &Swap,
        new: SwapStatus,
        update: SwapUpdate,
    ) -> RelayerResult<Option<Swap>> {
        let updated = self
            .store
            .update_status(&swap.id, swap.status, new, update)
            .await?;

        match &updated {
            Some(_) if new != swap.status => {
                info!("Swap {}: {} -> {}", swap.id, swap.status, new);
                crate::metrics::record_transition(new);
            }
            Some(_) => {}
            None => debug!(
                "Swap {} is no longer {}; skipping write to {}",
                swap.id, swap.status, new
            ),
        }
        Ok(updated)
    }

    /// Fail on a chain error, keeping the node's message out of the record
    async fn fail_on(&self, swap: &Swap, action: &str, err: &ChainError) -> RelayerResult<Swap> {
        error!("Swap {}: {} failed: {}", swap.id, action, err);
        self.fail(swap, failure_reason(action, err)).await
    }

    async fn fail(&self, swap: &Swap, reason: impl Into<String>) -> RelayerResult<Swap> {
        let reason = reason.into();
        error!("Swap {} failed: {}", swap.id, reason);
        let updated = self
            .transition(swap, SwapStatus::Failed, SwapUpdate::failed(reason))
            .await?;
        Ok(updated.unwrap_or_else(|| swap.clone()))
    }

    async fn query_state(&self, chain: Chain, contract_id: &str) -> Result<HtlcState, ChainError> {
        let adapter = self.adapters.get(chain);
        let mut attempt = 0;
        loop {
            match adapter.get_htlc_state(contract_id).await {
                Err(e)
                    if e.class() == FailureClass::Transient && attempt < self.settings.max_retries =>
                {
                    attempt += 1;
                    debug!(
                        "Retrying state query for {} on {} ({}/{}): {}",
                        contract_id, chain, attempt, self.settings.max_retries, e
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                result => return result,
            }
        }
    }
}
