//! Sync scheduler: cadence, mutual exclusion and failover.
//!
//! The `SyncScheduler` owns everything that changes over time for the active wallet: the last
//! snapshot, the hydrated cache, balances, history, the poll interval, the push subscription and
//! the current indexer endpoint. It runs on a single task; [`SyncScheduler::run`] multiplexes the
//! poll timer, push events, commands, reconnect attempts and the one in-flight cycle with
//! `tokio::select!`.
//!
//! Cadence:
//! - no push subscription: poll every `refresh_disconnected` (1 s)
//! - push subscription active: poll every `refresh_connected` (30 s)
//! - a mempool push event shortens the interval to `refresh_triggered` (10 ms); the next cycle
//!   restores the normal interval when it starts
//!
//! Readers observe the wallet through a `watch` channel carrying a fully built [`WalletView`].

use crate::config::SyncConfig;
use crate::indexer::{
    ChronikIndexerClient, ChronikWsConnector, IndexerError, IndexerService, PushEvent,
    PushEventKind, PushSubscription, SubscriptionConnector,
};
use crate::wallet::sync::balances::BalanceAggregator;
use crate::wallet::sync::cycle::{CycleInput, CycleOutcome, SyncPhase, run_cycle};
use crate::wallet::sync::endpoints::EndpointFailoverManager;
use crate::wallet::sync::events::{
    NotificationSink, WalletNotification, balance_delta_notifications,
};
use crate::wallet::sync::hydration::HydratedUtxoCache;
use crate::wallet::sync::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::wallet::sync::repositories::FileKeyValueStore;
use crate::wallet::sync::state_persistence::{
    CacheValidation, PersistedWalletState, STATE_VERSION, StatePersistenceService,
};
use crate::wallet::sync::subscriptions::{SubscriptionStatus, reconcile_subscriptions};
use crate::wallet::{
    TokenBalance, TxHistoryEntry, UtxoSnapshot, WalletBalance, WalletHandle, WalletSyncError,
};

use backoff::{ExponentialBackoff, future::retry};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

/// A running cycle, resolving to the generation it was started for and its result.
pub type CycleTask = BoxFuture<'static, (u64, Result<CycleOutcome, WalletSyncError>)>;

type ReconnectTask = BoxFuture<'static, Result<Box<dyn PushSubscription>, WalletSyncError>>;

/// Commands accepted by [`SyncScheduler::run`].
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Make `WalletHandle` the wallet being synchronized, discarding the previous one.
    ActivateWallet(WalletHandle),
    Shutdown,
}

/// Read-only snapshot of the synchronized wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalletView {
    pub wallet_name: Option<String>,
    pub balance: WalletBalance,
    pub tokens: Vec<TokenBalance>,
    pub history: Vec<TxHistoryEntry>,
    /// The last cycle failed.
    pub api_error: bool,
    /// Every endpoint failed since the last successful cycle.
    pub endpoints_exhausted: bool,
    pub subscription: SubscriptionStatus,
    pub active_endpoint: String,
    /// A cycle has succeeded since the wallet was activated.
    pub synced: bool,
}

/// State of the active wallet. Replaced wholesale on wallet switch.
#[derive(Debug)]
struct SyncState {
    wallet: WalletHandle,
    generation: u64,
    snapshot: Option<UtxoSnapshot>,
    cache: Option<HydratedUtxoCache>,
    aggregator: BalanceAggregator,
    balance: WalletBalance,
    history: Vec<TxHistoryEntry>,
    pending_txids: Vec<String>,
    api_error: bool,
    synced: bool,
}

impl SyncState {
    fn new(wallet: WalletHandle, generation: u64) -> Self {
        Self {
            wallet,
            generation,
            snapshot: None,
            cache: None,
            aggregator: BalanceAggregator::new(),
            balance: WalletBalance::default(),
            history: Vec::new(),
            pending_txids: Vec::new(),
            api_error: false,
            synced: false,
        }
    }

    fn restore(&mut self, stored: PersistedWalletState) {
        self.snapshot = Some(stored.snapshot);
        self.cache = Some(HydratedUtxoCache::from_map(stored.hydrated));
        self.aggregator = BalanceAggregator::from_tokens(stored.tokens);
        self.balance = stored.balance;
        self.history = stored.history;
    }

    fn to_persisted(&self) -> Option<PersistedWalletState> {
        Some(PersistedWalletState {
            version: STATE_VERSION,
            wallet_name: self.wallet.name.clone(),
            addresses: self.wallet.addresses.clone(),
            snapshot: self.snapshot.clone()?,
            hydrated: self.cache.as_ref()?.utxos().clone(),
            tokens: self.aggregator.tokens().cloned().collect(),
            balance: self.balance.clone(),
            history: self.history.clone(),
            saved_at: chrono::Utc::now(),
        })
    }
}

pub struct SyncScheduler {
    config: SyncConfig,
    endpoints: EndpointFailoverManager<Arc<dyn IndexerService>>,
    connector: Option<Arc<dyn SubscriptionConnector>>,
    persistence: StatePersistenceService,
    sink: Arc<dyn NotificationSink>,

    state: Option<SyncState>,
    generation: u64,
    interval: Duration,
    cycle_in_progress: bool,
    /// Mempool txids handed to the running cycle, requeued if it fails.
    inflight_txids: Vec<String>,
    /// Whether the running cycle started without a push subscription.
    inflight_polling: bool,

    subscription: Option<Box<dyn PushSubscription>>,
    subscription_status: SubscriptionStatus,
    reconnect: Option<ReconnectTask>,

    view_tx: watch::Sender<WalletView>,
    phase_tx: Arc<watch::Sender<SyncPhase>>,
    progress: SyncProgressTracker,
}

impl SyncScheduler {
    pub fn new(
        config: SyncConfig,
        indexers: Vec<Arc<dyn IndexerService>>,
        connector: Option<Arc<dyn SubscriptionConnector>>,
        persistence: StatePersistenceService,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, WalletSyncError> {
        let endpoints = EndpointFailoverManager::new(indexers)?;
        let interval = config.refresh_disconnected;
        let (view_tx, _) = watch::channel(WalletView {
            active_endpoint: endpoints.current().endpoint().to_string(),
            ..WalletView::default()
        });
        let (phase_tx, _) = watch::channel(SyncPhase::Idle);

        Ok(Self {
            config,
            endpoints,
            connector,
            persistence,
            sink,
            state: None,
            generation: 0,
            interval,
            cycle_in_progress: false,
            inflight_txids: Vec::new(),
            inflight_polling: true,
            subscription: None,
            subscription_status: SubscriptionStatus::Inactive,
            reconnect: None,
            view_tx,
            phase_tx: Arc::new(phase_tx),
            progress: SyncProgressTracker::new(),
        })
    }

    /// Build a scheduler talking to the Chronik endpoints of `config`, persisting under
    /// `config.data_dir`.
    pub fn from_config(
        config: SyncConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, WalletSyncError> {
        let indexers = config
            .indexer_urls
            .iter()
            .map(|url| {
                let client = ChronikIndexerClient::new(url.clone(), config.request_timeout)?;
                Ok(Arc::new(client) as Arc<dyn IndexerService>)
            })
            .collect::<Result<Vec<_>, WalletSyncError>>()?;

        let connector = config
            .ws_url
            .clone()
            .map(|url| Arc::new(ChronikWsConnector::new(url)) as Arc<dyn SubscriptionConnector>);

        let persistence =
            StatePersistenceService::new(Arc::new(FileKeyValueStore::new(config.data_dir.clone())));

        Self::new(config, indexers, connector, persistence, sink)
    }

    pub fn subscribe_view(&self) -> watch::Receiver<WalletView> {
        self.view_tx.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_tx.subscribe()
    }

    pub fn view(&self) -> WalletView {
        self.view_tx.borrow().clone()
    }

    pub fn stats(&self) -> SyncStats {
        self.progress.get_stats()
    }

    /// Interval until the next timer trigger.
    pub fn current_interval(&self) -> Duration {
        self.interval
    }

    pub fn is_cycle_in_progress(&self) -> bool {
        self.cycle_in_progress
    }

    pub fn subscription_status(&self) -> SubscriptionStatus {
        self.subscription_status
    }

    fn base_interval(&self) -> Duration {
        match self.subscription_status {
            SubscriptionStatus::Active => self.config.refresh_connected,
            SubscriptionStatus::Inactive => self.config.refresh_disconnected,
        }
    }

    fn wanted_subscriptions(&self) -> BTreeSet<String> {
        self.state
            .as_ref()
            .map(|state| state.wallet.script_hashes().into_iter().collect())
            .unwrap_or_default()
    }

    fn build_view(&self) -> WalletView {
        let mut view = WalletView {
            subscription: self.subscription_status,
            active_endpoint: self.endpoints.current().endpoint().to_string(),
            endpoints_exhausted: self.endpoints.is_exhausted(),
            ..WalletView::default()
        };

        if let Some(state) = &self.state {
            view.wallet_name = Some(state.wallet.name.clone());
            view.balance = state.balance.clone();
            view.tokens = state.aggregator.tokens().cloned().collect();
            view.history = state.history.clone();
            view.api_error = state.api_error;
            view.synced = state.synced;
        }
        view
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.build_view());
    }

    /// Switch to `wallet`.
    ///
    /// Stored state is restored when it validates; otherwise the first cycle rehydrates. A cycle
    /// still running for the previous wallet keeps running but its result will be discarded.
    pub async fn activate_wallet(&mut self, wallet: WalletHandle) {
        self.generation += 1;
        if self.state.is_some() {
            self.progress.log_progress(true);
        }
        self.progress = SyncProgressTracker::new();
        info!(
            "Activating wallet {} with {} addresses",
            wallet.name,
            wallet.addresses.len()
        );

        let mut state = SyncState::new(wallet, self.generation);
        match self.persistence.restore_state(&state.wallet).await {
            Ok(CacheValidation::Valid(stored)) => state.restore(*stored),
            Ok(CacheValidation::NeedsRebuild(reason)) => info!(
                "Wallet {} starts with a full rehydration: {}",
                state.wallet.name, reason
            ),
            Err(e) => warn!("Could not read stored state of {}: {}", state.wallet.name, e),
        }
        self.state = Some(state);
        self.interval = self.base_interval();

        if let Some(mut subscription) = self.subscription.take() {
            let wanted = self.wanted_subscriptions();
            match reconcile_subscriptions(subscription.as_mut(), &wanted).await {
                Ok(_) => self.subscription = Some(subscription),
                Err(e) => {
                    warn!("Failed to move push subscription to new wallet: {}", e);
                    self.on_subscription_lost();
                }
            }
        }

        self.publish_view();
    }

    /// Start a cycle unless one is already running or no wallet is active.
    pub fn begin_cycle(&mut self) -> Option<CycleTask> {
        if self.cycle_in_progress {
            debug!("Sync cycle still running, dropping trigger");
            return None;
        }

        let base = self.base_interval();
        let state = self.state.as_mut()?;
        self.interval = base;

        let pending_txids = std::mem::take(&mut state.pending_txids);
        self.inflight_txids = pending_txids.clone();
        self.inflight_polling = self.subscription_status == SubscriptionStatus::Inactive;
        let input = CycleInput {
            wallet: state.wallet.clone(),
            previous_snapshot: state.snapshot.clone(),
            cache: state.cache.clone(),
            aggregator: state.aggregator.clone(),
            balance: state.balance.clone(),
            pending_txids,
            history_count: self.config.tx_history_count,
            batch_size: self.config.hydration_batch_size,
        };
        let generation = state.generation;
        self.cycle_in_progress = true;

        let indexer = self.endpoints.current().clone();
        let phase = self.phase_tx.clone();
        debug!("Starting sync cycle against {}", indexer.endpoint());
        Some(async move { (generation, run_cycle(indexer, input, phase).await) }.boxed())
    }

    /// Apply the result of a cycle started by [`SyncScheduler::begin_cycle`].
    ///
    /// Balance deltas are announced only for cycles that started in polling mode without queued
    /// mempool txids. Any other cycle reports through its per-transaction notifications.
    pub async fn finish_cycle(
        &mut self,
        generation: u64,
        result: Result<CycleOutcome, WalletSyncError>,
    ) {
        self.cycle_in_progress = false;
        let inflight = std::mem::take(&mut self.inflight_txids);
        let announce_delta = self.inflight_polling && inflight.is_empty();
        let Some(state) = self
            .state
            .as_mut()
            .filter(|state| state.generation == generation)
        else {
            debug!("Discarding result of cycle from generation {}", generation);
            self.progress.record_discarded();
            return;
        };

        let mut notifications = Vec::new();
        let mut persist = None;
        match result {
            Ok(CycleOutcome::Unchanged {
                notifications: pushed,
                aggregator,
            }) => {
                state.aggregator = aggregator;
                state.api_error = false;
                state.synced = true;
                notifications = pushed;
                self.endpoints.record_success();
                self.progress.record_unchanged();
            }
            Ok(CycleOutcome::Updated(output)) => {
                let output = *output;
                if announce_delta && state.synced {
                    let previous_tokens: Vec<TokenBalance> =
                        state.aggregator.tokens().cloned().collect();
                    let current_tokens: Vec<TokenBalance> =
                        output.aggregator.tokens().cloned().collect();
                    notifications.extend(balance_delta_notifications(
                        &state.wallet.name,
                        (&state.balance, &previous_tokens),
                        (&output.balance, &current_tokens),
                    ));
                }
                notifications.extend(output.notifications);

                state.snapshot = Some(output.snapshot);
                state.cache = Some(output.cache);
                state.aggregator = output.aggregator;
                state.balance = output.balance;
                state.history = output.history;
                state.api_error = false;
                state.synced = true;
                persist = state.to_persisted();

                self.endpoints.record_success();
                self.progress.record_updated(&output.stats);
            }
            Err(e) => {
                state.api_error = true;
                let mut requeued = inflight;
                requeued.append(&mut state.pending_txids);
                state.pending_txids = requeued;

                let next = self.endpoints.report_error().endpoint().to_string();
                warn!("Sync cycle failed: {}; next endpoint {}", e, next);
                if self.endpoints.is_exhausted() {
                    error!(
                        "{}",
                        WalletSyncError::ExhaustedEndpoints {
                            attempts: self.endpoints.consecutive_failures()
                        }
                    );
                }
                self.progress.record_failure(&e.to_string());
            }
        }

        dispatch(self.sink.as_ref(), notifications).await;
        if let Some(persisted) = persist {
            if let Err(e) = self.persistence.save_state(&persisted).await {
                warn!("Failed to persist wallet state: {}", e);
            }
        }
        self.publish_view();
    }

    /// React to a push event. Only mempool arrivals matter; they queue the txid for the next
    /// cycle and shorten the interval.
    pub fn on_push_event(&mut self, event: PushEvent) {
        match event.kind {
            PushEventKind::AddedToMempool => {
                if let (Some(state), Some(txid)) = (self.state.as_mut(), event.txid) {
                    if !state.pending_txids.contains(&txid) {
                        debug!("Queued mempool tx {}", txid);
                        state.pending_txids.push(txid);
                    }
                }
                self.interval = self.config.refresh_triggered;
            }
            other => debug!("Ignoring push event {:?}", other),
        }
    }

    /// Reconcile `subscription` with the wallet's scripts and start using it.
    pub async fn install_subscription(
        &mut self,
        mut subscription: Box<dyn PushSubscription>,
    ) -> Result<(), WalletSyncError> {
        let wanted = self.wanted_subscriptions();
        reconcile_subscriptions(subscription.as_mut(), &wanted).await?;

        self.subscription = Some(subscription);
        self.subscription_status = SubscriptionStatus::Active;
        self.interval = self.base_interval();
        info!("Push subscription active, polling every {:?}", self.interval);
        self.publish_view();
        Ok(())
    }

    /// Fall back to polling and start reconnecting.
    pub fn on_subscription_lost(&mut self) {
        self.subscription = None;
        self.subscription_status = SubscriptionStatus::Inactive;
        self.interval = self.base_interval();
        warn!("Push subscription lost, polling every {:?}", self.interval);
        self.schedule_reconnect();
        self.publish_view();
    }

    /// Handle an error reported by the push subscription.
    ///
    /// A transport failure drops the connection. An error ending a single operation leaves the
    /// connection up, so the wallet's scripts are resubscribed on it.
    pub async fn on_subscription_error(&mut self, error: IndexerError) {
        if matches!(error, IndexerError::WebSocketError(_)) {
            warn!("Push subscription transport failed: {}", error);
            self.on_subscription_lost();
            return;
        }

        warn!("Push subscription error: {}", error);
        let Some(mut subscription) = self.subscription.take() else {
            return;
        };
        let wanted = self.wanted_subscriptions();
        match reconcile_subscriptions(subscription.as_mut(), &wanted).await {
            Ok(_) => self.subscription = Some(subscription),
            Err(e) => {
                warn!("Failed to resubscribe after subscription error: {}", e);
                self.on_subscription_lost();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect.is_some() {
            return;
        }
        if let Some(connector) = &self.connector {
            self.reconnect = Some(reconnect_task(connector.clone(), self.wanted_subscriptions()));
        }
    }

    /// Drive the scheduler until `Shutdown` is received or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>) {
        let mut in_flight: Option<CycleTask> = None;
        let mut next_tick = Instant::now();
        self.schedule_reconnect();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SchedulerCommand::ActivateWallet(wallet)) => {
                        self.activate_wallet(wallet).await;
                        next_tick = Instant::now();
                    }
                    Some(SchedulerCommand::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },
                _ = sleep_until(next_tick) => {
                    if let Some(task) = self.begin_cycle() {
                        in_flight = Some(task);
                    }
                    next_tick = Instant::now() + self.interval;
                },
                (generation, result) = poll_optional(&mut in_flight) => {
                    in_flight = None;
                    self.finish_cycle(generation, result).await;
                    next_tick = next_tick.min(Instant::now() + self.interval);
                },
                event = next_push_event(&mut self.subscription) => match event {
                    Some(Ok(event)) => {
                        self.on_push_event(event);
                        next_tick = next_tick.min(Instant::now() + self.interval);
                    }
                    Some(Err(e)) => self.on_subscription_error(e).await,
                    None => self.on_subscription_lost(),
                },
                connected = poll_optional(&mut self.reconnect) => {
                    self.reconnect = None;
                    match connected {
                        Ok(subscription) => {
                            if let Err(e) = self.install_subscription(subscription).await {
                                warn!("Failed to install push subscription: {}", e);
                                self.on_subscription_lost();
                            }
                        }
                        Err(e) => error!("Giving up on push subscription: {}", e),
                    }
                    next_tick = next_tick.min(Instant::now() + self.interval);
                },
            }
        }

        self.progress.log_progress(true);
    }
}

async fn dispatch(sink: &dyn NotificationSink, notifications: Vec<WalletNotification>) {
    for notification in notifications {
        debug!("Dispatching {:?} to {}", notification, sink.name());
        sink.notify(notification).await;
    }
}

/// Await the future in `slot`, or never resolve when the slot is empty.
async fn poll_optional<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_push_event(
    subscription: &mut Option<Box<dyn PushSubscription>>,
) -> Option<Result<PushEvent, IndexerError>> {
    match subscription {
        Some(subscription) => subscription.next_event().await,
        None => pending().await,
    }
}

/// Connect and reconcile, retrying with exponential backoff until it works.
fn reconnect_task(
    connector: Arc<dyn SubscriptionConnector>,
    wanted: BTreeSet<String>,
) -> ReconnectTask {
    let policy = ExponentialBackoff {
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };

    retry(policy, move || {
        let connector = connector.clone();
        let wanted = wanted.clone();
        async move {
            let mut subscription = connector.connect().await.map_err(|e| {
                warn!("Push subscription connect failed: {}", e);
                backoff::Error::transient(WalletSyncError::from(e))
            })?;
            reconcile_subscriptions(subscription.as_mut(), &wanted)
                .await
                .map_err(|e| {
                    warn!("Push subscription reconcile failed: {}", e);
                    backoff::Error::transient(e)
                })?;
            Ok(subscription)
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::sync::events::ChannelNotificationSink;
    use crate::wallet::sync::repositories::{KeyValueStore, MemoryKeyValueStore};
    use crate::wallet::sync::test_support::*;

    struct Harness {
        scheduler: SyncScheduler,
        indexers: Vec<Arc<FakeIndexer>>,
        store: Arc<MemoryKeyValueStore>,
        notifications: mpsc::UnboundedReceiver<WalletNotification>,
    }

    fn harness(endpoints: &[&str]) -> Harness {
        let indexers: Vec<Arc<FakeIndexer>> =
            endpoints.iter().map(|url| Arc::new(FakeIndexer::new(url))).collect();
        let store = Arc::new(MemoryKeyValueStore::new());
        let (sink, notifications) = ChannelNotificationSink::new();
        let scheduler = SyncScheduler::new(
            SyncConfig::default(),
            indexers
                .iter()
                .map(|indexer| indexer.clone() as Arc<dyn IndexerService>)
                .collect(),
            None,
            StatePersistenceService::new(store.clone()),
            Arc::new(sink),
        )
        .unwrap();

        Harness {
            scheduler,
            indexers,
            store,
            notifications,
        }
    }

    async fn cycle(scheduler: &mut SyncScheduler) {
        let task = scheduler.begin_cycle().expect("cycle should start");
        let (generation, result) = task.await;
        scheduler.finish_cycle(generation, result).await;
    }

    fn mempool(txid: &str) -> PushEvent {
        PushEvent {
            kind: PushEventKind::AddedToMempool,
            txid: Some(txid.to_string()),
        }
    }

    #[tokio::test]
    async fn no_cycle_without_wallet() {
        let mut h = harness(&["https://a.example"]);
        assert!(h.scheduler.begin_cycle().is_none());
    }

    #[tokio::test]
    async fn trigger_during_cycle_is_dropped() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, _) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;

        let task = h.scheduler.begin_cycle().unwrap();
        assert!(h.scheduler.is_cycle_in_progress());
        assert!(h.scheduler.begin_cycle().is_none());

        let (generation, result) = task.await;
        h.scheduler.finish_cycle(generation, result).await;
        assert!(!h.scheduler.is_cycle_in_progress());
        assert!(h.scheduler.begin_cycle().is_some());
    }

    #[tokio::test]
    async fn wallet_switch_discards_stale_result() {
        let mut h = harness(&["https://a.example"]);
        let (first, address) = single_address_wallet();
        h.indexers[0].set_snapshot(
            vec![(address, vec![utxo("A", 0, 5000)])].into_iter().collect(),
        );
        h.scheduler.activate_wallet(first).await;
        let task = h.scheduler.begin_cycle().unwrap();

        let second = WalletHandle::new("second", vec![handle("145", 2)]);
        h.scheduler.activate_wallet(second).await;

        let (generation, result) = task.await;
        assert!(result.is_ok());
        h.scheduler.finish_cycle(generation, result).await;

        let view = h.scheduler.view();
        assert_eq!(view.wallet_name.as_deref(), Some("second"));
        assert_eq!(view.balance, WalletBalance::default());
        assert!(!view.synced);
        assert_eq!(h.scheduler.stats().cycles_discarded, 1);
        assert!(h.store.get("wallet_state_main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_rotates_endpoint_and_flags_error() {
        let mut h = harness(&["https://a.example", "https://b.example"]);
        let (wallet, address) = single_address_wallet();
        let snapshot: UtxoSnapshot =
            vec![(address, vec![utxo("A", 0, 1000)])].into_iter().collect();
        h.indexers[0].set_failing(true);
        h.indexers[1].set_snapshot(snapshot);
        h.scheduler.activate_wallet(wallet).await;

        cycle(&mut h.scheduler).await;
        let view = h.scheduler.view();
        assert!(view.api_error);
        assert!(!view.endpoints_exhausted);
        assert_eq!(view.active_endpoint, "https://b.example");
        assert_eq!(view.balance, WalletBalance::default());

        cycle(&mut h.scheduler).await;
        let view = h.scheduler.view();
        assert!(!view.api_error);
        assert_eq!(view.balance.spendable_display.to_string(), "10.00");
    }

    #[tokio::test]
    async fn full_rotation_of_failures_is_exhaustion() {
        let mut h = harness(&["https://a.example", "https://b.example"]);
        let (wallet, _) = single_address_wallet();
        for indexer in &h.indexers {
            indexer.set_failing(true);
        }
        h.scheduler.activate_wallet(wallet).await;

        cycle(&mut h.scheduler).await;
        assert!(!h.scheduler.view().endpoints_exhausted);
        cycle(&mut h.scheduler).await;
        assert!(h.scheduler.view().endpoints_exhausted);

        h.indexers[0].set_failing(false);
        cycle(&mut h.scheduler).await;
        let view = h.scheduler.view();
        assert!(!view.endpoints_exhausted);
        assert!(!view.api_error);
    }

    #[tokio::test]
    async fn push_event_shortens_interval_until_next_cycle() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, _) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, _handle) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();
        assert_eq!(h.scheduler.current_interval(), Duration::from_secs(30));

        h.scheduler.on_push_event(PushEvent {
            kind: PushEventKind::Confirmed,
            txid: Some("x".to_string()),
        });
        assert_eq!(h.scheduler.current_interval(), Duration::from_secs(30));

        h.scheduler.on_push_event(mempool("x"));
        assert_eq!(h.scheduler.current_interval(), Duration::from_millis(10));

        let task = h.scheduler.begin_cycle().unwrap();
        assert_eq!(h.scheduler.current_interval(), Duration::from_secs(30));
        let (generation, result) = task.await;
        h.scheduler.finish_cycle(generation, result).await;
    }

    #[tokio::test]
    async fn subscription_follows_active_wallet() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;

        let (subscription, remote) = FakeSubscription::new(&["stale"]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();
        assert_eq!(remote.active(), vec![address.hash160.clone()]);
        assert_eq!(h.scheduler.view().subscription, SubscriptionStatus::Active);

        let other = handle("145", 7);
        h.scheduler
            .activate_wallet(WalletHandle::new("second", vec![other.clone()]))
            .await;
        assert_eq!(remote.active(), vec![other.hash160]);
    }

    #[tokio::test]
    async fn lost_subscription_falls_back_to_polling() {
        let mut h = harness(&["https://a.example"]);
        let (subscription, _handle) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();

        h.scheduler.on_subscription_lost();
        assert_eq!(h.scheduler.subscription_status(), SubscriptionStatus::Inactive);
        assert_eq!(h.scheduler.current_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn polling_notifies_on_balance_increase_after_first_cycle() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.indexers[0].set_snapshot(
            vec![(address.clone(), vec![utxo("A", 0, 1000)])].into_iter().collect(),
        );
        h.scheduler.activate_wallet(wallet).await;

        cycle(&mut h.scheduler).await;
        assert!(h.notifications.try_recv().is_err());

        h.indexers[0].add_token_utxo("T", 1, "tok", 250);
        h.indexers[0].add_genesis("tok", 2, "Test Token", "TT");
        h.indexers[0].set_snapshot(
            vec![(address, vec![utxo("A", 0, 1000), utxo("B", 0, 2500), utxo("T", 1, 546)])]
                .into_iter()
                .collect(),
        );
        cycle(&mut h.scheduler).await;

        assert_eq!(
            h.notifications.try_recv().unwrap(),
            WalletNotification::BalanceIncreased {
                wallet: "main".to_string(),
                amount: "25.00".parse().unwrap(),
                new_balance: "35.00".parse().unwrap(),
            }
        );
        assert!(matches!(
            h.notifications.try_recv().unwrap(),
            WalletNotification::TokenReceived { ref ticker, amount, .. }
                if ticker == "TT" && amount.to_string() == "2.50"
        ));
    }

    #[tokio::test]
    async fn push_path_notifies_from_mempool_tx() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, _handle) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();
        cycle(&mut h.scheduler).await;

        h.indexers[0].set_snapshot(
            vec![(address.clone(), vec![utxo("in", 0, 700)])].into_iter().collect(),
        );
        h.indexers[0].add_tx(incoming_tx("in", &address.hash160, 700, 1));
        h.scheduler.on_push_event(mempool("in"));
        cycle(&mut h.scheduler).await;

        assert!(matches!(
            h.notifications.try_recv().unwrap(),
            WalletNotification::BalanceIncreased { amount, new_balance, .. }
                if amount.to_string() == "7.00" && new_balance.to_string() == "7.00"
        ));
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_queued_before_fallback_notifies_once() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, _remote) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();
        cycle(&mut h.scheduler).await;

        h.indexers[0].set_snapshot(
            vec![(address.clone(), vec![utxo("in", 0, 700)])].into_iter().collect(),
        );
        h.indexers[0].add_tx(incoming_tx("in", &address.hash160, 700, 1));
        h.scheduler.on_push_event(mempool("in"));
        h.scheduler.on_subscription_lost();
        cycle(&mut h.scheduler).await;

        assert!(matches!(
            h.notifications.try_recv().unwrap(),
            WalletNotification::BalanceIncreased { amount, .. } if amount.to_string() == "7.00"
        ));
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_installed_mid_cycle_keeps_polling_delta() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.indexers[0].set_snapshot(
            vec![(address.clone(), vec![utxo("A", 0, 1000)])].into_iter().collect(),
        );
        h.scheduler.activate_wallet(wallet).await;
        cycle(&mut h.scheduler).await;

        h.indexers[0].set_snapshot(
            vec![(address, vec![utxo("A", 0, 1000), utxo("B", 0, 500)])]
                .into_iter()
                .collect(),
        );
        let task = h.scheduler.begin_cycle().unwrap();
        let (subscription, _remote) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();
        let (generation, result) = task.await;
        h.scheduler.finish_cycle(generation, result).await;

        assert!(matches!(
            h.notifications.try_recv().unwrap(),
            WalletNotification::BalanceIncreased { amount, new_balance, .. }
                if amount.to_string() == "5.00" && new_balance.to_string() == "15.00"
        ));
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn ended_operation_is_resubscribed() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, remote) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();

        remote.end_operation(&address.hash160);
        assert!(remote.active().is_empty());
        h.scheduler
            .on_subscription_error(IndexerError::GraphQLError("script not indexed".to_string()))
            .await;

        assert_eq!(remote.active(), vec![address.hash160.clone()]);
        assert_eq!(h.scheduler.subscription_status(), SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn transport_error_drops_subscription() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, _) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, _remote) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();

        h.scheduler
            .on_subscription_error(IndexerError::WebSocketError(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed,
            ))
            .await;

        assert_eq!(h.scheduler.subscription_status(), SubscriptionStatus::Inactive);
        assert_eq!(h.scheduler.current_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unchanged_cycle_keeps_token_metadata() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.indexers[0].set_snapshot(
            vec![(address.clone(), vec![utxo("A", 0, 1000)])].into_iter().collect(),
        );
        h.indexers[0].add_genesis("tok", 2, "Test Token", "TT");
        h.indexers[0].add_tx(incoming_token_tx("T1", &address.hash160, "tok", 100));
        h.indexers[0].add_tx(incoming_token_tx("T2", &address.hash160, "tok", 300));
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, _remote) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();
        cycle(&mut h.scheduler).await;

        h.scheduler.on_push_event(mempool("T1"));
        cycle(&mut h.scheduler).await;
        h.scheduler.on_push_event(mempool("T2"));
        cycle(&mut h.scheduler).await;

        assert_eq!(h.scheduler.stats().cycles_unchanged, 2);
        assert_eq!(h.indexers[0].genesis_calls(), 1);
        for expected in ["1.00", "3.00"] {
            assert!(matches!(
                h.notifications.try_recv().unwrap(),
                WalletNotification::TokenReceived { ref ticker, amount, .. }
                    if ticker == "TT" && amount.to_string() == expected
            ));
        }
    }

    #[tokio::test]
    async fn failed_cycle_requeues_mempool_txids() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.scheduler.activate_wallet(wallet).await;
        let (subscription, _handle) = FakeSubscription::new(&[]);
        h.scheduler.install_subscription(Box::new(subscription)).await.unwrap();

        h.scheduler.on_push_event(mempool("in"));
        h.indexers[0].set_failing(true);
        cycle(&mut h.scheduler).await;
        assert!(h.notifications.try_recv().is_err());

        h.indexers[0].set_failing(false);
        h.indexers[0].set_snapshot(
            vec![(address.clone(), vec![utxo("in", 0, 700)])].into_iter().collect(),
        );
        h.indexers[0].add_tx(incoming_tx("in", &address.hash160, 700, 1));
        cycle(&mut h.scheduler).await;
        assert!(h.notifications.try_recv().is_ok());
    }

    #[tokio::test]
    async fn changed_cycle_persists_and_restores() {
        let mut h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.indexers[0].set_snapshot(
            vec![(address, vec![utxo("A", 0, 1000), utxo("B", 0, 2500), utxo("C", 0, 546)])]
                .into_iter()
                .collect(),
        );
        h.scheduler.activate_wallet(wallet.clone()).await;
        cycle(&mut h.scheduler).await;
        assert!(h.store.get("wallet_state_main").await.unwrap().is_some());

        let mut restarted = SyncScheduler::new(
            SyncConfig::default(),
            vec![h.indexers[0].clone() as Arc<dyn IndexerService>],
            None,
            StatePersistenceService::new(h.store.clone()),
            Arc::new(ChannelNotificationSink::new().0),
        )
        .unwrap();
        restarted.activate_wallet(wallet).await;
        assert_eq!(restarted.view().balance.spendable_display.to_string(), "40.46");

        let hydrations = h.indexers[0].hydrate_calls();
        cycle(&mut restarted).await;
        assert_eq!(h.indexers[0].hydrate_calls(), hydrations);
        assert_eq!(restarted.stats().cycles_unchanged, 1);
    }

    #[tokio::test]
    async fn run_loop_syncs_and_shuts_down() {
        let h = harness(&["https://a.example"]);
        let (wallet, address) = single_address_wallet();
        h.indexers[0].set_snapshot(
            vec![(address, vec![utxo("A", 0, 1234)])].into_iter().collect(),
        );
        let mut view = h.scheduler.subscribe_view();
        let (commands, receiver) = mpsc::channel(8);
        let runner = tokio::spawn(h.scheduler.run(receiver));

        commands
            .send(SchedulerCommand::ActivateWallet(wallet))
            .await
            .unwrap();
        let synced = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|view| view.synced),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(synced.balance.spendable_display.to_string(), "12.34");

        commands.send(SchedulerCommand::Shutdown).await.unwrap();
        runner.await.unwrap();
    }
}
