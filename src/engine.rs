use crate::{
    clock_sync::{
        ClockSync,
        ServerTimeSample,
        TimeSource,
    },
    cycle::{
        CycleEvent,
        CycleScheduler,
        CycleTiming,
        Phase,
    },
    cycle_store::CycleStore,
    error::{
        LedgerError,
        RemoteError,
    },
    history::{
        AccountSummary,
        ClaimService,
        HistoryCache,
        HistoryRecord,
    },
    ledger::{
        LedgerSnapshot,
        WagerCell,
        WagerLedger,
    },
    outcome::{
        OutcomeResolver,
        SpinPlan,
        segment_at_pointer,
    },
    remote::{
        DashboardData,
        RemoteLedger,
        RequestStatus,
        UserProfile,
    },
};
use rand::{
    SeedableRng,
    rngs::StdRng,
};
use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub user_id: String,
    pub timing: CycleTiming,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub render_hz: u32,
    pub initial_balance: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            timing: CycleTiming::default(),
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            render_hz: 60,
            initial_balance: None,
        }
    }
}

impl EngineConfig {
    pub fn render_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.render_hz.max(1)))
    }
}

/// Everything the poller writes and the render loop reads.
#[derive(Debug)]
pub struct EngineState {
    pub clock: ClockSync,
    pub scheduler: CycleScheduler,
    pub resolver: OutcomeResolver,
    pub ledger: WagerLedger,
    pub history: HistoryCache,
    pub claims: ClaimService,
    pub profile: Option<UserProfile>,
    pub last_poll_error: Option<String>,
    rng: StdRng,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Cycle(CycleEvent),
    OutcomeFetched { cycle_label: String, accepted: bool },
    DashboardRefreshed { records: usize },
    PollFailed(String),
    Submission(RequestStatus),
    Claim { ticket_serial: String, status: RequestStatus },
}

/// Read-only view handed to the renderer once per frame.
#[derive(Clone, Debug)]
pub struct EngineSnapshot {
    pub now: f64,
    pub phase: Phase,
    pub remaining: f64,
    pub cycle_duration: f64,
    pub cycle_label: String,
    pub angle: f64,
    pub segment_under_pointer: usize,
    pub plan: Option<SpinPlan>,
    pub highlight: Option<WagerCell>,
    pub ledger: LedgerSnapshot,
    pub records: Vec<HistoryRecord>,
    pub claims: Vec<(String, RequestStatus)>,
    pub summary: AccountSummary,
    pub profile: Option<UserProfile>,
    pub clock_offset: Option<f64>,
    pub last_poll_error: Option<String>,
}

pub enum PollerCommand {
    FetchNow,
    Shutdown,
}

pub struct PollerHandle {
    pub commands: mpsc::UnboundedSender<PollerCommand>,
    pub task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn fetch_now(&self) {
        let _ = self.commands.send(PollerCommand::FetchNow);
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(PollerCommand::Shutdown);
        if let Err(err) = self.task.await {
            warn!(?err, "dashboard poller did not stop cleanly");
        }
    }
}

pub struct Engine<L> {
    state: Arc<Mutex<EngineState>>,
    remote: Arc<L>,
    user_id: Arc<str>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl<L> Clone for Engine<L> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            remote: Arc::clone(&self.remote),
            user_id: Arc::clone(&self.user_id),
            events: self.events.clone(),
        }
    }
}

impl<L: RemoteLedger> Engine<L> {
    pub fn new(
        config: &EngineConfig,
        remote: L,
        time: Arc<dyn TimeSource>,
        store: Option<CycleStore>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::with_rng(config, remote, time, store, StdRng::from_os_rng())
    }

    pub fn with_rng(
        config: &EngineConfig,
        remote: L,
        time: Arc<dyn TimeSource>,
        store: Option<CycleStore>,
        rng: StdRng,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let clock = ClockSync::new(time);
        let scheduler = CycleScheduler::load(config.timing, store, clock.now());
        let mut ledger = WagerLedger::new();
        ledger.set_balance(config.initial_balance);
        let state = EngineState {
            clock,
            scheduler,
            resolver: OutcomeResolver::new(),
            ledger,
            history: HistoryCache::new(),
            claims: ClaimService::new(),
            profile: None,
            last_poll_error: None,
            rng,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            state: Arc::new(Mutex::new(state)),
            remote: Arc::new(remote),
            user_id: Arc::from(config.user_id.as_str()),
            events: tx,
        };
        (engine, rx)
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn now(&self) -> f64 {
        self.lock().clock.now()
    }

    /// Runs `f` against the current state under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.lock())
    }

    /// Advances the cycle to the current authoritative time. Never blocks on
    /// the network; an outcome fetch, when due, runs on its own task.
    pub fn tick(&self) -> Vec<CycleEvent> {
        let (now, events) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let now = state.clock.now();
            let events = state
                .scheduler
                .tick(now, &mut state.resolver, &mut state.rng);
            (now, events)
        };
        for event in &events {
            if let CycleEvent::OutcomeDue {
                cycle_label,
                cycle_end,
            } = event
            {
                let window = Duration::from_secs_f64((cycle_end - now).max(0.0));
                self.spawn_outcome_fetch(cycle_label.clone(), window);
            }
            self.emit(EngineEvent::Cycle(event.clone()));
        }
        events
    }

    /// Fetches the outcome for `cycle_label`; anything slower than `window`
    /// would miss the spin anyway.
    fn spawn_outcome_fetch(&self, cycle_label: String, window: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let result = OutcomeResolver::fetch(
                engine.remote.as_ref(),
                &cycle_label,
                &engine.user_id,
                window,
            )
            .await;
            let accepted = engine.lock().resolver.accept(&cycle_label, result);
            engine.emit(EngineEvent::OutcomeFetched {
                cycle_label,
                accepted,
            });
        })
    }

    /// Folds one dashboard response into the shared state.
    pub fn apply_dashboard(&self, data: DashboardData, local_at_sample: f64) {
        let (realigned, records) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.clock.record(ServerTimeSample {
                server_timestamp: data.server_timestamp,
                local_timestamp_at_sample: local_at_sample,
            });
            let now = state.clock.now();
            let realigned = data
                .last_spin_timestamp
                .and_then(|marker| state.scheduler.resync(now, marker));
            let records = data.records.len();
            state.history.replace(data.records, now);
            state.claims.on_refresh();
            if let Some(profile) = data.profile {
                // an outstanding submission may or may not be reflected yet
                if !state.ledger.status().is_pending() {
                    state.ledger.set_balance(balance_from_points(profile.points));
                }
                state.profile = Some(profile);
            }
            state.last_poll_error = None;
            (realigned, records)
        };
        if let Some(event) = realigned {
            self.emit(EngineEvent::Cycle(event));
        }
        self.emit(EngineEvent::DashboardRefreshed { records });
    }

    pub async fn poll_once(&self) -> Result<(), RemoteError> {
        match self.remote.dashboard(&self.user_id).await {
            Ok(data) => {
                let local = self.lock().clock.local_now();
                self.apply_dashboard(data, local);
                Ok(())
            }
            Err(err) => {
                self.lock().last_poll_error = Some(err.to_string());
                self.emit(EngineEvent::PollFailed(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn spawn_poller(&self, period: Duration) -> PollerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dashboard_poller(self.clone(), period, cmd_rx));
        PollerHandle {
            commands: cmd_tx,
            task,
        }
    }

    /// Sends the placed wagers tagged with the current cycle label. The table
    /// is free again immediately; the verdict arrives as an `EngineEvent`.
    pub fn submit_wagers(&self) -> Result<JoinHandle<()>, LedgerError> {
        let batch = {
            let mut state = self.lock();
            let cycle_label = state.scheduler.cycle_label();
            state.ledger.begin_submit(cycle_label, self.user_id.to_string())?
        };
        info!(cycle = %batch.cycle_label, total = batch.total(), "submitting wager batch");
        self.emit(EngineEvent::Submission(RequestStatus::Pending));
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            let result = engine.remote.submit_wagers(&batch).await;
            let status = {
                let mut state = engine.lock();
                state.ledger.complete_submit(result);
                state.ledger.status().clone()
            };
            engine.emit(EngineEvent::Submission(status));
        }))
    }

    /// Fires one claim request if the ticket is claimable and none is out.
    pub fn claim(&self, ticket_serial: &str) -> Option<JoinHandle<()>> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.claims.begin_claim(&state.history, ticket_serial) {
                debug!(ticket = ticket_serial, "claim ignored; ticket not claimable");
                return None;
            }
        }
        let ticket_serial = ticket_serial.to_string();
        self.emit(EngineEvent::Claim {
            ticket_serial: ticket_serial.clone(),
            status: RequestStatus::Pending,
        });
        let engine = self.clone();
        Some(tokio::spawn(async move {
            let result = engine.remote.claim(&ticket_serial).await;
            let status = {
                let mut state = engine.lock();
                state.claims.complete_claim(&ticket_serial, result);
                state.claims.status(&ticket_serial)
            };
            engine.emit(EngineEvent::Claim {
                ticket_serial,
                status,
            });
        }))
    }

    pub fn select_chip(&self, denomination: u64) -> Result<(), LedgerError> {
        self.lock().ledger.select_chip(denomination)
    }

    pub fn place_on(&self, cell: WagerCell) -> Result<u64, LedgerError> {
        self.lock().ledger.place_on(cell)
    }

    pub fn clear(&self) {
        self.lock().ledger.clear();
    }

    pub fn double(&self) -> Result<(), LedgerError> {
        self.lock().ledger.double()
    }

    pub fn repeat(&self) -> Result<(), LedgerError> {
        self.lock().ledger.repeat()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        let now = state.clock.now();
        let scheduler = &state.scheduler;
        let angle = scheduler.display_angle(now);
        let plan = scheduler.current_plan().cloned();
        let highlight = match scheduler.phase() {
            Phase::Resolved => plan.as_ref().map(SpinPlan::winning_cell),
            _ => None,
        };
        let mut claims: Vec<_> = state
            .claims
            .statuses()
            .map(|(serial, status)| (serial.to_string(), status.clone()))
            .collect();
        claims.sort_by(|a, b| a.0.cmp(&b.0));
        EngineSnapshot {
            now,
            phase: scheduler.phase(),
            remaining: scheduler.remaining(now),
            cycle_duration: scheduler.timing().cycle_duration,
            cycle_label: scheduler.cycle_label(),
            angle,
            segment_under_pointer: segment_at_pointer(angle),
            plan,
            highlight,
            ledger: state.ledger.snapshot(),
            records: state.history.records().to_vec(),
            claims,
            summary: AccountSummary::from_records(state.history.records()),
            profile: state.profile.clone(),
            clock_offset: state.clock.offset(),
            last_poll_error: state.last_poll_error.clone(),
        }
    }
}

fn balance_from_points(points: f64) -> Option<u64> {
    (points.is_finite() && points >= 0.0).then(|| points.floor() as u64)
}

async fn dashboard_poller<L: RemoteLedger>(
    engine: Engine<L>,
    period: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<PollerCommand>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = engine.poll_once().await {
                    warn!(%err, "dashboard poll failed");
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PollerCommand::FetchNow) => {
                        if let Err(err) = engine.poll_once().await {
                            warn!(%err, "dashboard poll failed");
                        }
                    }
                    Some(PollerCommand::Shutdown) | None => break,
                }
            }
        }
    }
    debug!("dashboard poller stopped");
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        clock_sync::ManualTime,
        ledger::WagerBatch,
        outcome::Outcome,
        remote::{
            ClaimReceipt,
            WagerReceipt,
        },
    };

    #[derive(Default)]
    struct FakeLedger {
        fail_submit: bool,
        dashboard: Mutex<Option<DashboardData>>,
        submitted: Mutex<Vec<WagerBatch>>,
        claims: Mutex<Vec<String>>,
    }

    impl RemoteLedger for FakeLedger {
        async fn dashboard(&self, _user_id: &str) -> Result<DashboardData, RemoteError> {
            self.dashboard
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| RemoteError::Transient("offline".into()))
        }

        async fn outcome(&self, _label: &str, _user: &str) -> Result<Outcome, RemoteError> {
            Ok(Outcome {
                target_segment_index: 2,
                payout_multiplier: 10.0,
            })
        }

        async fn submit_wagers(&self, batch: &WagerBatch) -> Result<WagerReceipt, RemoteError> {
            self.submitted.lock().unwrap().push(batch.clone());
            if self.fail_submit {
                return Err(RemoteError::Transient("timed out".into()));
            }
            Ok(WagerReceipt {
                ticket_serial: Some("T-9".into()),
                message: None,
            })
        }

        async fn claim(&self, ticket_serial: &str) -> Result<ClaimReceipt, RemoteError> {
            self.claims.lock().unwrap().push(ticket_serial.to_string());
            Ok(ClaimReceipt {
                ticket_serial: Some(ticket_serial.to_string()),
                claim_point: Some(40.0),
                message: None,
            })
        }
    }

    fn engine_with(
        remote: FakeLedger,
        balance: Option<u64>,
    ) -> (Engine<FakeLedger>, ManualTime, mpsc::UnboundedReceiver<EngineEvent>) {
        let time = ManualTime::starting_at(0.0);
        let config = EngineConfig {
            user_id: "7".into(),
            initial_balance: balance,
            ..EngineConfig::default()
        };
        let (engine, rx) = Engine::with_rng(
            &config,
            remote,
            Arc::new(time.clone()),
            None,
            StdRng::seed_from_u64(4),
        );
        (engine, time, rx)
    }

    fn record(serial: &str, claim: Option<f64>, unclaim: Option<f64>) -> HistoryRecord {
        HistoryRecord {
            ticket_serial: serial.into(),
            card_type: Some("K of Spades".into()),
            result_number: None,
            bet_amount: 10.0,
            claim_point: claim,
            unclaim_point: unclaim,
        }
    }

    #[tokio::test]
    async fn submit_wagers__debits_balance_and_tags_cycle() {
        // given
        let (engine, _time, _rx) = engine_with(FakeLedger::default(), Some(500));
        engine.select_chip(100).unwrap();
        engine.place_on(WagerCell::new(1, 1).unwrap()).unwrap();
        let label = engine.snapshot().cycle_label;

        // when
        engine.submit_wagers().unwrap().await.unwrap();

        // then
        let snap = engine.snapshot();
        assert_eq!(snap.ledger.balance, Some(400));
        assert!(snap.ledger.placed.is_empty());
        assert_eq!(
            snap.ledger.status,
            RequestStatus::Submitted {
                reference: Some("T-9".into())
            }
        );
        let sent = engine.remote.submitted.lock().unwrap();
        assert_eq!(sent[0].cycle_label, label);
        assert_eq!(sent[0].user_id, "7");
    }

    #[tokio::test]
    async fn submit_wagers__failure_restores_table() {
        let remote = FakeLedger {
            fail_submit: true,
            ..FakeLedger::default()
        };
        let (engine, _time, mut rx) = engine_with(remote, Some(500));
        engine.select_chip(50).unwrap();
        engine.place_on(WagerCell::new(2, 3).unwrap()).unwrap();

        engine.submit_wagers().unwrap().await.unwrap();

        let snap = engine.snapshot();
        assert_eq!(snap.ledger.balance, Some(500));
        assert_eq!(snap.ledger.total, 50);
        assert_eq!(rx.recv().await, Some(EngineEvent::Submission(RequestStatus::Pending)));
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::Submission(RequestStatus::Failed { .. }))
        ));
    }

    #[tokio::test]
    async fn poll_once__refreshes_clock_history_and_balance() {
        // given
        let remote = FakeLedger::default();
        *remote.dashboard.lock().unwrap() = Some(DashboardData {
            server_timestamp: 1000.0,
            last_spin_timestamp: None,
            records: vec![record("A", Some(0.0), Some(25.0))],
            profile: Some(UserProfile {
                points: 750.9,
                winning_points: None,
            }),
        });
        let (engine, time, _rx) = engine_with(remote, None);
        time.set(50.0);

        // when
        engine.poll_once().await.unwrap();
        time.advance(3.0);

        // then
        let snap = engine.snapshot();
        assert_eq!(snap.now, 1003.0);
        assert_eq!(snap.clock_offset, Some(950.0));
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.ledger.balance, Some(750));
        assert_eq!(snap.summary.total_sale, 10.0);
    }

    #[tokio::test]
    async fn poll_once__failure_keeps_previous_state() {
        let (engine, _time, _rx) = engine_with(FakeLedger::default(), Some(10));
        let res = engine.poll_once().await;
        assert!(matches!(res, Err(RemoteError::Transient(_))));
        let snap = engine.snapshot();
        assert_eq!(snap.ledger.balance, Some(10));
        assert!(snap.last_poll_error.is_some());
    }

    #[tokio::test]
    async fn claim__sends_once_until_refresh() {
        // given
        let (engine, time, _rx) = engine_with(FakeLedger::default(), None);
        engine.apply_dashboard(
            DashboardData {
                server_timestamp: 10.0,
                last_spin_timestamp: None,
                records: vec![
                    record("win", Some(0.0), Some(40.0)),
                    record("lost", Some(0.0), Some(0.0)),
                ],
                profile: None,
            },
            time.now(),
        );

        // when
        let first = engine.claim("win");
        let second = engine.claim("win");
        let lost = engine.claim("lost");
        first.unwrap().await.unwrap();

        // then
        assert!(second.is_none());
        assert!(lost.is_none());
        assert_eq!(engine.remote.claims.lock().unwrap().as_slice(), ["win"]);
        assert_eq!(
            engine.snapshot().claims,
            vec![(
                "win".to_string(),
                RequestStatus::Submitted {
                    reference: Some("win".into())
                }
            )]
        );
    }

    #[tokio::test]
    async fn apply_dashboard__keeps_balance_while_submission_pending() {
        // given
        let (engine, time, _rx) = engine_with(FakeLedger::default(), Some(500));
        engine.select_chip(100).unwrap();
        engine.place_on(WagerCell::new(1, 1).unwrap()).unwrap();
        let pending = engine.submit_wagers().unwrap();
        let dashboard = DashboardData {
            server_timestamp: 10.0,
            last_spin_timestamp: None,
            records: Vec::new(),
            profile: Some(UserProfile {
                points: 450.0,
                winning_points: None,
            }),
        };

        // when
        engine.apply_dashboard(dashboard.clone(), time.now());
        let while_pending = engine.snapshot().ledger;
        pending.await.unwrap();
        let after_submit = engine.snapshot().ledger.balance;
        engine.apply_dashboard(
            DashboardData {
                profile: Some(UserProfile {
                    points: 400.0,
                    winning_points: None,
                }),
                ..dashboard
            },
            time.now(),
        );

        // then
        assert_eq!(while_pending.status, RequestStatus::Pending);
        assert_eq!(while_pending.balance, Some(500));
        assert_eq!(after_submit, Some(400));
        assert_eq!(engine.snapshot().ledger.balance, Some(400));
        assert_eq!(
            engine.snapshot().profile.map(|p| p.points),
            Some(400.0)
        );
    }

    #[tokio::test]
    async fn tick__fetches_outcome_in_background() {
        // given
        let (engine, time, _rx) = engine_with(FakeLedger::default(), None);
        time.set(115.0);

        // when
        let events = engine.tick();
        for _ in 0..10 {
            if engine.inspect(|s| s.resolver.has_outcome()) {
                break;
            }
            tokio::task::yield_now().await;
        }
        time.set(120.0);
        let events_at_end = engine.tick();

        // then
        assert!(matches!(events[0], CycleEvent::OutcomeDue { .. }));
        let Some(CycleEvent::SpinStarted(plan)) = events_at_end.first() else {
            panic!("expected spin, got {events_at_end:?}");
        };
        assert_eq!(plan.target_segment_index, 2);
    }
}
