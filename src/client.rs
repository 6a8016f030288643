use crate::ui;
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use spin_cycle::{
    Engine,
    EngineConfig,
    EngineEvent,
    EngineSnapshot,
    clock_sync::SystemTime,
    cycle::CycleEvent,
    cycle_store::CycleStore,
    ledger::CHIP_CATALOG,
    outcome::{
        OutcomeSource,
        cell_for_segment,
    },
    remote::{
        HttpLedger,
        RequestStatus,
    },
};
use std::{
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    sync::mpsc,
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

const MAX_ERRORS: usize = 4;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_url: String,
    pub user_id: String,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub initial_balance: Option<u64>,
}

/// Everything one frame needs.
#[derive(Clone, Debug)]
pub struct AppSnapshot {
    pub user_id: String,
    pub engine: EngineSnapshot,
    pub status: String,
    pub errors: Vec<String>,
}

struct AppController {
    engine: Engine<HttpLedger>,
    engine_config: EngineConfig,
    status: String,
    errors: Vec<String>,
}

impl AppController {
    fn new(config: AppConfig) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        let engine_config = EngineConfig {
            user_id: config.user_id,
            initial_balance: config.initial_balance,
            ..EngineConfig::default()
        };
        let remote = HttpLedger::new(&config.api_url, engine_config.request_timeout)
            .wrap_err("failed to build HTTP client for the game API")?;
        let store = match CycleStore::open(&config.state_file) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!(%err, path = %config.state_file.display(), "cycle state will not be persisted");
                None
            }
        };
        let (engine, events) =
            Engine::new(&engine_config, remote, Arc::new(SystemTime), store);
        engine
            .select_chip(CHIP_CATALOG[0].denomination)
            .wrap_err("default chip missing from catalog")?;
        let controller = Self {
            engine,
            engine_config,
            status: "Connecting...".to_string(),
            errors: Vec::new(),
        };
        Ok((controller, events))
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        if self.errors.last() == Some(&error) {
            return;
        }
        self.errors.push(error);
        if self.errors.len() > MAX_ERRORS {
            self.errors.remove(0);
        }
    }

    fn build_snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            user_id: self.engine.user_id().to_string(),
            engine: self.engine.snapshot(),
            status: self.status.clone(),
            errors: self.errors.clone(),
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Cycle(CycleEvent::OutcomeDue { cycle_label, .. }) => {
                self.set_status(format!("Withdraw {cycle_label}: wagers closing"));
            }
            EngineEvent::Cycle(CycleEvent::SpinStarted(plan)) => {
                let note = match plan.source {
                    OutcomeSource::Authoritative { .. } => "",
                    OutcomeSource::Fallback => " (no outcome from server)",
                };
                self.set_status(format!("Spinning for {}{note}", plan.cycle_label));
            }
            EngineEvent::Cycle(CycleEvent::Resolved {
                segment,
                cycle_label,
            }) => {
                self.set_status(format!(
                    "Withdraw {cycle_label}: {}",
                    cell_for_segment(segment)
                ));
            }
            EngineEvent::Cycle(CycleEvent::Reopened) => {
                self.errors.clear();
            }
            EngineEvent::Cycle(CycleEvent::Realigned { .. }) => {
                self.set_status("Resynchronised with server cycle");
            }
            EngineEvent::OutcomeFetched {
                cycle_label,
                accepted,
            } => {
                if !accepted {
                    self.push_error(format!("No outcome received for {cycle_label}"));
                }
            }
            EngineEvent::DashboardRefreshed { records } => {
                debug!(records, "dashboard refreshed");
                if self.status == "Connecting..." {
                    self.set_status("Ready");
                }
            }
            EngineEvent::PollFailed(reason) => {
                self.push_error(format!("Dashboard unavailable: {reason}"));
            }
            EngineEvent::Submission(status) => match status {
                RequestStatus::Pending => self.set_status("Submitting wagers..."),
                RequestStatus::Submitted { reference } => {
                    let ticket = reference.unwrap_or_else(|| "no ticket".to_string());
                    self.set_status(format!("Wagers accepted ({ticket})"));
                }
                RequestStatus::Failed { reason } => {
                    self.push_error(format!("Wagers not placed: {reason}"));
                }
                RequestStatus::Idle => {}
            },
            EngineEvent::Claim {
                ticket_serial,
                status,
            } => match status {
                RequestStatus::Pending => {
                    self.set_status(format!("Claiming {ticket_serial}..."));
                }
                RequestStatus::Submitted { .. } => {
                    self.set_status(format!("Claim sent for {ticket_serial}"));
                }
                RequestStatus::Failed { reason } => {
                    self.push_error(format!("Claim for {ticket_serial} failed: {reason}"));
                }
                RequestStatus::Idle => {}
            },
        }
    }

    fn handle_user_event(&mut self, event: ui::UserEvent) {
        let result = match event {
            ui::UserEvent::Quit | ui::UserEvent::Redraw => Ok(()),
            ui::UserEvent::SelectChip(denomination) => self.engine.select_chip(denomination),
            ui::UserEvent::Place(cell) => self.engine.place_on(cell).map(|_| ()),
            ui::UserEvent::Clear => {
                self.engine.clear();
                Ok(())
            }
            ui::UserEvent::Double => self.engine.double(),
            ui::UserEvent::Repeat => self.engine.repeat(),
            ui::UserEvent::Submit => self.engine.submit_wagers().map(|_| ()),
            ui::UserEvent::Claim(ticket_serial) => {
                if self.engine.claim(&ticket_serial).is_none() {
                    self.set_status(format!("{ticket_serial} has nothing to claim"));
                }
                Ok(())
            }
        };
        if let Err(err) = result {
            self.push_error(err.to_string());
        }
    }
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let (controller, engine_events) = AppController::new(config)?;
    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();

    ui::terminal_enter(&mut ui_state)?;
    info!("UI ready");
    let res = run_loop(controller, engine_events, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    res
}

async fn run_loop(
    mut controller: AppController,
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
) -> Result<()> {
    let poller = controller
        .engine
        .spawn_poller(controller.engine_config.poll_interval);
    let mut render = time::interval(controller.engine_config.render_interval());
    render.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            _ = render.tick() => {
                controller.engine.tick();
                let snapshot = controller.build_snapshot();
                if let Err(err) = ui::draw(ui_state, &snapshot) {
                    break Err(err).wrap_err("draw failed");
                }
            }
            maybe_event = engine_events.recv() => {
                match maybe_event {
                    Some(event) => controller.handle_engine_event(event),
                    None => {
                        warn!("engine event channel closed");
                        break Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
            raw_ev = ui::next_raw_event(input_events) => {
                let event = match raw_ev {
                    Ok(event) => event,
                    Err(err) => break Err(err),
                };
                let Some(ev) = ui::interpret_event(ui_state, event) else {
                    continue;
                };
                if matches!(ev, ui::UserEvent::Quit) {
                    break Ok(());
                }
                controller.handle_user_event(ev);
            }
        }
    };

    poller.shutdown().await;
    info!("client stopped");
    result
}
