use crate::{
    animation,
    cycle_store::CycleStore,
    outcome::{
        OutcomeResolver,
        SpinPlan,
    },
};
use chrono::{
    DateTime,
    Local,
};
use rand::Rng;
use tracing::{
    debug,
    info,
    warn,
};

/// Upper bound on boundary fast-forward steps before giving up and
/// realigning from the current time.
pub const MAX_CATCH_UP_STEPS: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Open,
    AwaitingOutcome,
    Spinning,
    Resolved,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CycleTiming {
    pub cycle_duration: f64,
    pub fetch_threshold: f64,
    pub spin_duration: f64,
    pub highlight_duration: f64,
    /// How late past a boundary a spin may still start. Later than this the
    /// boundary counts as missed and the scheduler realigns without spinning.
    pub missed_deadline_grace: f64,
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            cycle_duration: 120.0,
            fetch_threshold: 5.0,
            spin_duration: animation::SPIN_DURATION_SECS,
            highlight_duration: 5.0,
            missed_deadline_grace: animation::SPIN_DURATION_SECS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CycleState {
    pub cycle_start_timestamp: f64,
    pub outcome_fetched: bool,
    pub phase: Phase,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleEvent {
    /// Time to ask for the outcome of the cycle ending at `cycle_end`.
    OutcomeDue { cycle_label: String, cycle_end: f64 },
    SpinStarted(SpinPlan),
    Resolved { segment: usize, cycle_label: String },
    Reopened,
    Realigned { cycle_start: f64 },
}

pub fn align_down(t: f64, duration: f64) -> f64 {
    (t / duration).floor() * duration
}

/// Wall-clock tag of a cycle boundary, as shown to players and sent with wagers.
pub fn format_cycle_label(boundary: f64) -> String {
    match DateTime::from_timestamp(boundary.floor() as i64, 0) {
        Some(utc) => utc.with_timezone(&Local).format("%H:%M:%S").to_string(),
        None => format!("{boundary:.0}"),
    }
}

#[derive(Debug)]
pub struct CycleScheduler {
    timing: CycleTiming,
    state: CycleState,
    store: Option<CycleStore>,
    current_plan: Option<SpinPlan>,
    resting_angle: f64,
    last_server_marker: Option<f64>,
}

impl CycleScheduler {
    /// Restores the boundary from `store` (if any) and fast-forwards it to
    /// `now`; without a usable record the cycle is aligned to `now`.
    pub fn load(timing: CycleTiming, store: Option<CycleStore>, now: f64) -> Self {
        let record = match store.as_ref().map(CycleStore::load_record) {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                warn!(%err, "persisted cycle state unreadable; aligning from current time");
                None
            }
            None => None,
        };
        let persisted = record.as_ref().map(|r| r.cycle_start_timestamp);
        let resting_angle = record.as_ref().map_or(0.0, |r| r.resting_angle);
        let duration = timing.cycle_duration;
        let start = match persisted {
            Some(start) if start > now => {
                warn!(start, now, "persisted cycle boundary is in the future; realigning");
                align_down(now, duration)
            }
            Some(start) => {
                let aligned = align_down(start, duration);
                if aligned != start {
                    debug!(start, aligned, "snapping persisted boundary to alignment");
                }
                catch_up(aligned, now, duration)
            }
            None => align_down(now, duration),
        };
        info!(cycle_start = start, resting_angle, now, "cycle scheduler loaded");
        let scheduler = Self {
            timing,
            state: CycleState {
                cycle_start_timestamp: start,
                outcome_fetched: false,
                phase: Phase::Open,
            },
            store,
            current_plan: None,
            resting_angle,
            last_server_marker: None,
        };
        if persisted != Some(start) {
            scheduler.persist();
        }
        scheduler
    }

    pub fn timing(&self) -> &CycleTiming {
        &self.timing
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn cycle_start(&self) -> f64 {
        self.state.cycle_start_timestamp
    }

    pub fn cycle_end(&self) -> f64 {
        self.state.cycle_start_timestamp + self.timing.cycle_duration
    }

    pub fn remaining(&self, now: f64) -> f64 {
        (self.cycle_end() - now).max(0.0)
    }

    pub fn cycle_label(&self) -> String {
        format_cycle_label(self.cycle_end())
    }

    pub fn current_plan(&self) -> Option<&SpinPlan> {
        self.current_plan.as_ref()
    }

    /// Final angle of the last resolved spin; the next spin starts here.
    pub fn resting_angle(&self) -> f64 {
        self.resting_angle
    }

    pub fn display_angle(&self, now: f64) -> f64 {
        match &self.current_plan {
            Some(plan) => animation::angle(plan, now),
            None => self.resting_angle,
        }
    }

    /// Advances the state machine to `now`. Cheap to call on every frame.
    pub fn tick(
        &mut self,
        now: f64,
        resolver: &mut OutcomeResolver,
        rng: &mut impl Rng,
    ) -> Vec<CycleEvent> {
        let mut events = Vec::new();
        self.advance_cosmetic(now, &mut events);

        let end = self.cycle_end();
        if matches!(self.state.phase, Phase::Open | Phase::AwaitingOutcome)
            && now - end > self.timing.missed_deadline_grace
        {
            let start = catch_up(self.state.cycle_start_timestamp, now, self.timing.cycle_duration);
            warn!(missed_end = end, cycle_start = start, "cycle boundary missed; realigning without a spin");
            self.state = CycleState {
                cycle_start_timestamp: start,
                outcome_fetched: false,
                phase: Phase::Open,
            };
            self.persist();
            events.push(CycleEvent::Realigned { cycle_start: start });
            return events;
        }

        let remaining = self.remaining(now);
        match self.state.phase {
            Phase::Open
                if !self.state.outcome_fetched && remaining <= self.timing.fetch_threshold =>
            {
                let cycle_label = self.cycle_label();
                self.state.outcome_fetched = true;
                self.state.phase = Phase::AwaitingOutcome;
                resolver.arm(cycle_label.clone());
                info!(cycle = %cycle_label, remaining, "outcome due");
                events.push(CycleEvent::OutcomeDue {
                    cycle_label,
                    cycle_end: end,
                });
            }
            Phase::AwaitingOutcome if remaining <= 0.0 => {
                let cycle_label = self.cycle_label();
                let plan = resolver.build_plan(&cycle_label, self.resting_angle, end, rng);
                info!(
                    cycle = %cycle_label,
                    segment = plan.target_segment_index,
                    spins = plan.spin_count,
                    source = ?plan.source,
                    "spin started"
                );
                self.current_plan = Some(plan.clone());
                // boundary moves only after the plan exists, and is persisted after that
                self.state.cycle_start_timestamp += self.timing.cycle_duration;
                self.persist();
                self.state.outcome_fetched = false;
                self.state.phase = Phase::Spinning;
                events.push(CycleEvent::SpinStarted(plan));
            }
            _ => {}
        }
        events
    }

    /// Applies an authoritative "last spin" marker. Only a marker newer than
    /// any seen before is considered, and the boundary only ever moves
    /// forward, so a spin is never replayed.
    pub fn resync(&mut self, now: f64, server_last_spin: f64) -> Option<CycleEvent> {
        if !server_last_spin.is_finite()
            || self
                .last_server_marker
                .is_some_and(|seen| server_last_spin <= seen)
        {
            return None;
        }
        self.last_server_marker = Some(server_last_spin);

        let duration = self.timing.cycle_duration;
        let candidate = catch_up(align_down(server_last_spin, duration), now, duration);
        if candidate > now || candidate <= self.state.cycle_start_timestamp {
            debug!(candidate, current = self.state.cycle_start_timestamp, "server marker agrees with local cycle");
            return None;
        }
        if self.state.phase == Phase::AwaitingOutcome && candidate == self.cycle_end() {
            debug!(boundary = candidate, "server already past the pending boundary; spinning it first");
            return None;
        }
        warn!(
            from = self.state.cycle_start_timestamp,
            to = candidate,
            "local cycle diverged from server; realigning"
        );
        self.state.cycle_start_timestamp = candidate;
        self.state.outcome_fetched = false;
        if self.state.phase == Phase::AwaitingOutcome {
            self.state.phase = Phase::Open;
        }
        self.persist();
        Some(CycleEvent::Realigned {
            cycle_start: candidate,
        })
    }

    fn advance_cosmetic(&mut self, now: f64, events: &mut Vec<CycleEvent>) {
        let Some(plan) = &self.current_plan else {
            return;
        };
        let since_spin = now - plan.spin_start_timestamp;
        if self.state.phase == Phase::Spinning && since_spin >= self.timing.spin_duration {
            self.resting_angle = plan.final_angle();
            self.state.phase = Phase::Resolved;
            info!(
                cycle = %plan.cycle_label,
                segment = plan.target_segment_index,
                cell = %plan.winning_cell(),
                "spin resolved"
            );
            events.push(CycleEvent::Resolved {
                segment: plan.target_segment_index,
                cycle_label: plan.cycle_label.clone(),
            });
        }
        if self.state.phase == Phase::Resolved
            && since_spin >= self.timing.spin_duration + self.timing.highlight_duration
        {
            self.state.phase = Phase::Open;
            self.current_plan = None;
            events.push(CycleEvent::Reopened);
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        // a restart mid-spin resumes where the wheel was headed
        let resting_angle = self
            .current_plan
            .as_ref()
            .map_or(self.resting_angle, SpinPlan::final_angle);
        if let Err(err) = store.save(self.state.cycle_start_timestamp, resting_angle) {
            warn!(%err, path = %store.path().display(), "failed to persist cycle boundary");
        }
    }
}

/// Fast-forwards `start` by whole durations until its cycle contains `now`.
fn catch_up(start: f64, now: f64, duration: f64) -> f64 {
    let mut start = start;
    let mut steps = 0u32;
    while start + duration <= now {
        if steps >= MAX_CATCH_UP_STEPS {
            let realigned = align_down(now, duration);
            warn!(start, now, realigned, "catch-up limit reached; realigning from current time");
            return realigned;
        }
        start += duration;
        steps += 1;
    }
    start
}
