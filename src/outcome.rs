use crate::{
    error::RemoteError,
    ledger::WagerCell,
    remote::RemoteLedger,
};
use rand::Rng;
use std::{
    ops::RangeInclusive,
    time::Duration,
};
use tokio::time::{
    self,
    Instant,
};
use tracing::{
    info,
    warn,
};

pub const SEGMENT_COUNT: usize = 12;
pub const SEGMENT_DEGREES: f64 = 360.0 / SEGMENT_COUNT as f64;
/// Screen angle of the fixed pointer (y grows downward, so 270° is straight up).
pub const POINTER_DEGREES: f64 = 270.0;
pub const SPIN_COUNT_RANGE: RangeInclusive<u32> = 3..=6;
pub const FALLBACK_SEGMENT: usize = 0;

// wheel order of ranks around the rim, as table row indices (K=1, Q=2, J=3)
const WHEEL_RANKS: [u8; 3] = [1, 3, 2];

/// Wheel rotation at which segment `index` sits centred under the pointer.
pub fn target_angle(index: usize) -> f64 {
    let centre = SEGMENT_DEGREES * (index % SEGMENT_COUNT) as f64 + SEGMENT_DEGREES / 2.0;
    normalized_delta(POINTER_DEGREES - centre)
}

/// Segment under the pointer for a given wheel rotation.
pub fn segment_at_pointer(angle: f64) -> usize {
    let offset = normalized_delta(POINTER_DEGREES - angle);
    ((offset / SEGMENT_DEGREES).floor() as usize) % SEGMENT_COUNT
}

/// Maps any real difference into `[0, 360)`.
pub fn normalized_delta(degrees: f64) -> f64 {
    let r = degrees.rem_euclid(360.0);
    if r >= 360.0 { 0.0 } else { r }
}

pub fn cell_for_segment(index: usize) -> WagerCell {
    let rank = WHEEL_RANKS[index % 3];
    let suit = (index % 4) as u8 + 1;
    WagerCell::from_parts(rank, suit)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Outcome {
    pub target_segment_index: usize,
    pub payout_multiplier: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutcomeSource {
    Authoritative { payout_multiplier: f64 },
    /// No authoritative outcome arrived in time.
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpinPlan {
    pub target_segment_index: usize,
    pub spin_count: u32,
    pub start_angle: f64,
    pub total_rotation_degrees: f64,
    pub spin_start_timestamp: f64,
    pub source: OutcomeSource,
    pub cycle_label: String,
}

impl SpinPlan {
    pub fn new(
        target_segment_index: usize,
        spin_count: u32,
        start_angle: f64,
        spin_start_timestamp: f64,
        source: OutcomeSource,
        cycle_label: impl Into<String>,
    ) -> Self {
        let target_segment_index = target_segment_index % SEGMENT_COUNT;
        let total_rotation_degrees = f64::from(spin_count) * 360.0
            + normalized_delta(target_angle(target_segment_index) - start_angle);
        Self {
            target_segment_index,
            spin_count,
            start_angle,
            total_rotation_degrees,
            spin_start_timestamp,
            source,
            cycle_label: cycle_label.into(),
        }
    }

    pub fn final_angle(&self) -> f64 {
        target_angle(self.target_segment_index)
    }

    pub fn winning_cell(&self) -> WagerCell {
        cell_for_segment(self.target_segment_index)
    }
}

/// Holds the authoritative outcome for the cycle currently awaiting one.
#[derive(Debug, Default)]
pub struct OutcomeResolver {
    armed_label: Option<String>,
    outcome: Option<Outcome>,
}

impl OutcomeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares for a fetch tagged `cycle_label`; drops anything from earlier cycles.
    pub fn arm(&mut self, cycle_label: impl Into<String>) {
        self.armed_label = Some(cycle_label.into());
        self.outcome = None;
    }

    pub fn armed_label(&self) -> Option<&str> {
        self.armed_label.as_deref()
    }

    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }

    /// Stores a fetch result if it belongs to the armed cycle.
    pub fn accept(
        &mut self,
        cycle_label: &str,
        result: Result<Outcome, RemoteError>,
    ) -> bool {
        if self.armed_label.as_deref() != Some(cycle_label) {
            warn!(cycle = cycle_label, "ignoring outcome for a cycle that is no longer armed");
            return false;
        }
        match result {
            Ok(outcome) => {
                info!(
                    cycle = cycle_label,
                    segment = outcome.target_segment_index,
                    multiplier = outcome.payout_multiplier,
                    "authoritative outcome received"
                );
                self.outcome = Some(outcome);
                true
            }
            Err(err) => {
                warn!(cycle = cycle_label, %err, "outcome unavailable; spin will fall back");
                false
            }
        }
    }

    /// Builds the plan for the cycle ending now, consuming the stored outcome.
    pub fn build_plan(
        &mut self,
        cycle_label: &str,
        start_angle: f64,
        spin_start_timestamp: f64,
        rng: &mut impl Rng,
    ) -> SpinPlan {
        let outcome = match self.armed_label.as_deref() {
            Some(label) if label == cycle_label => self.outcome.take(),
            _ => None,
        };
        self.armed_label = None;
        let (index, source) = match outcome {
            Some(o) => (
                o.target_segment_index,
                OutcomeSource::Authoritative {
                    payout_multiplier: o.payout_multiplier,
                },
            ),
            None => {
                warn!(
                    cycle = cycle_label,
                    segment = FALLBACK_SEGMENT,
                    "no authoritative outcome; using fallback segment"
                );
                (FALLBACK_SEGMENT, OutcomeSource::Fallback)
            }
        };
        let spin_count = rng.random_range(SPIN_COUNT_RANGE);
        SpinPlan::new(
            index,
            spin_count,
            start_angle,
            spin_start_timestamp,
            source,
            cycle_label,
        )
    }

    /// One outbound request, retried once on failure. Both attempts must land
    /// within `window`; the first gets at most half of it.
    pub async fn fetch<L: RemoteLedger>(
        remote: &L,
        cycle_label: &str,
        user_id: &str,
        window: Duration,
    ) -> Result<Outcome, RemoteError> {
        let started = Instant::now();
        let first_deadline = started + window / 2;
        match fetch_before(remote, cycle_label, user_id, first_deadline).await {
            Ok(outcome) => Ok(outcome),
            Err(first) => {
                warn!(cycle = cycle_label, err = %first, "outcome fetch failed; retrying once");
                fetch_before(remote, cycle_label, user_id, started + window).await
            }
        }
    }
}

async fn fetch_before<L: RemoteLedger>(
    remote: &L,
    cycle_label: &str,
    user_id: &str,
    deadline: Instant,
) -> Result<Outcome, RemoteError> {
    match time::timeout_at(deadline, remote.outcome(cycle_label, user_id)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transient(format!(
            "no outcome for {cycle_label} before the spin"
        ))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use rand::{
        SeedableRng,
        rngs::StdRng,
    };
    use crate::{
        ledger::WagerBatch,
        remote::{
            ClaimReceipt,
            DashboardData,
            WagerReceipt,
        },
    };
    use std::{
        collections::HashSet,
        sync::atomic::{
            AtomicUsize,
            Ordering,
        },
    };

    #[test]
    fn target_angle__places_index_zero_under_pointer() {
        assert_eq!(target_angle(0), 255.0);
        assert_eq!(segment_at_pointer(target_angle(0)), 0);
    }

    #[test]
    fn target_angle__is_inverse_of_segment_at_pointer() {
        for i in 0..SEGMENT_COUNT {
            assert_eq!(segment_at_pointer(target_angle(i)), i, "segment {i}");
        }
        let distinct: HashSet<_> = (0..SEGMENT_COUNT)
            .map(|i| target_angle(i) as i64)
            .collect();
        assert_eq!(distinct.len(), SEGMENT_COUNT);
    }

    #[test]
    fn normalized_delta__maps_into_half_open_range() {
        assert_eq!(normalized_delta(-30.0), 330.0);
        assert_eq!(normalized_delta(720.0), 0.0);
        assert_eq!(normalized_delta(359.5), 359.5);
        assert!(normalized_delta(-1e-18) < 360.0);
    }

    #[test]
    fn cell_for_segment__covers_every_cell_once() {
        let cells: HashSet<_> = (0..SEGMENT_COUNT).map(cell_for_segment).collect();
        assert_eq!(cells.len(), 12);
        assert_eq!(cell_for_segment(0).to_string(), "K of Spades");
        assert_eq!(cell_for_segment(1).to_string(), "J of Diamonds");
    }

    #[test]
    fn spin_plan__total_rotation_lands_on_target() {
        let plan = SpinPlan::new(7, 4, 123.4, 0.0, OutcomeSource::Fallback, "x");
        let landed = normalized_delta(plan.start_angle + plan.total_rotation_degrees);
        assert!((landed - target_angle(7)).abs() < 1e-9);
        assert!(plan.total_rotation_degrees >= 4.0 * 360.0);
        assert!(plan.total_rotation_degrees < 5.0 * 360.0);
    }

    #[test]
    fn build_plan__uses_accepted_outcome_for_armed_cycle() {
        // given
        let mut resolver = OutcomeResolver::new();
        let mut rng = StdRng::seed_from_u64(7);
        resolver.arm("12:00:00");
        resolver.accept(
            "12:00:00",
            Ok(Outcome {
                target_segment_index: 9,
                payout_multiplier: 10.0,
            }),
        );

        // when
        let plan = resolver.build_plan("12:00:00", 0.0, 120.0, &mut rng);

        // then
        assert_eq!(plan.target_segment_index, 9);
        assert!(SPIN_COUNT_RANGE.contains(&plan.spin_count));
        assert_eq!(
            plan.source,
            OutcomeSource::Authoritative {
                payout_multiplier: 10.0
            }
        );
        assert!(!resolver.has_outcome());
    }

    #[test]
    fn build_plan__falls_back_to_segment_zero_without_outcome() {
        let mut resolver = OutcomeResolver::new();
        let mut rng = StdRng::seed_from_u64(1);
        resolver.arm("12:00:00");
        resolver.accept("12:00:00", Err(RemoteError::Malformed("no index".into())));

        let plan = resolver.build_plan("12:00:00", 90.0, 120.0, &mut rng);

        assert_eq!(plan.target_segment_index, FALLBACK_SEGMENT);
        assert_eq!(plan.source, OutcomeSource::Fallback);
    }

    #[test]
    fn accept__ignores_results_for_stale_cycles() {
        let mut resolver = OutcomeResolver::new();
        resolver.arm("12:02:00");
        let kept = resolver.accept(
            "12:00:00",
            Ok(Outcome {
                target_segment_index: 3,
                payout_multiplier: 2.0,
            }),
        );
        assert!(!kept);
        assert!(!resolver.has_outcome());
    }

    #[derive(Default)]
    struct SilentLedger {
        calls: AtomicUsize,
    }

    impl RemoteLedger for SilentLedger {
        async fn dashboard(&self, _user_id: &str) -> Result<DashboardData, RemoteError> {
            std::future::pending().await
        }

        async fn outcome(&self, _label: &str, _user: &str) -> Result<Outcome, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn submit_wagers(&self, _batch: &WagerBatch) -> Result<WagerReceipt, RemoteError> {
            std::future::pending().await
        }

        async fn claim(&self, _ticket_serial: &str) -> Result<ClaimReceipt, RemoteError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn fetch__gives_up_within_window_after_one_retry() {
        // given
        let remote = SilentLedger::default();
        let window = Duration::from_millis(60);
        let started = std::time::Instant::now();

        // when
        let result = OutcomeResolver::fetch(&remote, "12:00:00", "7", window).await;

        // then
        assert!(matches!(result, Err(RemoteError::Transient(_))));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
