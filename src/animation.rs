//! Stateless spin easing. Any renderer may sample it at any rate.

use crate::outcome::{
    SpinPlan,
    normalized_delta,
};

pub const SPIN_DURATION_SECS: f64 = 4.0;
pub const LINEAR_PHASE_SECS: f64 = 3.0;
/// Share of the total rotation covered by the linear phase.
pub const LINEAR_SHARE: f64 = 0.75;

fn elapsed(plan: &SpinPlan, now: f64) -> f64 {
    (now - plan.spin_start_timestamp).clamp(0.0, SPIN_DURATION_SECS)
}

/// Unreduced rotation travelled since the spin started.
pub fn displacement(plan: &SpinPlan, now: f64) -> f64 {
    let t = elapsed(plan, now);
    let total = plan.total_rotation_degrees;
    if t >= SPIN_DURATION_SECS {
        return total;
    }
    if t <= LINEAR_PHASE_SECS {
        return LINEAR_SHARE * total * (t / LINEAR_PHASE_SECS);
    }
    let u = (t - LINEAR_PHASE_SECS) / (SPIN_DURATION_SECS - LINEAR_PHASE_SECS);
    let eased = 1.0 - (1.0 - u) * (1.0 - u);
    LINEAR_SHARE * total + (1.0 - LINEAR_SHARE) * total * eased
}

/// Display angle in `[0, 360)`.
pub fn angle(plan: &SpinPlan, now: f64) -> f64 {
    normalized_delta(plan.start_angle + displacement(plan, now))
}

pub fn is_settled(plan: &SpinPlan, now: f64) -> bool {
    now - plan.spin_start_timestamp >= SPIN_DURATION_SECS
}
