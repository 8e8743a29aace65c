//! Two-point FOPDT fit of a recorded step response
//!
//! Given the open-loop response to a power step, the times at which the
//! temperature crosses 28.3% and 63.2% of its total rise pin down the
//! time constant and dead time of a first-order-plus-dead-time model.

/// Fewest samples a session can be identified from
const MIN_SAMPLES: usize = 10;
/// Samples averaged to estimate the settled temperature
const SETTLE_WINDOW: usize = 5;
/// Smallest rise considered a real response, in celcius
const MIN_DELTA_C: f32 = 2.0;
/// 28.3% point of a first order rise
const RISE_FRAC_T1: f32 = 0.283;
/// 63.2% point of a first order rise
const RISE_FRAC_T2: f32 = 0.632;

/// First-order-plus-dead-time process model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FopdtModel {
    /// Process gain in celcius per percent of output
    pub gain: f32,
    /// Time constant in seconds
    pub tau_s: f32,
    /// Dead time in seconds
    pub dead_time_s: f32,
    /// Total rise of the step response in celcius
    pub delta_temp_c: f32,
}

/// Fit a model to `(elapsed_s, temp_c)` samples, or decide there is no
/// model in them: too few points, a negligible rise, or rise targets the
/// recording never crossed all yield `None` rather than a degenerate fit.
pub fn identify(samples: &[(f32, f32)], base_temp_c: f32, step_pwr_pct: f32) -> Option<FopdtModel> {
    if samples.len() < MIN_SAMPLES {
        return None;
    }

    let settle = &samples[samples.len() - SETTLE_WINDOW..];
    let final_temp = settle.iter().map(|(_, t)| t).sum::<f32>() / SETTLE_WINDOW as f32;

    let delta = final_temp - base_temp_c;

    if delta <= MIN_DELTA_C {
        return None;
    }

    let gain = delta / step_pwr_pct;

    let t1 = crossing_time(samples, base_temp_c + delta * RISE_FRAC_T1)?;
    let t2 = crossing_time(samples, base_temp_c + delta * RISE_FRAC_T2)?;

    // A transient dip can make the scan land the second crossing at or
    // before the first; that is noise, not a first order rise
    if t2 <= t1 {
        return None;
    }

    let mut tau = 1.5 * (t2 - t1);
    let mut theta = t2 - tau;

    // Guard against near-zero artifacts from short noisy tests
    if theta < 0.1 {
        theta = 0.5;
    }
    if tau < 1.0 {
        tau = 1.0;
    }

    Some(FopdtModel {
        gain: round_to(gain, 4),
        tau_s: round_to(tau, 2),
        dead_time_s: round_to(theta, 2),
        delta_temp_c: round_to(delta, 1),
    })
}

/// Scan for the first pair of consecutive samples bracketing `target`
/// and interpolate the crossing time between them
fn crossing_time(samples: &[(f32, f32)], target: f32) -> Option<f32> {
    for pair in samples.windows(2) {
        let (t_curr, y_curr) = pair[0];
        let (t_next, y_next) = pair[1];

        if y_curr <= target && target <= y_next {
            let dy = y_next - y_curr;

            if dy == 0.0 {
                continue;
            }

            let ratio = (target - y_curr) / dy;

            return Some(t_curr + (t_next - t_curr) * ratio);
        }
    }

    None
}

/// Round for display stability
pub(crate) fn round_to(val: f32, digits: i32) -> f32 {
    let scale = 10_f32.powi(digits);

    (val * scale).round() / scale
}
