//! IMC gain synthesis from an FOPDT model

use crate::fopdt::{round_to, FopdtModel};

/// Divisor applied to the classical IMC derivative term. The full term
/// brakes hard enough on slow thermal plants to shut the heater down
/// before the setpoint; a quarter of it keeps the brake gentle.
const TD_DAMPING_DIV: f32 = 4.0;

/// Ratio of tau used for lambda when the caller doesn't pick one
const DEFAULT_LAMBDA_RATIO: f32 = 0.5;

/// Standard-form PID gains. Always derived, never stored as ground
/// truth: recompute from the model whenever lambda changes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Gains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

/// Internal Model Control synthesis. Pure: the same model and lambda
/// always produce the same gains, so it can rerun on every lambda change
/// without touching the step test.
pub fn imc_gains(model: &FopdtModel, lambda_s: Option<f32>) -> Gains {
    let (gain, tau, theta) = (model.gain, model.tau_s, model.dead_time_s);

    if gain == 0.0 {
        return Gains::default();
    }

    let lambda = lambda_s.unwrap_or(tau * DEFAULT_LAMBDA_RATIO);

    let kc = (1.0 / gain) * (tau + 0.5 * theta) / (lambda + 0.5 * theta);
    let ti = tau + 0.5 * theta;

    let td_denom = 2.0 * tau + theta;
    let td_raw = match td_denom == 0.0 {
        true => 0.0,
        false => (tau * theta) / td_denom,
    };
    let td = td_raw / TD_DAMPING_DIV;

    let ki = match ti > 0.0 {
        true => kc / ti,
        false => 0.0,
    };

    Gains {
        kp: round_to(kc, 2),
        ki: round_to(ki, 3),
        kd: round_to(kc * td, 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> FopdtModel {
        FopdtModel {
            gain: 0.5,
            tau_s: 15.0,
            dead_time_s: 5.0,
            delta_temp_c: 50.0,
        }
    }

    #[test]
    fn default_lambda_is_half_tau() {
        let explicit = imc_gains(&model(), Some(7.5));
        let implied = imc_gains(&model(), None);

        assert_eq!(explicit, implied);
    }

    #[test]
    fn gains_follow_the_formulas() {
        // Kc = (1/0.5) * 17.5 / 10.0 = 3.5, Ti = 17.5
        // Td_raw = 75/35 = 2.142857, Td = 0.535714
        let g = imc_gains(&model(), Some(7.5));

        assert_eq!(g.kp, 3.5);
        assert_eq!(g.ki, 0.2); // 3.5 / 17.5
        assert!((g.kd - 1.875).abs() < 0.01); // 3.5 * 0.535714, then display rounding
    }

    #[test]
    fn synthesis_is_pure() {
        let a = imc_gains(&model(), Some(4.0));
        let b = imc_gains(&model(), Some(4.0));

        assert_eq!(a, b);
    }

    #[test]
    fn lambda_trades_aggressiveness() {
        let fast = imc_gains(&model(), Some(2.0));
        let slow = imc_gains(&model(), Some(30.0));

        // Smaller lambda means a hotter controller across the board
        assert!(fast.kp > slow.kp);
        assert!(fast.ki > slow.ki);
        assert!(fast.kd > slow.kd);
    }

    #[test]
    fn zero_process_gain_yields_zero_gains() {
        let degenerate = FopdtModel {
            gain: 0.0,
            tau_s: 15.0,
            dead_time_s: 5.0,
            delta_temp_c: 0.0,
        };

        assert_eq!(imc_gains(&degenerate, None), Gains::default());
    }
}
