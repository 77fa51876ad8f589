use serde::{Deserialize, Serialize};

use crate::error::TutorError;
use crate::tutor::config::{MASTERY_CEILING, MASTERY_FLOOR};

/// Keeps `slip + guess` strictly below one after any adjustment.
const SLIP_GUESS_MARGIN: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BktParams {
    pub slip: f64,
    pub guess: f64,
    pub learn: f64,
}

impl BktParams {
    pub fn new(slip: f64, guess: f64, learn: f64) -> Self {
        Self { slip, guess, learn }.sanitized()
    }

    /// Clamps every parameter into the probability band and lowers slip when
    /// the pair would violate `slip + guess < 1`.
    pub fn sanitized(self) -> Self {
        let guess = clamp_probability(self.guess);
        let mut slip = clamp_probability(self.slip);
        if slip + guess >= 1.0 - SLIP_GUESS_MARGIN {
            slip = (1.0 - SLIP_GUESS_MARGIN - guess).max(MASTERY_FLOOR);
        }
        Self {
            slip,
            guess,
            learn: clamp_probability(self.learn),
        }
    }

    pub fn scaled(self, adjustment: &ParameterAdjustment) -> Self {
        Self {
            slip: self.slip * adjustment.slip_multiplier,
            guess: self.guess,
            learn: self.learn * adjustment.learn_multiplier,
        }
        .sanitized()
    }
}

/// Multiplicative load-driven adjustment of BKT parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterAdjustment {
    pub slip_multiplier: f64,
    pub learn_multiplier: f64,
}

impl Default for ParameterAdjustment {
    fn default() -> Self {
        Self {
            slip_multiplier: 1.0,
            learn_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BktStep {
    pub posterior: f64,
    /// Posterior plus learning transition, before clamping.
    pub learned: f64,
    pub degraded: bool,
}

pub fn clamp_probability(p: f64) -> f64 {
    if !p.is_finite() {
        return MASTERY_FLOOR;
    }
    p.clamp(MASTERY_FLOOR, MASTERY_CEILING)
}

pub fn posterior(prior: f64, params: &BktParams, correct: bool, epsilon: f64) -> Result<f64, TutorError> {
    let (s, g) = (params.slip, params.guess);
    let (numerator, evidence) = if correct {
        let hit = prior * (1.0 - s);
        (hit, hit + (1.0 - prior) * g)
    } else {
        let miss = prior * s;
        (miss, miss + (1.0 - prior) * (1.0 - g))
    };

    if !evidence.is_finite() || evidence.abs() < epsilon {
        return Err(TutorError::NumericalInstability(format!(
            "evidence {evidence:e} below epsilon {epsilon:e}"
        )));
    }
    let value = numerator / evidence;
    if !value.is_finite() {
        return Err(TutorError::NumericalInstability(format!(
            "posterior is not finite for prior {prior}"
        )));
    }
    Ok(value.clamp(0.0, 1.0))
}

/// One Bayesian knowledge tracing step. On a degenerate evidence term the
/// prior is returned unchanged and the step is flagged degraded.
pub fn bkt_update(prior: f64, params: &BktParams, correct: bool, epsilon: f64) -> BktStep {
    match posterior(prior, params, correct, epsilon) {
        Ok(post) => BktStep {
            posterior: post,
            learned: post + (1.0 - post) * params.learn,
            degraded: false,
        },
        Err(err) => {
            tracing::warn!(error = %err, prior, "BKT evidence guard tripped, mastery left unchanged");
            BktStep {
                posterior: prior,
                learned: prior,
                degraded: true,
            }
        }
    }
}

/// Probability of a correct response given mastery.
pub fn predict_correct(mastery: f64, params: &BktParams) -> f64 {
    mastery * (1.0 - params.slip) + (1.0 - mastery) * params.guess
}
