//! Temperature scaling of predicted correctness, fitted per (exam, subject).
//!
//! The fit minimizes negative log-likelihood over `u = ln T` with a one-dimensional
//! BFGS iteration and Armijo backtracking. Profiles are published as immutable
//! snapshots; the interaction path only reads them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{TutorError, TutorResult};
use crate::tutor::config::CalibrationConfig;
use crate::tutor::modeling::sigmoid;
use crate::tutor::types::{CalibrationMeta, Interaction};

const LOGIT_EPS: f64 = 1e-6;
const ARMIJO_C: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub predicted: f64,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub exam: String,
    pub subject: String,
    pub temperature: f64,
    /// ECE after applying `temperature`.
    pub ece: f64,
    pub ece_before: f64,
    pub sample_count: usize,
    pub calibrated: bool,
    pub fitted_at: DateTime<Utc>,
}

impl CalibrationProfile {
    pub fn uncalibrated(exam: &str, subject: &str, sample_count: usize, ece: f64) -> Self {
        Self {
            exam: exam.to_string(),
            subject: subject.to_string(),
            temperature: 1.0,
            ece,
            ece_before: ece,
            sample_count,
            calibrated: false,
            fitted_at: Utc::now(),
        }
    }

    pub fn apply(&self, p: f64) -> f64 {
        apply_temperature(p, self.temperature)
    }

    pub fn meta(&self) -> CalibrationMeta {
        CalibrationMeta {
            temperature: self.temperature,
            calibrated: self.calibrated,
        }
    }
}

pub fn logit(p: f64) -> f64 {
    let p = p.clamp(LOGIT_EPS, 1.0 - LOGIT_EPS);
    (p / (1.0 - p)).ln()
}

/// `sigmoid(logit(p) / T)`.
pub fn apply_temperature(p: f64, temperature: f64) -> f64 {
    if !temperature.is_finite() || temperature <= 0.0 {
        return p;
    }
    sigmoid(logit(p) / temperature)
}

/// Expected calibration error over equal-width confidence bins.
pub fn expected_calibration_error(samples: &[CalibrationSample], bins: usize, temperature: f64) -> f64 {
    if samples.is_empty() || bins == 0 {
        return 0.0;
    }
    let mut count = vec![0usize; bins];
    let mut conf_sum = vec![0.0f64; bins];
    let mut hit_sum = vec![0.0f64; bins];
    for sample in samples {
        let p = apply_temperature(sample.predicted, temperature);
        let idx = ((p * bins as f64) as usize).min(bins - 1);
        count[idx] += 1;
        conf_sum[idx] += p;
        if sample.correct {
            hit_sum[idx] += 1.0;
        }
    }
    let n = samples.len() as f64;
    (0..bins)
        .filter(|&i| count[i] > 0)
        .map(|i| {
            let c = count[i] as f64;
            (c / n) * (hit_sum[i] / c - conf_sum[i] / c).abs()
        })
        .sum()
}

/// Mean NLL and its derivative with respect to `u = ln T`.
fn nll_and_grad(logits: &[f64], labels: &[f64], u: f64) -> (f64, f64) {
    let t = u.exp();
    let n = logits.len() as f64;
    let mut nll = 0.0;
    let mut grad = 0.0;
    for (&z, &y) in logits.iter().zip(labels) {
        let scaled = z / t;
        let q = sigmoid(scaled).clamp(LOGIT_EPS, 1.0 - LOGIT_EPS);
        nll -= y * q.ln() + (1.0 - y) * (1.0 - q).ln();
        grad += (q - y) * (-scaled);
    }
    (nll / n, grad / n)
}

#[derive(Debug, Clone)]
pub struct TemperatureFitter {
    config: CalibrationConfig,
}

impl TemperatureFitter {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    fn subsample<'a>(&self, samples: &'a [CalibrationSample]) -> std::borrow::Cow<'a, [CalibrationSample]> {
        if samples.len() <= self.config.max_fit_samples {
            return std::borrow::Cow::Borrowed(samples);
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut owned = samples.to_vec();
        owned.shuffle(&mut rng);
        owned.truncate(self.config.max_fit_samples);
        std::borrow::Cow::Owned(owned)
    }

    pub fn fit_temperature(&self, samples: &[CalibrationSample]) -> TutorResult<f64> {
        if samples.len() < self.config.min_samples {
            return Err(TutorError::InsufficientData(format!(
                "{} samples, need {}",
                samples.len(),
                self.config.min_samples
            )));
        }
        let window = self.subsample(samples);
        let logits: Vec<f64> = window.iter().map(|s| logit(s.predicted)).collect();
        let labels: Vec<f64> = window.iter().map(|s| if s.correct { 1.0 } else { 0.0 }).collect();

        let u_min = self.config.min_temperature.ln();
        let u_max = self.config.max_temperature.ln();
        let mut u = 0.0f64;
        let (mut f, mut g) = nll_and_grad(&logits, &labels, u);
        let mut inv_hessian = 1.0f64;

        for _ in 0..self.config.max_iterations {
            if g.abs() < self.config.tolerance {
                break;
            }
            let direction = -inv_hessian * g;
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let candidate = (u + step * direction).clamp(u_min, u_max);
                let (fc, gc) = nll_and_grad(&logits, &labels, candidate);
                if fc.is_finite() && fc <= f + ARMIJO_C * step * g * direction {
                    accepted = Some((candidate, fc, gc));
                    break;
                }
                step *= 0.5;
            }
            let Some((next_u, next_f, next_g)) = accepted else {
                break;
            };
            let s = next_u - u;
            let y = next_g - g;
            if s * y > f64::EPSILON {
                inv_hessian = s / y;
            }
            u = next_u;
            f = next_f;
            g = next_g;
            if s.abs() < self.config.tolerance {
                break;
            }
        }

        let temperature = u.exp();
        if !temperature.is_finite() || !f.is_finite() {
            return Err(TutorError::NumericalInstability(format!(
                "temperature fit diverged (T = {temperature})"
            )));
        }
        Ok(temperature.clamp(self.config.min_temperature, self.config.max_temperature))
    }

    /// Fits one (exam, subject) profile. Too little data or a failed fit yields
    /// an uncalibrated profile with `T = 1`.
    pub fn fit_calibration(&self, exam: &str, subject: &str, samples: &[CalibrationSample]) -> CalibrationProfile {
        let bins = self.config.bins;
        let ece_before = expected_calibration_error(samples, bins, 1.0);
        match self.fit_temperature(samples) {
            Ok(temperature) => {
                let ece = expected_calibration_error(samples, bins, temperature);
                tracing::info!(exam, subject, temperature, ece_before, ece, samples = samples.len(), "calibration profile fitted");
                CalibrationProfile {
                    exam: exam.to_string(),
                    subject: subject.to_string(),
                    temperature,
                    ece,
                    ece_before,
                    sample_count: samples.len(),
                    calibrated: true,
                    fitted_at: Utc::now(),
                }
            }
            Err(err) => {
                tracing::warn!(exam, subject, error = %err, "calibration left at T = 1");
                CalibrationProfile::uncalibrated(exam, subject, samples.len(), ece_before)
            }
        }
    }
}

impl Default for TemperatureFitter {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

/// Groups logged interactions into per-(exam, subject) calibration windows.
pub fn samples_by_profile<'a, I>(interactions: I) -> HashMap<(String, String), Vec<CalibrationSample>>
where
    I: IntoIterator<Item = &'a Interaction>,
{
    let mut grouped: HashMap<(String, String), Vec<CalibrationSample>> = HashMap::new();
    for interaction in interactions {
        grouped
            .entry((interaction.exam.clone(), interaction.subject.clone()))
            .or_default()
            .push(CalibrationSample {
                predicted: interaction.predicted_correctness,
                correct: interaction.correct,
            });
    }
    grouped
}

type ProfileMap = HashMap<(String, String), CalibrationProfile>;

/// Snapshot store of the latest calibration profiles.
#[derive(Debug, Default)]
pub struct CalibrationRegistry {
    current: RwLock<Arc<ProfileMap>>,
}

impl CalibrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<ProfileMap> {
        Arc::clone(&self.current.read())
    }

    pub fn lookup(&self, exam: &str, subject: &str) -> Option<CalibrationProfile> {
        self.snapshot()
            .get(&(exam.to_string(), subject.to_string()))
            .cloned()
    }

    /// Merges `profiles` into a copy of the current map and swaps it in.
    pub fn publish(&self, profiles: impl IntoIterator<Item = CalibrationProfile>) -> usize {
        let mut next: ProfileMap = (*self.snapshot()).clone();
        let mut published = 0;
        for profile in profiles {
            next.insert((profile.exam.clone(), profile.subject.clone()), profile);
            published += 1;
        }
        *self.current.write() = Arc::new(next);
        published
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn synthetic(n: usize, sharpen: f64, seed: u64) -> Vec<CalibrationSample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let truth: f64 = rng.random_range(0.05..0.95);
                let correct = rng.random::<f64>() < truth;
                CalibrationSample {
                    predicted: sigmoid(logit(truth) * sharpen),
                    correct,
                }
            })
            .collect()
    }

    #[test]
    fn calibrated_data_fits_unit_temperature() {
        let fitter = TemperatureFitter::default();
        let samples = synthetic(4000, 1.0, 11);
        let t = fitter.fit_temperature(&samples).unwrap();
        assert!((t - 1.0).abs() < 0.15, "T = {t}");
    }

    #[test]
    fn overconfident_predictions_get_higher_temperature() {
        let fitter = TemperatureFitter::default();
        let samples = synthetic(4000, 3.0, 23);
        let profile = fitter.fit_calibration("jee", "physics", &samples);
        assert!(profile.calibrated);
        assert!(profile.temperature > 2.0 && profile.temperature < 4.0, "T = {}", profile.temperature);
        assert!(profile.ece < profile.ece_before);
    }

    #[test]
    fn insufficient_samples_leave_profile_uncalibrated() {
        let fitter = TemperatureFitter::default();
        let samples = synthetic(10, 1.0, 3);
        assert!(matches!(
            fitter.fit_temperature(&samples),
            Err(TutorError::InsufficientData(_))
        ));
        let profile = fitter.fit_calibration("jee", "math", &samples);
        assert!(!profile.calibrated);
        assert_eq!(profile.temperature, 1.0);
        assert_eq!(profile.sample_count, 10);
    }

    #[test]
    fn subsampled_fit_is_reproducible() {
        let fitter = TemperatureFitter::new(CalibrationConfig {
            max_fit_samples: 500,
            ..Default::default()
        });
        let samples = synthetic(3000, 2.0, 5);
        let a = fitter.fit_temperature(&samples).unwrap();
        let b = fitter.fit_temperature(&samples).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unit_temperature_is_identity() {
        for p in [0.1, 0.5, 0.83] {
            assert!((apply_temperature(p, 1.0) - p).abs() < 1e-9);
        }
        assert!(apply_temperature(0.9, 2.0) < 0.9);
        assert!(apply_temperature(0.1, 2.0) > 0.1);
    }

    #[test]
    fn registry_isolates_profiles_and_keeps_old_snapshots() {
        let registry = CalibrationRegistry::new();
        let before = registry.snapshot();
        let mut physics = CalibrationProfile::uncalibrated("jee", "physics", 100, 0.1);
        physics.temperature = 1.8;
        physics.calibrated = true;
        registry.publish(vec![physics, CalibrationProfile::uncalibrated("jee", "math", 3, 0.0)]);

        assert!(before.is_empty());
        assert_eq!(registry.lookup("jee", "physics").unwrap().temperature, 1.8);
        assert!(!registry.lookup("jee", "math").unwrap().calibrated);
        assert!(registry.lookup("neet", "physics").is_none());
        assert_eq!(registry.len(), 2);
    }
}
