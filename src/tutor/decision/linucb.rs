use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{TutorError, TutorResult};
use crate::tutor::config::BanditConfig;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Feature order of the current schema. Appending is the only allowed change.
pub const FEATURE_NAMES: [&str; 9] = [
    "bias",
    "difficulty",
    "mastery_gap",
    "stress",
    "cognitive_load",
    "scoring_risk",
    "time_pressure",
    "predicted_correctness",
    "review_due",
];

pub const FEATURE_DIM: usize = FEATURE_NAMES.len();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub dim: usize,
}

impl FeatureSchema {
    pub fn current() -> Self {
        Self {
            version: FEATURE_SCHEMA_VERSION,
            dim: FEATURE_DIM,
        }
    }

    pub fn id(&self) -> String {
        format!("ctx-v{}-d{}", self.version, self.dim)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UcbScore {
    pub estimate: f64,
    pub bonus: f64,
    pub ucb: f64,
}

/// Shared linear UCB model: `ucb = θᵀx + α·sqrt(xᵀA⁻¹x)` with `θ = A⁻¹b`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinUcbModel {
    schema: FeatureSchema,
    alpha: f64,
    lambda: f64,
    a: Vec<Vec<f64>>,
    b: Vec<f64>,
    #[serde(default)]
    updates: u64,
}

impl LinUcbModel {
    pub fn new(schema: FeatureSchema, alpha: f64, lambda: f64) -> Self {
        let d = schema.dim;
        let mut a = vec![vec![0.0; d]; d];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = lambda;
        }
        Self {
            schema,
            alpha,
            lambda,
            a,
            b: vec![0.0; d],
            updates: 0,
        }
    }

    pub fn from_config(config: &BanditConfig) -> Self {
        Self::new(FeatureSchema::current(), config.alpha, config.lambda)
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn dim(&self) -> usize {
        self.schema.dim
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Detects shape mismatches and non-finite statistics.
    pub fn validate(&self) -> TutorResult<()> {
        let d = self.schema.dim;
        if d == 0 {
            return Err(TutorError::ModelUnavailable("bandit model has zero dimension".into()));
        }
        if self.a.len() != d || self.a.iter().any(|row| row.len() != d) || self.b.len() != d {
            return Err(TutorError::ModelUnavailable(format!(
                "bandit statistics do not match schema {}",
                self.schema.id()
            )));
        }
        let finite = self.a.iter().flatten().chain(self.b.iter()).all(|v| v.is_finite());
        if !finite || !self.alpha.is_finite() {
            return Err(TutorError::ModelUnavailable("bandit statistics contain NaN/inf".into()));
        }
        if (0..d).any(|i| self.a[i][i] <= 0.0) {
            return Err(TutorError::ModelUnavailable("covariance diagonal is not positive".into()));
        }
        Ok(())
    }

    /// Zero-pads covariance and reward statistics up to `target`; the new
    /// diagonal starts at the identity prior. Shrinking is rejected.
    pub fn migrate(&mut self, target: FeatureSchema) -> TutorResult<()> {
        let old = self.schema.dim;
        let new = target.dim;
        if target.version < self.schema.version {
            return Err(TutorError::ModelUnavailable(format!(
                "schema {} is older than active {}",
                target.id(),
                self.schema.id()
            )));
        }
        if new < old {
            return Err(TutorError::ModelUnavailable(format!(
                "refusing to truncate bandit state from {old} to {new} features"
            )));
        }
        for row in self.a.iter_mut() {
            row.resize(new, 0.0);
        }
        for i in old..new {
            let mut row = vec![0.0; new];
            row[i] = self.lambda;
            self.a.push(row);
        }
        self.b.resize(new, 0.0);
        tracing::info!(from = %self.schema.id(), to = %target.id(), "bandit schema migrated");
        self.schema = target;
        Ok(())
    }

    pub fn scorer(&self) -> TutorResult<LinUcbScorer> {
        self.validate()?;
        let a_inv = invert_matrix(&self.a);
        let theta = matrix_vector_mul(&a_inv, &self.b);
        if theta.iter().any(|v| !v.is_finite()) {
            return Err(TutorError::ModelUnavailable("θ is not finite".into()));
        }
        Ok(LinUcbScorer {
            dim: self.schema.dim,
            alpha: self.alpha,
            a_inv,
            theta,
        })
    }

    pub fn update(&mut self, x: &[f64], reward: f64) -> TutorResult<()> {
        let d = self.schema.dim;
        if x.len() != d {
            return Err(TutorError::ModelUnavailable(format!(
                "feature vector has {} values, schema {} expects {d}",
                x.len(),
                self.schema.id()
            )));
        }
        if !reward.is_finite() || x.iter().any(|v| !v.is_finite()) {
            return Err(TutorError::NumericalInstability("non-finite bandit observation".into()));
        }
        for i in 0..d {
            for j in 0..d {
                self.a[i][j] += x[i] * x[j];
            }
            self.b[i] += reward * x[i];
        }
        self.updates += 1;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self) {
        self.a[0][0] = f64::NAN;
    }
}

/// Precomputed `A⁻¹` and `θ` for scoring many candidates against one snapshot.
#[derive(Debug, Clone)]
pub struct LinUcbScorer {
    dim: usize,
    alpha: f64,
    a_inv: Vec<Vec<f64>>,
    theta: Vec<f64>,
}

impl LinUcbScorer {
    pub fn score(&self, x: &[f64]) -> TutorResult<UcbScore> {
        if x.len() != self.dim {
            return Err(TutorError::ModelUnavailable(format!(
                "feature vector has {} values, expected {}",
                x.len(),
                self.dim
            )));
        }
        let estimate = dot_product(&self.theta, x);
        let temp = matrix_vector_mul(&self.a_inv, x);
        let bonus = self.alpha * dot_product(x, &temp).max(0.0).sqrt();
        let ucb = estimate + bonus;
        if !ucb.is_finite() {
            return Err(TutorError::NumericalInstability("UCB score is not finite".into()));
        }
        Ok(UcbScore { estimate, bonus, ucb })
    }
}

/// Gauss-Jordan inversion with partial pivoting; singular pivots are nudged.
fn invert_matrix(m: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = m.len();
    let mut aug = vec![vec![0.0; 2 * n]; n];
    for i in 0..n {
        aug[i][..n].copy_from_slice(&m[i][..n]);
        aug[i][n + i] = 1.0;
    }

    let mut is_singular = false;
    for i in 0..n {
        let mut max_row = i;
        for k in (i + 1)..n {
            if aug[k][i].abs() > aug[max_row][i].abs() {
                max_row = k;
            }
        }
        aug.swap(i, max_row);

        if aug[i][i].abs() < 1e-10 {
            is_singular = true;
            aug[i][i] = 1e-10;
        }
        let pivot = aug[i][i];
        for v in aug[i].iter_mut() {
            *v /= pivot;
        }
        for k in 0..n {
            if k != i {
                let factor = aug[k][i];
                if factor != 0.0 {
                    for j in 0..(2 * n) {
                        aug[k][j] -= factor * aug[i][j];
                    }
                }
            }
        }
    }

    let mut result = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            let val = aug[i][n + j];
            result[i][j] = if val.is_finite() {
                val
            } else if i == j {
                1.0
            } else {
                0.0
            };
        }
    }
    if is_singular {
        for (i, row) in result.iter_mut().enumerate() {
            row[i] = row[i].max(1e-6);
        }
    }
    result
}

fn matrix_vector_mul(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| dot_product(row, v)).collect()
}

fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditObservation {
    pub schema_version: u32,
    pub features: Vec<f64>,
    pub reward: f64,
}

/// Accumulate-then-merge store for the shared bandit model.
///
/// Interactions append observations to a pending queue; a merge applies the
/// queue to a private copy of the model and swaps the published snapshot.
/// Every writer of the snapshot holds `merge_lock`, so concurrent merges
/// apply their batches one after another.
#[derive(Debug)]
pub struct BanditStore {
    config: BanditConfig,
    model: RwLock<Arc<LinUcbModel>>,
    pending: Mutex<Vec<BanditObservation>>,
    merge_lock: Mutex<()>,
}

impl BanditStore {
    pub fn new(config: BanditConfig) -> Self {
        let model = LinUcbModel::from_config(&config);
        Self::with_model(config, model)
    }

    pub fn with_model(config: BanditConfig, model: LinUcbModel) -> Self {
        Self {
            config,
            model: RwLock::new(Arc::new(upgraded(model))),
            pending: Mutex::new(Vec::new()),
            merge_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<LinUcbModel> {
        Arc::clone(&self.model.read())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Publishes a replacement model, e.g. one restored from storage. Models
    /// from an older feature schema are widened to the current one first.
    pub fn replace(&self, model: LinUcbModel) {
        let model = upgraded(model);
        let _merging = self.merge_lock.lock();
        *self.model.write() = Arc::new(model);
    }

    /// Queues one observation and merges once the batch threshold is reached.
    /// Returns the number of merged observations.
    pub fn record(&self, observation: BanditObservation) -> usize {
        let ready = {
            let mut pending = self.pending.lock();
            pending.push(observation);
            pending.len() >= self.config.merge_batch_size.max(1)
        };
        if ready {
            self.merge()
        } else {
            0
        }
    }

    pub fn merge(&self) -> usize {
        let _merging = self.merge_lock.lock();
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }
        let mut next = upgraded((*self.snapshot()).clone());
        if let Err(err) = next.validate() {
            tracing::warn!(error = %err, dropped = batch.len(), "bandit model unusable, merge skipped");
            return 0;
        }
        let version = next.schema().version;
        let mut merged = 0;
        for obs in &batch {
            if obs.schema_version != version {
                tracing::debug!(expected = version, got = obs.schema_version, "stale bandit observation dropped");
                continue;
            }
            let reward = obs.reward.clamp(0.0, self.config.reward_cap);
            match next.update(&obs.features, reward) {
                Ok(()) => merged += 1,
                Err(err) => tracing::debug!(error = %err, "bandit observation rejected"),
            }
        }
        if let Err(err) = next.validate() {
            tracing::warn!(error = %err, "merged bandit model invalid, keeping previous snapshot");
            return 0;
        }
        *self.model.write() = Arc::new(next);
        tracing::debug!(merged, "bandit batch merged");
        merged
    }

    /// Migrates the published model to a wider schema.
    pub fn migrate(&self, target: FeatureSchema) -> TutorResult<()> {
        let _merging = self.merge_lock.lock();
        let mut next = (*self.snapshot()).clone();
        next.migrate(target)?;
        *self.model.write() = Arc::new(next);
        Ok(())
    }
}

/// Widens a model from an older schema version to the current one. A model
/// that cannot be migrated is returned untouched and scoring reports it
/// unavailable.
fn upgraded(mut model: LinUcbModel) -> LinUcbModel {
    if model.schema().version < FEATURE_SCHEMA_VERSION {
        if let Err(err) = model.migrate(FeatureSchema::current()) {
            tracing::warn!(schema = %model.schema().id(), error = %err, "bandit schema migration failed");
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(dim: usize) -> FeatureSchema {
        FeatureSchema { version: 1, dim }
    }

    #[test]
    fn new_initializes_scaled_identity() {
        let model = LinUcbModel::new(schema(4), 0.5, 2.0);
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(model.a[i][j], if i == j { 2.0 } else { 0.0 });
            }
        }
        assert!(model.b.iter().all(|&v| v == 0.0));
        assert!(model.validate().is_ok());
    }

    #[test]
    fn untrained_model_scores_by_exploration_only() {
        let model = LinUcbModel::new(schema(3), 1.0, 1.0);
        let scorer = model.scorer().unwrap();
        let score = scorer.score(&[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(score.estimate, 0.0);
        assert!((score.bonus - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rewarded_direction_gains_estimate_and_loses_uncertainty() {
        let mut model = LinUcbModel::new(schema(2), 1.0, 1.0);
        let before = model.scorer().unwrap().score(&[1.0, 0.0]).unwrap();
        for _ in 0..20 {
            model.update(&[1.0, 0.0], 1.0).unwrap();
        }
        let scorer = model.scorer().unwrap();
        let after = scorer.score(&[1.0, 0.0]).unwrap();
        let other = scorer.score(&[0.0, 1.0]).unwrap();
        assert!(after.estimate > 0.9);
        assert!(after.bonus < before.bonus);
        assert!(after.ucb > other.ucb);
    }

    #[test]
    fn update_rejects_wrong_dimension() {
        let mut model = LinUcbModel::new(schema(3), 1.0, 1.0);
        assert!(model.update(&[0.5, 0.5], 1.0).is_err());
        assert_eq!(model.updates(), 0);
    }

    #[test]
    fn migration_zero_pads_and_keeps_statistics() {
        let mut model = LinUcbModel::new(schema(2), 1.0, 1.0);
        model.update(&[1.0, 0.5], 1.0).unwrap();
        let (a01, b0) = (model.a[0][1], model.b[0]);

        model.migrate(FeatureSchema { version: 2, dim: 4 }).unwrap();
        assert_eq!(model.dim(), 4);
        assert_eq!(model.a[0][1], a01);
        assert_eq!(model.b[0], b0);
        assert_eq!(model.a[3][3], 1.0);
        assert_eq!(model.a[0][3], 0.0);
        assert_eq!(model.b[3], 0.0);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn migration_never_truncates() {
        let mut model = LinUcbModel::new(schema(4), 1.0, 1.0);
        assert!(model.migrate(FeatureSchema { version: 2, dim: 3 }).is_err());
        assert_eq!(model.dim(), 4);
    }

    #[test]
    fn corrupted_model_fails_validation() {
        let mut model = LinUcbModel::new(schema(3), 1.0, 1.0);
        model.corrupt_for_test();
        assert!(matches!(model.validate(), Err(TutorError::ModelUnavailable(_))));
        assert!(model.scorer().is_err());
    }

    #[test]
    fn invert_matrix_handles_singular() {
        let inv = invert_matrix(&[vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert!(inv[0][0] >= 1e-6);
        assert!(inv.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn store_merges_at_batch_threshold() {
        let config = BanditConfig {
            merge_batch_size: 3,
            ..Default::default()
        };
        let store = BanditStore::new(config);
        let before = store.snapshot();
        let obs = BanditObservation {
            schema_version: FEATURE_SCHEMA_VERSION,
            features: vec![0.5; FEATURE_DIM],
            reward: 1.0,
        };
        assert_eq!(store.record(obs.clone()), 0);
        assert_eq!(store.record(obs.clone()), 0);
        assert_eq!(store.pending_len(), 2);
        assert_eq!(store.record(obs), 3);
        assert_eq!(store.pending_len(), 0);
        assert_eq!(before.updates(), 0);
        assert_eq!(store.snapshot().updates(), 3);
    }

    #[test]
    fn concurrent_merges_keep_every_observation() {
        let config = BanditConfig {
            merge_batch_size: 1,
            ..Default::default()
        };
        let store = BanditStore::new(config);
        let obs = BanditObservation {
            schema_version: FEATURE_SCHEMA_VERSION,
            features: vec![0.25; FEATURE_DIM],
            reward: 0.5,
        };
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        store.record(obs.clone());
                    }
                });
            }
        });
        store.merge();
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.snapshot().updates(), 1600);
    }

    #[test]
    fn restored_model_from_older_schema_is_widened() {
        let mut old = LinUcbModel::new(FeatureSchema { version: 0, dim: 7 }, 0.5, 1.0);
        old.update(&[1.0, 0.2, 0.3, 0.0, 0.0, 0.1, 0.4], 1.0).unwrap();
        let (a01, b0) = (old.a[0][1], old.b[0]);

        let store = BanditStore::new(BanditConfig::default());
        store.replace(old);
        let model = store.snapshot();
        assert_eq!(model.schema(), &FeatureSchema::current());
        assert_eq!(model.updates(), 1);
        assert_eq!(model.a[0][1], a01);
        assert_eq!(model.b[0], b0);
        assert!(model.scorer().is_ok());

        store.record(BanditObservation {
            schema_version: FEATURE_SCHEMA_VERSION,
            features: vec![0.5; FEATURE_DIM],
            reward: 1.0,
        });
        assert_eq!(store.merge(), 1);
        assert_eq!(store.snapshot().updates(), 2);
    }

    #[test]
    fn newer_or_narrower_models_are_left_alone() {
        let store = BanditStore::new(BanditConfig::default());
        store.replace(LinUcbModel::new(FeatureSchema { version: 1, dim: 3 }, 0.5, 1.0));
        assert_eq!(store.snapshot().dim(), 3);
    }

    #[test]
    fn store_drops_observations_from_other_schema() {
        let store = BanditStore::new(BanditConfig::default());
        store.record(BanditObservation {
            schema_version: FEATURE_SCHEMA_VERSION + 1,
            features: vec![0.5; FEATURE_DIM],
            reward: 1.0,
        });
        assert_eq!(store.merge(), 0);
        assert_eq!(store.snapshot().updates(), 0);
    }
}
