use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

static REGISTRY: OnceLock<Arc<ComponentRegistry>> = OnceLock::new();

pub fn registry() -> &'static Arc<ComponentRegistry> {
    REGISTRY.get_or_init(|| Arc::new(ComponentRegistry::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentId {
    Orchestrator,
    CognitiveLoad,
    TimeAllocator,
    MasteryEstimator,
    Scheduler,
    Selector,
    HeuristicFallback,
    BanditMerge,
    CalibrationFit,
    FairnessReport,
}

impl ComponentId {
    pub fn all() -> &'static [ComponentId] {
        &[
            ComponentId::Orchestrator,
            ComponentId::CognitiveLoad,
            ComponentId::TimeAllocator,
            ComponentId::MasteryEstimator,
            ComponentId::Scheduler,
            ComponentId::Selector,
            ComponentId::HeuristicFallback,
            ComponentId::BanditMerge,
            ComponentId::CalibrationFit,
            ComponentId::FairnessReport,
        ]
    }

    pub fn id(&self) -> &'static str {
        match self {
            ComponentId::Orchestrator => "orchestrator",
            ComponentId::CognitiveLoad => "modeling_cognitive_load",
            ComponentId::TimeAllocator => "modeling_time_budget",
            ComponentId::MasteryEstimator => "memory_mastery",
            ComponentId::Scheduler => "memory_half_life",
            ComponentId::Selector => "decision_linucb",
            ComponentId::HeuristicFallback => "decision_heuristic",
            ComponentId::BanditMerge => "batch_bandit_merge",
            ComponentId::CalibrationFit => "batch_calibration",
            ComponentId::FairnessReport => "batch_fairness",
        }
    }

    /// Batch components run off the interaction path.
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            ComponentId::BanditMerge | ComponentId::CalibrationFit | ComponentId::FairnessReport
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentMetricsSnapshot {
    pub call_count: u64,
    pub total_latency_us: u64,
    pub error_count: u64,
    pub last_called_at: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ComponentMetrics {
    call_count: AtomicU64,
    total_latency_us: AtomicU64,
    error_count: AtomicU64,
    last_called_at: AtomicU64,
}

impl ComponentMetrics {
    pub fn record_call(&self, latency_us: u64) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.last_called_at.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let calls = self.call_count();
        if calls == 0 {
            return 0.0;
        }
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        let avg = (total_us as f64 / calls as f64) / 1000.0;
        (avg * 10000.0).round() / 10000.0
    }

    pub fn last_called_at(&self) -> Option<u64> {
        match self.last_called_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn snapshot(&self) -> ComponentMetricsSnapshot {
        ComponentMetricsSnapshot {
            call_count: self.call_count(),
            total_latency_us: self.total_latency_us.load(Ordering::Relaxed),
            error_count: self.error_count(),
            last_called_at: self.last_called_at(),
        }
    }
}

pub struct ComponentRegistry {
    metrics: HashMap<ComponentId, ComponentMetrics>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        let metrics = ComponentId::all()
            .iter()
            .map(|id| (*id, ComponentMetrics::default()))
            .collect();
        Self { metrics }
    }

    pub fn record(&self, id: ComponentId, latency_us: u64) {
        if let Some(m) = self.metrics.get(&id) {
            m.record_call(latency_us);
        }
    }

    pub fn record_error(&self, id: ComponentId) {
        if let Some(m) = self.metrics.get(&id) {
            m.record_error();
        }
    }

    pub fn get(&self, id: ComponentId) -> Option<&ComponentMetrics> {
        self.metrics.get(&id)
    }

    pub fn snapshot(&self) -> Vec<ComponentStatus> {
        ComponentId::all()
            .iter()
            .filter_map(|id| {
                let m = self.metrics.get(id)?;
                let calls = m.call_count();
                let errors = m.error_count();
                let status = if calls == 0 {
                    "idle"
                } else if errors * 10 > calls {
                    "degraded"
                } else {
                    "healthy"
                };
                Some(ComponentStatus {
                    id: id.id().to_string(),
                    batch: id.is_batch(),
                    call_count: calls,
                    avg_latency_ms: m.avg_latency_ms(),
                    error_count: errors,
                    last_called_at: m.last_called_at(),
                    status: status.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub id: String,
    pub batch: bool,
    pub call_count: u64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub last_called_at: Option<u64>,
    pub status: String,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[macro_export]
macro_rules! track_component {
    ($id:expr, $body:expr) => {{
        let start = std::time::Instant::now();
        let result = $body;
        let latency_us = start.elapsed().as_micros() as u64;
        $crate::tutor::metrics::registry().record($id, latency_us);
        result
    }};
}
