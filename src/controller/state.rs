//! Controller state: parameters, committed metrics, and the derived-view
//! cache with its provenance stamps and in-flight tickets.

use std::sync::Arc;

use serde::Serialize;

use crate::api::{
    BoxStats, Correlation, DashboardResponse, FailureKind, FeatureVector, FetchError, Histogram,
    KComparison, Metrics, PredictedVsActual, PredictionResult, ScatterSample, SummaryTable,
};
use crate::params::{ModelParams, ParamKey};
use std::collections::BTreeMap;

/// Lifecycle of the dashboard artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedPhase {
    /// Nothing cached; the next access runs a full load.
    Empty,
    /// Full load in flight; consumers show a placeholder.
    Reloading,
    Loaded,
    /// Soft refresh in flight; the previous dashboard stays visible.
    Refreshing,
}

/// Front-end views. Focusing one counts as an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Predict,
    Dashboard,
    DataIo,
    Explainer,
}

impl View {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "predict" => Some(View::Predict),
            "dashboard" | "dash" => Some(View::Dashboard),
            "io" | "data" => Some(View::DataIo),
            "how" | "explainer" => Some(View::Explainer),
            _ => None,
        }
    }
}

/// Identity of one issued fetch. A completion is applied only while its
/// ticket is still the current intent of its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ticket {
    pub gen: u64,
    pub key: ParamKey,
}

/// A value together with the parameters that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stamped<T> {
    pub value: T,
    pub key: ParamKey,
}

impl<T> Stamped<T> {
    pub fn new(value: T, key: ParamKey) -> Self {
        Self { value, key }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardArtifact {
    // split-only
    pub bill_histogram: Histogram,
    pub box_plot: BTreeMap<String, BoxStats>,
    pub scatter: ScatterSample,
    pub correlation: Correlation,
    pub summary: SummaryTable,
    pub k_comparison: KComparison,
    // k-sensitive
    pub predicted_vs_actual: PredictedVsActual,
    pub residual_histogram: Histogram,
    pub k: u32,
    /// Set only by a full load.
    pub produced_at_split: u32,
    /// Set by a full load or a soft refresh.
    pub produced_at_k: u32,
}

impl DashboardArtifact {
    pub fn from_full_load(dash: DashboardResponse, k_comparison: KComparison, key: ParamKey) -> Self {
        Self {
            bill_histogram: dash.bill_histogram,
            box_plot: dash.box_plot,
            scatter: dash.scatter,
            correlation: dash.correlation,
            summary: dash.summary,
            k_comparison,
            predicted_vs_actual: dash.predicted_vs_actual,
            residual_histogram: dash.residual_histogram,
            k: dash.k,
            produced_at_split: key.split_pct,
            produced_at_k: key.k,
        }
    }

    /// Merge only the k-sensitive fields of a fresh response.
    pub fn merge_k_sensitive(&mut self, dash: &DashboardResponse, k: u32) {
        self.predicted_vs_actual = dash.predicted_vs_actual.clone();
        self.residual_histogram = dash.residual_histogram.clone();
        self.k = dash.k;
        self.produced_at_k = k;
    }

    pub fn provenance(&self) -> ParamKey {
        ParamKey::new(self.produced_at_k, self.produced_at_split)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionOutcome {
    pub result: PredictionResult,
    pub features: FeatureVector,
    pub bill_histogram: Option<Histogram>,
    pub key: ParamKey,
}

/// Which controller activity a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Train,
    FullLoad,
    SoftRefresh,
    ResidualLoad,
    Predict,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Train => "train",
            Intent::FullLoad => "full_load",
            Intent::SoftRefresh => "soft_refresh",
            Intent::ResidualLoad => "residual_load",
            Intent::Predict => "predict",
        }
    }

    fn subject(&self) -> &'static str {
        match self {
            Intent::Train => "Retraining the model",
            Intent::FullLoad => "Loading the dashboard",
            Intent::SoftRefresh => "Refreshing the dashboard",
            Intent::ResidualLoad => "Loading the residual chart",
            Intent::Predict => "Predicting the bill",
        }
    }
}

/// User-facing description of the most recent failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNotice {
    pub intent: Intent,
    pub kind: FailureKind,
    pub key: ParamKey,
    pub message: String,
    pub advice: String,
}

impl FailureNotice {
    pub fn new(intent: Intent, key: ParamKey, err: &FetchError) -> Self {
        let advice = match err {
            FetchError::Transport { status: Some(s), .. } if *s >= 500 => {
                "The regression service hit an internal error; check its console, then try again."
            }
            FetchError::Transport { status: Some(_), .. } => {
                "The regression service refused the request; check that client and service versions match."
            }
            FetchError::Transport { status: None, .. } => {
                "The regression service is unreachable; check that it is running and the base URL is right."
            }
            FetchError::Timeout(_) => {
                "The regression service is slow to answer; wait a moment and try again."
            }
            FetchError::Malformed(_) => {
                "The service answered with an unexpected payload; client and service versions may be mismatched."
            }
            FetchError::Validation(_) => {
                "Adjust the highlighted input; the request was not sent."
            }
        };
        Self {
            intent,
            kind: err.kind(),
            key,
            message: format!("{} at {} failed: {}", intent.subject(), key, err),
            advice: advice.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerState {
    pub params: ModelParams,
    /// Bumped on every setter call; identifies the debounce window.
    pub param_gen: u64,
    pub debounce_armed: bool,
    next_gen: u64,

    pub metrics: Option<Stamped<Metrics>>,
    pub train_slot: Option<Ticket>,

    pub phase: DerivedPhase,
    pub dashboard: Option<Arc<DashboardArtifact>>,
    pub full_slot: Option<Ticket>,
    pub soft_slot: Option<Ticket>,

    pub residual: Option<Stamped<Histogram>>,
    pub how_loaded: bool,
    pub residual_slot: Option<Ticket>,

    pub bill_histogram: Option<Stamped<Histogram>>,

    pub prediction: Option<Arc<PredictionOutcome>>,
    pub predict_slot: Option<Ticket>,

    pub focus: View,
    pub last_failure: Option<FailureNotice>,
    pub seq: u64,
}

impl ControllerState {
    pub fn new(params: ModelParams) -> Self {
        Self {
            params,
            param_gen: 0,
            debounce_armed: false,
            next_gen: 0,
            metrics: None,
            train_slot: None,
            phase: DerivedPhase::Empty,
            dashboard: None,
            full_slot: None,
            soft_slot: None,
            residual: None,
            how_loaded: false,
            residual_slot: None,
            bill_histogram: None,
            prediction: None,
            predict_slot: None,
            focus: View::Predict,
            last_failure: None,
            seq: 0,
        }
    }

    /// Allocate a ticket for the live parameters.
    pub fn issue(&mut self) -> Ticket {
        self.issue_for(self.params.key())
    }

    pub fn issue_for(&mut self, key: ParamKey) -> Ticket {
        self.next_gen += 1;
        Ticket { gen: self.next_gen, key }
    }

    /// Metrics are committed for the live parameters and nothing newer is
    /// pending.
    pub fn is_settled(&self) -> bool {
        !self.debounce_armed
            && self.train_slot.is_none()
            && self.metrics.as_ref().map(|m| m.key) == Some(self.params.key())
    }

    pub fn clear_failure(&mut self, intent: Intent) {
        if self.last_failure.as_ref().map(|f| f.intent) == Some(intent) {
            self.last_failure = None;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            k: self.params.k(),
            split_pct: self.params.split_pct(),
            split: self.params.split(),
            metrics: self.metrics.clone(),
            training: self.debounce_armed || self.train_slot.is_some(),
            phase: self.phase,
            dashboard: self.dashboard.clone(),
            residual: self.residual.clone(),
            how_loaded: self.how_loaded,
            bill_histogram: self.bill_histogram.clone(),
            prediction: self.prediction.clone(),
            predicting: self.predict_slot.is_some(),
            focus: self.focus,
            last_failure: self.last_failure.clone(),
            seq: self.seq,
        }
    }
}

/// Read-only view published to consumers after every transition.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub k: u32,
    pub split_pct: u32,
    pub split: f64,
    pub metrics: Option<Stamped<Metrics>>,
    /// A debounce window is open or a train request is in flight.
    pub training: bool,
    pub phase: DerivedPhase,
    pub dashboard: Option<Arc<DashboardArtifact>>,
    pub residual: Option<Stamped<Histogram>>,
    pub how_loaded: bool,
    pub bill_histogram: Option<Stamped<Histogram>>,
    pub prediction: Option<Arc<PredictionOutcome>>,
    pub predicting: bool,
    pub focus: View,
    pub last_failure: Option<FailureNotice>,
    pub seq: u64,
}

impl Snapshot {
    pub fn key(&self) -> ParamKey {
        ParamKey::new(self.k, self.split_pct)
    }

    pub fn refreshing(&self) -> bool {
        self.phase == DerivedPhase::Refreshing
    }

    pub fn dashboard_loaded(&self) -> bool {
        matches!(self.phase, DerivedPhase::Loaded | DerivedPhase::Refreshing)
    }

    pub fn produced_at(&self) -> Option<ParamKey> {
        self.dashboard.as_ref().map(|d| d.provenance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickets_are_monotonic() {
        let mut s = ControllerState::new(ModelParams::default());
        let a = s.issue();
        let b = s.issue();
        assert!(b.gen > a.gen);
        assert_eq!(a.key, ParamKey::new(9, 90));
    }

    #[test]
    fn test_failure_notice_is_actionable() {
        let n = FailureNotice::new(
            Intent::FullLoad,
            ParamKey::new(9, 90),
            &FetchError::Transport { status: None, message: "connection refused".into() },
        );
        assert_eq!(n.kind, FailureKind::Transport);
        assert!(n.message.contains("Loading the dashboard"));
        assert!(n.advice.contains("unreachable"));

        let t = FailureNotice::new(Intent::Train, ParamKey::new(9, 90), &FetchError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(t.kind, FailureKind::Timeout);
        assert_ne!(t.advice, n.advice);
    }

    #[test]
    fn test_clear_failure_only_for_matching_intent() {
        let mut s = ControllerState::new(ModelParams::default());
        s.last_failure = Some(FailureNotice::new(
            Intent::Predict,
            s.params.key(),
            &FetchError::Malformed("x".into()),
        ));
        s.clear_failure(Intent::Train);
        assert!(s.last_failure.is_some());
        s.clear_failure(Intent::Predict);
        assert!(s.last_failure.is_none());
    }
}
