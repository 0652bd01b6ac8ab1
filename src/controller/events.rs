//! Inputs to the policy reducer and the effects it asks the runtime to
//! perform.

use serde_json::{Map, Value};

use super::state::{Ticket, View};
use crate::api::{DashboardResponse, FeatureVector, FetchError, Histogram, KComparison, Metrics, PredictionResult};
use crate::logging::{Domain, Level};

#[derive(Debug, Clone)]
pub struct PredictionReply {
    pub result: PredictionResult,
    pub features: FeatureVector,
    /// Present when the bill histogram had to be fetched alongside.
    pub bill_histogram: Option<Histogram>,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Commit the initial parameters so metrics load without user input.
    Mount,

    // From consumers
    SetK(i64),
    SetSplitPercent(i64),
    Focus(View),
    LoadDashboard,
    LoadResiduals,
    Predict(FeatureVector),

    // From the runtime
    DebounceElapsed { gen: u64 },
    TrainDone { ticket: Ticket, result: Result<Metrics, FetchError> },
    FullLoadDone { ticket: Ticket, result: Result<(DashboardResponse, KComparison), FetchError> },
    SoftRefreshDone { ticket: Ticket, result: Result<DashboardResponse, FetchError> },
    ResidualDone { ticket: Ticket, result: Result<DashboardResponse, FetchError> },
    PredictDone { ticket: Ticket, result: Result<PredictionReply, FetchError> },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Mount => "mount",
            Event::SetK(_) => "set_k",
            Event::SetSplitPercent(_) => "set_split_pct",
            Event::Focus(_) => "focus",
            Event::LoadDashboard => "load_dashboard",
            Event::LoadResiduals => "load_residuals",
            Event::Predict(_) => "predict",
            Event::DebounceElapsed { .. } => "debounce_elapsed",
            Event::TrainDone { .. } => "train_done",
            Event::FullLoadDone { .. } => "full_load_done",
            Event::SoftRefreshDone { .. } => "soft_refresh_done",
            Event::ResidualDone { .. } => "residual_done",
            Event::PredictDone { .. } => "predict_done",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    /// Cancel any pending debounce timer and start a new one.
    ArmDebounce { gen: u64 },
    Train(Ticket),
    /// `dashboard` and `k_comparison`, concurrently.
    FullLoad(Ticket),
    SoftRefresh(Ticket),
    LoadResiduals(Ticket),
    Predict { ticket: Ticket, features: FeatureVector, with_bill_histogram: bool },
    Log { level: Level, domain: Domain, event: &'static str, fields: Map<String, Value> },
}
