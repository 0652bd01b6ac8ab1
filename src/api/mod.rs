//! Remote fetch adapter: the four request/response exchanges with the
//! regression service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::ControllerConfig;
use crate::params::{ParamKey, K_MAX, K_MIN, SPLIT_PCT_MAX, SPLIT_PCT_MIN};

pub mod fault;
pub mod http;
pub mod stub;
pub mod types;

pub use types::{
    BoxStats, Correlation, DashboardResponse, FeatureVector, Histogram, HouseholdForm, KComparison,
    KRow, Metrics, PredictedVsActual, PredictionResult, ScatterSample, SummaryTable, FEATURE_NAMES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOp {
    Train,
    Dashboard,
    KComparison,
    Predict,
}

impl FetchOp {
    pub fn path(&self) -> &'static str {
        match self {
            FetchOp::Train => "api/train",
            FetchOp::Dashboard => "api/dashboard",
            FetchOp::KComparison => "api/k-comparison",
            FetchOp::Predict => "api/predict",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOp::Train => "train",
            FetchOp::Dashboard => "dashboard",
            FetchOp::KComparison => "k_comparison",
            FetchOp::Predict => "predict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Timeout,
    Malformed,
    Validation,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// Network failure or a non-success HTTP status.
    #[error("transport failure: {message}")]
    Transport { status: Option<u16>, message: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("unexpected response shape: {0}")]
    Malformed(String),
    #[error("request rejected before sending: {0}")]
    Validation(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Transport { .. } => FailureKind::Transport,
            FetchError::Timeout(_) => FailureKind::Timeout,
            FetchError::Malformed(_) => FailureKind::Malformed,
            FetchError::Validation(_) => FailureKind::Validation,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transport { status, .. } => *status,
            _ => None,
        }
    }
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn train(&self, key: ParamKey) -> Result<Metrics, FetchError>;
    async fn dashboard(&self, key: ParamKey) -> Result<DashboardResponse, FetchError>;
    async fn k_comparison(&self, split_pct: u32) -> Result<KComparison, FetchError>;
    async fn predict(&self, features: &FeatureVector, key: ParamKey) -> Result<PredictionResult, FetchError>;
}

/// Which service implementation the controller talks to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    Http(String),
    Stub,
}

impl ServiceKind {
    pub fn from_config(cfg: &ControllerConfig) -> Self {
        match cfg.api_base.as_str() {
            "stub" => ServiceKind::Stub,
            base => ServiceKind::Http(base.to_string()),
        }
    }

    pub fn build(self, cfg: &ControllerConfig) -> Result<Arc<dyn ModelService>> {
        match self {
            ServiceKind::Http(base) => Ok(Arc::new(http::HttpService::new(&base, cfg.request_timeout)?)),
            ServiceKind::Stub => Ok(Arc::new(
                stub::StubService::new().with_faults(fault::FaultProfile::from_env()),
            )),
        }
    }
}

pub fn validate_key(key: ParamKey) -> Result<(), FetchError> {
    if key.k % 2 == 0 || !(K_MIN..=K_MAX).contains(&key.k) {
        return Err(FetchError::Validation(format!(
            "k must be odd and within {}..={}, got {}",
            K_MIN, K_MAX, key.k
        )));
    }
    validate_split(key.split_pct)
}

pub fn validate_split(split_pct: u32) -> Result<(), FetchError> {
    if !(SPLIT_PCT_MIN..=SPLIT_PCT_MAX).contains(&split_pct) {
        return Err(FetchError::Validation(format!(
            "split must be within {}%..={}%, got {}%",
            SPLIT_PCT_MIN, SPLIT_PCT_MAX, split_pct
        )));
    }
    Ok(())
}

pub fn validate_features(features: &FeatureVector) -> Result<(), FetchError> {
    if features.values().len() != FEATURE_NAMES.len() {
        return Err(FetchError::Validation(format!(
            "expected {} feature values, got {}",
            FEATURE_NAMES.len(),
            features.values().len()
        )));
    }
    if let Some(idx) = features.values().iter().position(|v| !v.is_finite()) {
        return Err(FetchError::Validation(format!(
            "feature {} is not a finite number",
            FEATURE_NAMES[idx]
        )));
    }
    Ok(())
}

/// Bound a fetch by `limit`; expiry becomes [`FetchError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_rejects_even_and_out_of_range() {
        assert!(validate_key(ParamKey::new(9, 90)).is_ok());
        assert_eq!(validate_key(ParamKey::new(10, 90)).unwrap_err().kind(), FailureKind::Validation);
        assert!(validate_key(ParamKey::new(27, 90)).is_err());
        assert!(validate_key(ParamKey::new(9, 60)).is_err());
    }

    #[test]
    fn test_validate_features_length() {
        let short = FeatureVector(vec![1.0; 22]);
        assert!(matches!(validate_features(&short), Err(FetchError::Validation(_))));
        let ok = HouseholdForm::default().to_features();
        assert!(validate_features(&ok).is_ok());
        let mut bad = ok.clone();
        bad.0[3] = f64::NAN;
        assert!(validate_features(&bad).is_err());
    }

    #[test]
    fn test_service_kind_from_config() {
        let mut cfg = ControllerConfig::default();
        cfg.api_base = "stub".to_string();
        assert_eq!(ServiceKind::from_config(&cfg), ServiceKind::Stub);
        cfg.api_base = "http://localhost:8000".to_string();
        assert!(matches!(ServiceKind::from_config(&cfg), ServiceKind::Http(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let limit = Duration::from_millis(50);
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<u32, FetchError>(1)
        };
        assert_eq!(bounded(limit, slow).await, Err(FetchError::Timeout(limit)));
        assert_eq!(bounded(limit, async { Ok::<u32, FetchError>(2) }).await, Ok(2));
    }
}
