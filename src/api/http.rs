use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::{
    validate_features, validate_key, validate_split, DashboardResponse, FeatureVector, FetchError,
    FetchOp, KComparison, Metrics, ModelService, PredictionResult,
};
use crate::params::ParamKey;

/// Longest slice of an error body carried into a failure message.
const ERROR_BODY_SNIPPET: usize = 200;

#[derive(Serialize)]
struct ParamsBody {
    k: u32,
    split: f64,
}

#[derive(Serialize)]
struct SplitBody {
    split: f64,
}

#[derive(Serialize)]
struct PredictBody<'a> {
    features: &'a [f64],
    k: u32,
    split: f64,
}

pub struct HttpService {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl HttpService {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("invalid service base url {:?}", base))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client, base, timeout })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, op: FetchOp) -> Result<Url, FetchError> {
        self.base
            .join(op.path())
            .map_err(|e| FetchError::Validation(format!("cannot build {} url: {}", op.as_str(), e)))
    }

    async fn post<B, R>(&self, op: FetchOp, body: &B) -> Result<R, FetchError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(op)?;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(&e))?;

        if !status.is_success() {
            return Err(FetchError::Transport {
                status: Some(status.as_u16()),
                message: format!("{} returned {}: {}", op.as_str(), status, snippet(&text)),
            });
        }
        decode(&text)
    }

    fn transport_error(&self, err: &reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout(self.timeout);
        }
        FetchError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: format!("{} unreachable: {}", self.base, err),
        }
    }
}

pub(crate) fn decode<R: DeserializeOwned>(body: &str) -> Result<R, FetchError> {
    serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_SNIPPET) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl ModelService for HttpService {
    async fn train(&self, key: ParamKey) -> Result<Metrics, FetchError> {
        validate_key(key)?;
        self.post(FetchOp::Train, &ParamsBody { k: key.k, split: key.split() }).await
    }

    async fn dashboard(&self, key: ParamKey) -> Result<DashboardResponse, FetchError> {
        validate_key(key)?;
        self.post(FetchOp::Dashboard, &ParamsBody { k: key.k, split: key.split() }).await
    }

    async fn k_comparison(&self, split_pct: u32) -> Result<KComparison, FetchError> {
        validate_split(split_pct)?;
        self.post(FetchOp::KComparison, &SplitBody { split: split_pct as f64 / 100.0 }).await
    }

    async fn predict(&self, features: &FeatureVector, key: ParamKey) -> Result<PredictionResult, FetchError> {
        validate_key(key)?;
        validate_features(features)?;
        let body = PredictBody {
            features: features.values(),
            k: key.k,
            split: key.split(),
        };
        self.post(FetchOp::Predict, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DASHBOARD_FIXTURE: &str = r#"{
        "bill_hist": {"bins": [12.5, 110.0], "counts": [4, 9], "mean": 1162.3},
        "box_data": {"1": {"min": 10.0, "q1": 700.0, "median": 1000.0, "q3": 1400.0, "max": 5000.0}},
        "scatter": {"x": [11000.0], "y": [1200.0], "type": [2]},
        "correlation": {"features": ["KWH", "DOLELOTH"], "values": [0.912, 0.701]},
        "summary": {"DOLLAREL": {"count": 12083.0, "mean": 1162.3, "25%": 700.0}},
        "pred_vs_act": {"actual": [1000.0, 1500.0], "predicted": [1100.0, 1400.0]},
        "residual_hist": {"bins": [-300.0, 0.0], "counts": [1, 1], "mean": 0.0},
        "k": 11
    }"#;

    #[test]
    fn test_decode_dashboard_fixture() {
        let d: DashboardResponse = decode(DASHBOARD_FIXTURE).unwrap();
        assert_eq!(d.k, 11);
        assert_eq!(d.bill_histogram.counts, vec![4, 9]);
        assert_eq!(d.box_plot["1"].median, 1000.0);
        assert_eq!(d.scatter.housing_type, vec![2]);
        assert_eq!(d.summary["DOLLAREL"]["25%"], 700.0);
        assert_eq!(d.predicted_vs_actual.predicted.len(), 2);
    }

    #[test]
    fn test_decode_k_comparison_and_prediction() {
        let kc: KComparison =
            decode(r#"{"rows":[{"k":1,"mae":300.0,"rmse":420.0},{"k":3,"mae":260.0,"rmse":380.0}],"best_k":3}"#)
                .unwrap();
        assert_eq!(kc.best_k, 3);
        assert_eq!(kc.rows[1].k, 3);

        let p: PredictionResult = decode(
            r#"{"predicted":1320.5,"monthly":110.04,"avg":1162.3,"median":1050.0,"pct_rank":64.2,"delta_pct":13.6}"#,
        )
        .unwrap();
        assert_eq!(p.percentile_rank, 64.2);
        assert_eq!(p.dataset_avg, 1162.3);
    }

    #[test]
    fn test_decode_wrong_shape_is_malformed() {
        let err = decode::<Metrics>(r#"{"error":"boom"}"#).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
        let err = decode::<Metrics>("<html>502</html>").unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[test]
    fn test_endpoints_join_under_base_path() {
        let svc = HttpService::new("http://127.0.0.1:8000/electribill", Duration::from_secs(1)).unwrap();
        assert_eq!(
            svc.endpoint(FetchOp::KComparison).unwrap().as_str(),
            "http://127.0.0.1:8000/electribill/api/k-comparison"
        );
        let svc = HttpService::new("http://127.0.0.1:8000", Duration::from_secs(1)).unwrap();
        assert_eq!(svc.endpoint(FetchOp::Train).unwrap().as_str(), "http://127.0.0.1:8000/api/train");
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(HttpService::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_request() {
        // Port 9 (discard) is never contacted: validation fails first.
        let svc = HttpService::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = svc.predict(&FeatureVector(vec![0.0; 5]), ParamKey::new(9, 90)).await.unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
        let err = svc.train(ParamKey::new(8, 90)).await.unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let long = "é".repeat(500);
        assert_eq!(snippet(&long).chars().count(), ERROR_BODY_SNIPPET);
        assert_eq!(snippet("short"), "short");
    }
}
