//! In-process regression service.
//!
//! Produces deterministic synthetic payloads shaped like the real service:
//! split-only dashboard fields are identical on every call, k-sensitive
//! fields are a pure function of (k, split). Latency and failures can be
//! scripted per operation, and every call is recorded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::fault::FaultProfile;
use super::{
    validate_features, validate_key, validate_split, BoxStats, Correlation, DashboardResponse,
    FeatureVector, FetchError, FetchOp, Histogram, KComparison, KRow, Metrics, ModelService,
    PredictedVsActual, PredictionResult, ScatterSample, SummaryTable,
};
use crate::params::{ParamKey, K_MAX, K_MIN};

const DATASET_ROWS: u64 = 12_083;
const POPULATION: usize = 2_000;
const SCATTER_SAMPLE: usize = 1_500;
const PRED_VS_ACT_SAMPLE: usize = 400;
const HIST_BINS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Train(ParamKey),
    Dashboard(ParamKey),
    KComparison(u32),
    Predict(ParamKey),
}

impl Call {
    pub fn op(&self) -> FetchOp {
        match self {
            Call::Train(_) => FetchOp::Train,
            Call::Dashboard(_) => FetchOp::Dashboard,
            Call::KComparison(_) => FetchOp::KComparison,
            Call::Predict(_) => FetchOp::Predict,
        }
    }
}

#[derive(Default)]
struct Script {
    delays: HashMap<FetchOp, VecDeque<Duration>>,
    failures: HashMap<FetchOp, VecDeque<FetchError>>,
}

pub struct StubService {
    latency: Duration,
    faults: FaultProfile,
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    seq: AtomicU64,
}

impl Default for StubService {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StubService {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            faults: FaultProfile::disabled(),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Latency applied to every call without a scripted delay.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_faults(mut self, faults: FaultProfile) -> Self {
        self.faults = faults;
        self
    }

    /// Queue a delay for the next unscripted call of `op`.
    pub fn script_delay(&self, op: FetchOp, delay: Duration) {
        locked(&self.script).delays.entry(op).or_default().push_back(delay);
    }

    /// Queue a failure for the next call of `op`.
    pub fn script_failure(&self, op: FetchOp, err: FetchError) {
        locked(&self.script).failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        locked(&self.calls).clone()
    }

    pub fn count(&self, op: FetchOp) -> usize {
        locked(&self.calls).iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        locked(&self.calls).clear();
    }

    async fn respond<T>(&self, call: Call, make: impl FnOnce() -> T) -> Result<T, FetchError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        locked(&self.calls).push(call);
        let op = call.op();
        let (delay, scripted) = {
            let mut script = locked(&self.script);
            let delay = script.delays.get_mut(&op).and_then(|q| q.pop_front());
            let failure = script.failures.get_mut(&op).and_then(|q| q.pop_front());
            (delay.unwrap_or(self.latency), failure)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = scripted.or_else(|| self.faults.pick(seq)) {
            return Err(err);
        }
        Ok(make())
    }
}

#[async_trait]
impl ModelService for StubService {
    async fn train(&self, key: ParamKey) -> Result<Metrics, FetchError> {
        validate_key(key)?;
        self.respond(Call::Train(key), || synth_metrics(key)).await
    }

    async fn dashboard(&self, key: ParamKey) -> Result<DashboardResponse, FetchError> {
        validate_key(key)?;
        self.respond(Call::Dashboard(key), || synth_dashboard(key)).await
    }

    async fn k_comparison(&self, split_pct: u32) -> Result<KComparison, FetchError> {
        validate_split(split_pct)?;
        self.respond(Call::KComparison(split_pct), || synth_k_comparison(split_pct)).await
    }

    async fn predict(&self, features: &FeatureVector, key: ParamKey) -> Result<PredictionResult, FetchError> {
        validate_key(key)?;
        validate_features(features)?;
        self.respond(Call::Predict(key), || synth_prediction(features, key)).await
    }
}

// =============================================================================
// Synthetic payloads
// =============================================================================

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

/// Error curve over k: U-shaped with its minimum at k=9, worse with less
/// training data.
fn error_profile(k: u32, split_pct: u32) -> (f64, f64) {
    let k = k as f64;
    let mae = 228.0 + (k - 9.0).abs() * 3.1 + 60.0 / k + (95u32.saturating_sub(split_pct)) as f64 * 0.8;
    (round_to(mae, 2), round_to(mae * 1.47, 2))
}

fn split_counts(split_pct: u32) -> (u64, u64) {
    let train = (DATASET_ROWS as f64 * split_pct as f64 / 100.0).round() as u64;
    (train, DATASET_ROWS - train)
}

fn synth_metrics(key: ParamKey) -> Metrics {
    let (mae, rmse) = error_profile(key.k, key.split_pct);
    let (train, test) = split_counts(key.split_pct);
    let mape = round_to(mae / 13.2, 2);
    Metrics {
        train_count: train,
        test_count: test,
        mae,
        rmse,
        mape,
        accuracy: round_to((100.0 - mape).max(0.0), 1),
        k: key.k,
        split: key.split(),
    }
}

fn synth_k_comparison(split_pct: u32) -> KComparison {
    let rows: Vec<KRow> = (K_MIN..=K_MAX)
        .step_by(2)
        .map(|k| {
            let (mae, rmse) = error_profile(k, split_pct);
            KRow { k, mae, rmse }
        })
        .collect();
    let best_k = rows
        .iter()
        .min_by(|a, b| a.mae.total_cmp(&b.mae))
        .map(|r| r.k)
        .unwrap_or(K_MIN);
    KComparison { rows, best_k }
}

/// One synthetic household: (housing type, kWh, sqft, bill).
#[derive(Clone, Copy)]
struct Household {
    housing_type: u8,
    kwh: f64,
    sqft: f64,
    bill: f64,
}

struct StaticPart {
    population: Vec<Household>,
    bill_histogram: Histogram,
    box_plot: BTreeMap<String, BoxStats>,
    scatter: ScatterSample,
    correlation: Correlation,
    summary: SummaryTable,
    bill_mean: f64,
    bill_median: f64,
}

fn static_part() -> &'static StaticPart {
    static PART: OnceLock<StaticPart> = OnceLock::new();
    PART.get_or_init(build_static_part)
}

fn build_static_part() -> StaticPart {
    let mut rng = StdRng::seed_from_u64(1);
    let population: Vec<Household> = (0..POPULATION)
        .map(|_| {
            let housing_type = rng.gen_range(1..=5u8);
            let sqft = rng.gen_range(500.0..4_500.0);
            let kwh = sqft * rng.gen_range(3.0..9.0);
            let noise = (rng.gen::<f64>() - 0.5) * 240.0;
            let bill = (kwh * 0.105 + 40.0 * housing_type as f64 + noise).max(20.0);
            Household { housing_type, kwh, sqft, bill }
        })
        .collect();

    let bills: Vec<f64> = population.iter().map(|h| h.bill).collect();
    let bill_histogram = histogram(&bills, HIST_BINS);

    let mut box_plot = BTreeMap::new();
    for t in 1..=5u8 {
        let vals: Vec<f64> = population.iter().filter(|h| h.housing_type == t).map(|h| h.bill).collect();
        if !vals.is_empty() {
            box_plot.insert(t.to_string(), box_stats(&vals));
        }
    }

    let sample = &population[..SCATTER_SAMPLE.min(population.len())];
    let scatter = ScatterSample {
        x: sample.iter().map(|h| round_to(h.kwh, 1)).collect(),
        y: sample.iter().map(|h| round_to(h.bill, 1)).collect(),
        housing_type: sample.iter().map(|h| h.housing_type).collect(),
    };

    let kwh: Vec<f64> = population.iter().map(|h| h.kwh).collect();
    let sqft: Vec<f64> = population.iter().map(|h| h.sqft).collect();
    let kinds: Vec<f64> = population.iter().map(|h| h.housing_type as f64).collect();
    let mut corr = vec![
        ("KWH".to_string(), pearson(&kwh, &bills)),
        ("TOTSQFT".to_string(), pearson(&sqft, &bills)),
        ("TYPEHUQ".to_string(), pearson(&kinds, &bills)),
    ];
    corr.sort_by(|a, b| b.1.total_cmp(&a.1));
    let correlation = Correlation {
        features: corr.iter().map(|(n, _)| n.clone()).collect(),
        values: corr.iter().map(|(_, v)| round_to(*v, 3)).collect(),
    };

    let mut summary = SummaryTable::new();
    summary.insert("DOLLAREL".to_string(), describe(&bills));
    summary.insert("KWH".to_string(), describe(&kwh));
    summary.insert("TOTSQFT".to_string(), describe(&sqft));

    let bill_mean = mean(&bills);
    let bill_median = percentile(&bills, 50.0);
    StaticPart {
        population,
        bill_histogram,
        box_plot,
        scatter,
        correlation,
        summary,
        bill_mean,
        bill_median,
    }
}

fn synth_dashboard(key: ParamKey) -> DashboardResponse {
    let part = static_part();
    let (mae, _) = error_profile(key.k, key.split_pct);
    let mut rng = StdRng::seed_from_u64(key.k as u64 * 1_000 + key.split_pct as u64);
    let (_, test) = split_counts(key.split_pct);
    let n = PRED_VS_ACT_SAMPLE.min(test as usize).min(part.population.len());

    let actual: Vec<f64> = part.population[..n].iter().map(|h| round_to(h.bill, 1)).collect();
    let predicted: Vec<f64> = actual
        .iter()
        .map(|a| round_to(a + (rng.gen::<f64>() - 0.5) * 2.0 * mae, 1))
        .collect();
    let residuals: Vec<f64> = predicted.iter().zip(&actual).map(|(p, a)| round_to(p - a, 1)).collect();

    DashboardResponse {
        bill_histogram: part.bill_histogram.clone(),
        box_plot: part.box_plot.clone(),
        scatter: part.scatter.clone(),
        predicted_vs_actual: PredictedVsActual { actual, predicted },
        correlation: part.correlation.clone(),
        summary: part.summary.clone(),
        residual_histogram: histogram(&residuals, HIST_BINS),
        k: key.k,
    }
}

fn synth_prediction(features: &FeatureVector, key: ParamKey) -> PredictionResult {
    let part = static_part();
    let kwh = features.get("KWH").unwrap_or(0.0);
    let sqft = features.get("TOTSQFT").unwrap_or(0.0);
    let kind = features.get("TYPEHUQ").unwrap_or(2.0);
    let predicted = (kwh * 0.105 + sqft * 0.01 + 40.0 * kind + (key.k as f64 - 9.0) * 0.8).max(0.0);
    let below = part.population.iter().filter(|h| h.bill < predicted).count();
    let pct_rank = below as f64 / part.population.len() as f64 * 100.0;
    let avg = part.bill_mean;
    PredictionResult {
        predicted: round_to(predicted, 2),
        monthly: round_to(predicted / 12.0, 2),
        dataset_avg: round_to(avg, 2),
        dataset_median: round_to(part.bill_median, 2),
        percentile_rank: round_to(pct_rank, 1),
        delta_percent: if avg != 0.0 { round_to((predicted - avg) / avg * 100.0, 1) } else { 0.0 },
    }
}

// =============================================================================
// Small statistics helpers
// =============================================================================

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Equal-width histogram over [min, max]; the last bin is closed.
fn histogram(values: &[f64], bins: usize) -> Histogram {
    if values.is_empty() || bins == 0 {
        return Histogram { bins: Vec::new(), counts: Vec::new(), mean: 0.0 };
    }
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
    let mut counts = vec![0u64; bins];
    for v in values {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    Histogram {
        bins: (0..bins).map(|i| round_to(lo + width * i as f64, 1)).collect(),
        counts,
        mean: round_to(mean(values), 1),
    }
}

/// Linear-interpolated percentile, `p` in [0, 100].
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

fn box_stats(values: &[f64]) -> BoxStats {
    BoxStats {
        min: round_to(percentile(values, 0.0), 1),
        q1: round_to(percentile(values, 25.0), 1),
        median: round_to(percentile(values, 50.0), 1),
        q3: round_to(percentile(values, 75.0), 1),
        max: round_to(percentile(values, 100.0), 1),
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn describe(values: &[f64]) -> BTreeMap<String, f64> {
    let mut row = BTreeMap::new();
    row.insert("count".to_string(), values.len() as f64);
    row.insert("mean".to_string(), round_to(mean(values), 1));
    row.insert("std".to_string(), round_to(std_dev(values), 1));
    row.insert("min".to_string(), round_to(percentile(values, 0.0), 1));
    row.insert("25%".to_string(), round_to(percentile(values, 25.0), 1));
    row.insert("50%".to_string(), round_to(percentile(values, 50.0), 1));
    row.insert("75%".to_string(), round_to(percentile(values, 75.0), 1));
    row.insert("max".to_string(), round_to(percentile(values, 100.0), 1));
    row
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let (mx, my) = (mean(xs), mean(ys));
    let mut num = 0.0;
    let (mut dx, mut dy) = (0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        num += (x - mx) * (y - my);
        dx += (x - mx).powi(2);
        dy += (y - my).powi(2);
    }
    if dx == 0.0 || dy == 0.0 {
        return 0.0;
    }
    num / (dx.sqrt() * dy.sqrt())
}
