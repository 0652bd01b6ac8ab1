use std::sync::Arc;

use anyhow::Result;
use electribill::api::types::housing_type_label;
use electribill::api::{Histogram, HouseholdForm, ServiceKind};
use electribill::config::ControllerConfig;
use electribill::controller::{Controller, ControllerHandle, DerivedPhase, PredictionOutcome, Snapshot, View};
use electribill::logging::{log, obj, v_str, v_u64, Domain, Level};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  k <n>                      set neighbours (odd, 1-25)
  split <pct>                set training split percent (70-95)
  view predict|dashboard|io|how
  predict [NAME=value ...]   predict a bill; overrides use feature names (KWH=9000)
  show                       render the focused view
  json                       dump the current snapshot
  help | quit";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = ControllerConfig::from_env();
    let kind = ServiceKind::from_config(&cfg);
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("service", v_str(&format!("{:?}", kind))),
            ("k", v_u64(cfg.initial.k as u64)),
            ("split_pct", v_u64(cfg.initial.split_pct as u64)),
        ]),
    );
    let service = kind.build(&cfg)?;
    let handle = Controller::spawn(service, cfg);

    tokio::spawn(announce(handle.clone()));

    println!("{}", HELP);
    let mut form = HouseholdForm::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };
        let rest: Vec<&str> = words.collect();
        let outcome = match (cmd, rest.as_slice()) {
            ("k", [n]) => handle.set_k_text(n).map_err(anyhow::Error::from),
            ("split", [p]) => handle.set_split_text(p).map_err(anyhow::Error::from),
            ("view", [v]) => match View::parse(v) {
                Some(view) => handle.focus(view).map_err(anyhow::Error::from),
                None => Err(anyhow::anyhow!("unknown view {:?}", v)),
            },
            ("predict", overrides) => apply_overrides(&mut form, overrides)
                .and_then(|_| handle.predict(form.to_features()).map_err(anyhow::Error::from)),
            ("show", []) => {
                println!("{}", render(&handle.snapshot()));
                Ok(())
            }
            ("json", []) => {
                println!("{}", serde_json::to_string_pretty(handle.snapshot().as_ref())?);
                Ok(())
            }
            ("help", _) => {
                println!("{}", HELP);
                Ok(())
            }
            ("quit", _) | ("exit", _) => break,
            _ => Err(anyhow::anyhow!("unrecognised input; type help")),
        };
        if let Err(err) = outcome {
            println!("! {}", err);
        }
    }

    log(Level::Info, Domain::System, "shutdown", obj(&[]));
    Ok(())
}

fn apply_overrides(form: &mut HouseholdForm, overrides: &[&str]) -> Result<()> {
    for pair in overrides {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected NAME=value, got {:?}", pair))?;
        let value: f64 = value.parse()?;
        if !form.set(name, value) {
            anyhow::bail!("unknown feature {:?}", name);
        }
    }
    Ok(())
}

/// Print the metric strip and failures as they change.
async fn announce(handle: ControllerHandle) {
    let mut rx = handle.subscribe();
    let mut last_metrics = None;
    let mut last_failure = None;
    let mut last_prediction: Option<Arc<PredictionOutcome>> = None;
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        let metrics_key = snap.metrics.as_ref().map(|m| m.key);
        if metrics_key != last_metrics {
            last_metrics = metrics_key;
            println!("{}", render_metrics(&snap));
        }
        if snap.last_failure != last_failure {
            if let Some(f) = &snap.last_failure {
                println!("! {}\n  {}", f.message, f.advice);
            }
            last_failure = snap.last_failure.clone();
        }
        let fresh = match (&snap.prediction, &last_prediction) {
            (Some(now), Some(before)) => !Arc::ptr_eq(now, before),
            (now, before) => now.is_some() != before.is_some(),
        };
        if fresh {
            last_prediction = snap.prediction.clone();
            println!("{}", render_prediction(&snap));
        }
    }
}

fn render(snap: &Snapshot) -> String {
    let body = match snap.focus {
        View::Predict => render_prediction(snap),
        View::Dashboard => render_dashboard(snap),
        View::DataIo => format!("features: {}", electribill::api::FEATURE_NAMES.join(", ")),
        View::Explainer => render_residuals(snap),
    };
    format!("{}\n{}", render_metrics(snap), body)
}

fn render_metrics(snap: &Snapshot) -> String {
    let head = format!("[k={} split={:.2}]", snap.k, snap.split);
    match &snap.metrics {
        Some(m) if m.key == snap.key() && !snap.training => format!(
            "{} MAE ${:.2}  RMSE ${:.2}  MAPE {:.1}%  acc {:.1}%  train {}  test {}",
            head, m.value.mae, m.value.rmse, m.value.mape, m.value.accuracy, m.value.train_count, m.value.test_count
        ),
        Some(m) => format!("{} training... (showing {})", head, m.key),
        None => format!("{} training...", head),
    }
}

fn render_dashboard(snap: &Snapshot) -> String {
    let art = match (&snap.dashboard, snap.phase) {
        (_, DerivedPhase::Reloading) => return "dashboard: loading...".to_string(),
        (Some(art), _) => art,
        (None, _) => return "dashboard: not loaded (view dashboard to load)".to_string(),
    };
    let mut out = Vec::new();
    let refreshing = if snap.refreshing() { "  (refreshing)" } else { "" };
    out.push(format!("dashboard @ k={} split={}%{}", art.produced_at_k, art.produced_at_split, refreshing));
    out.push(format!("  bills: {}", render_hist(&art.bill_histogram)));
    for (code, b) in &art.box_plot {
        let label = code.parse().map(housing_type_label).unwrap_or("?");
        out.push(format!(
            "  {:<28} min {:>7.0} q1 {:>7.0} med {:>7.0} q3 {:>7.0} max {:>7.0}",
            label, b.min, b.q1, b.median, b.q3, b.max
        ));
    }
    let mut corr: Vec<_> = art.correlation.features.iter().zip(&art.correlation.values).collect();
    corr.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    let top: Vec<String> = corr.iter().take(5).map(|(f, v)| format!("{}={:+.2}", f, v)).collect();
    out.push(format!("  strongest correlations: {}", top.join(" ")));
    let k_rows: Vec<String> = art
        .k_comparison
        .rows
        .iter()
        .map(|r| format!("{}:{:.1}", r.k, r.mae))
        .collect();
    out.push(format!("  MAE by k (best {}): {}", art.k_comparison.best_k, k_rows.join(" ")));
    out.push(format!(
        "  predicted vs actual: {} points, residuals {}",
        art.predicted_vs_actual.actual.len(),
        render_hist(&art.residual_histogram)
    ));
    out.join("\n")
}

fn render_residuals(snap: &Snapshot) -> String {
    match &snap.residual {
        Some(r) if snap.how_loaded => format!("residuals @ {}: {}", r.key, render_hist(&r.value)),
        Some(r) => format!("residuals @ {} (stale, reloading): {}", r.key, render_hist(&r.value)),
        None => "residuals: loading...".to_string(),
    }
}

fn render_prediction(snap: &Snapshot) -> String {
    let Some(p) = &snap.prediction else {
        return if snap.predicting {
            "prediction: running...".to_string()
        } else {
            "prediction: none yet (predict)".to_string()
        };
    };
    let r = &p.result;
    let mut out = format!(
        "predicted ${:.0}/yr (${:.0}/mo)  avg ${:.0}  median ${:.0}  {:.0}th percentile  {:+.1}% vs avg",
        r.predicted, r.monthly, r.dataset_avg, r.dataset_median, r.percentile_rank, r.delta_percent
    );
    if let Some(h) = &p.bill_histogram {
        out.push_str(&format!("\n  distribution: {}", render_hist(h)));
    }
    out
}

fn render_hist(h: &Histogram) -> String {
    let total: u64 = h.counts.iter().sum();
    let peak = h
        .counts
        .iter()
        .enumerate()
        .max_by_key(|(_, c)| **c)
        .and_then(|(i, _)| h.bins.get(i))
        .copied()
        .unwrap_or(0.0);
    json!({ "n": total, "bins": h.counts.len(), "mean": (h.mean * 100.0).round() / 100.0, "mode_bin": peak })
        .to_string()
}
