//! Pure reducer: (State, Event) -> Vec<Command>
//!
//! Every invalidation and refresh decision is made here; the runtime only
//! executes the commands and feeds completions back in. Completions carry
//! the ticket they were issued with, and a completion whose ticket is no
//! longer the current intent of its slot is dropped without touching state.
//!
//! | Change            | Dashboard                     | Residuals                 |
//! |-------------------|-------------------------------|---------------------------|
//! | split             | full invalidation → `Empty`   | dropped                   |
//! | k only (loaded)   | soft refresh, stays visible   | marked stale after merge  |
//! | none (first load) | full load on access           | lazy load on access       |

use std::sync::Arc;

use serde_json::Value;

use super::events::{Command, Event, PredictionReply};
use super::state::{
    ControllerState, DashboardArtifact, DerivedPhase, FailureNotice, Intent, PredictionOutcome,
    Stamped, Ticket, View,
};
use crate::api::{DashboardResponse, FeatureVector, FetchError, KComparison, Metrics};
use crate::logging::{obj, v_str, v_u64, Domain, Level};
use crate::params::ParamKey;

/// Result of processing an event
#[derive(Debug)]
pub struct ReducerOutput {
    pub commands: Vec<Command>,
    pub seq: u64,
}

pub fn reduce(state: &mut ControllerState, event: Event) -> ReducerOutput {
    let mut commands = Vec::new();
    state.seq += 1;

    match event {
        Event::Mount => on_param_commit(state, false, &mut commands),
        Event::SetK(raw) => {
            let changed = state.params.set_k(raw);
            on_param_commit(state, changed, &mut commands);
        }
        Event::SetSplitPercent(raw) => {
            let changed = state.params.set_split_pct(raw);
            on_param_commit(state, changed, &mut commands);
        }
        Event::Focus(view) => {
            state.focus = view;
            match view {
                View::Dashboard => start_full_load(state, &mut commands),
                View::Explainer => start_residual_load(state, &mut commands),
                View::Predict | View::DataIo => {}
            }
        }
        Event::LoadDashboard => start_full_load(state, &mut commands),
        Event::LoadResiduals => start_residual_load(state, &mut commands),
        Event::Predict(features) => start_predict(state, features, &mut commands),
        Event::DebounceElapsed { gen } => handle_debounce(state, gen, &mut commands),
        Event::TrainDone { ticket, result } => handle_train_done(state, ticket, result, &mut commands),
        Event::FullLoadDone { ticket, result } => handle_full_load_done(state, ticket, result, &mut commands),
        Event::SoftRefreshDone { ticket, result } => {
            handle_soft_refresh_done(state, ticket, result, &mut commands)
        }
        Event::ResidualDone { ticket, result } => handle_residual_done(state, ticket, result, &mut commands),
        Event::PredictDone { ticket, result } => handle_predict_done(state, ticket, result, &mut commands),
    }

    ReducerOutput {
        commands,
        seq: state.seq,
    }
}

fn note(
    commands: &mut Vec<Command>,
    level: Level,
    domain: Domain,
    event: &'static str,
    ticket: Option<&Ticket>,
    extra: &[(&str, Value)],
) {
    let mut fields = obj(extra);
    if let Some(t) = ticket {
        fields.insert("gen".to_string(), v_u64(t.gen));
        fields.insert("k".to_string(), v_u64(t.key.k as u64));
        fields.insert("split_pct".to_string(), v_u64(t.key.split_pct as u64));
    }
    commands.push(Command::Log {
        level,
        domain,
        event,
        fields,
    });
}

fn domain_for(intent: Intent) -> Domain {
    match intent {
        Intent::Train => Domain::Metrics,
        Intent::FullLoad | Intent::SoftRefresh => Domain::Dashboard,
        Intent::ResidualLoad => Domain::Residual,
        Intent::Predict => Domain::Predict,
    }
}

fn fail(state: &mut ControllerState, intent: Intent, key: ParamKey, err: &FetchError, commands: &mut Vec<Command>) {
    let notice = FailureNotice::new(intent, key, err);
    note(
        commands,
        Level::Warn,
        domain_for(intent),
        "fetch_failed",
        None,
        &[
            ("op", v_str(intent.as_str())),
            ("kind", serde_json::to_value(notice.kind).unwrap_or(Value::Null)),
            ("msg", v_str(&notice.message)),
        ],
    );
    state.last_failure = Some(notice);
}

fn discard(commands: &mut Vec<Command>, intent: Intent, ticket: &Ticket) {
    note(
        commands,
        Level::Debug,
        domain_for(intent),
        "completion_discarded",
        Some(ticket),
        &[("op", v_str(intent.as_str()))],
    );
}

// =============================================================================
// Parameters and debounce
// =============================================================================

fn on_param_commit(state: &mut ControllerState, changed: bool, commands: &mut Vec<Command>) {
    state.param_gen += 1;
    state.debounce_armed = true;
    commands.push(Command::ArmDebounce { gen: state.param_gen });

    // A soft refresh for the old parameters is no longer the current intent.
    if changed {
        if let Some(old) = state.soft_slot.take() {
            if state.phase == DerivedPhase::Refreshing {
                state.phase = DerivedPhase::Loaded;
            }
            note(commands, Level::Debug, Domain::Dashboard, "soft_refresh_superseded", Some(&old), &[]);
        }
    }

    let key = state.params.key();
    note(
        commands,
        Level::Debug,
        Domain::Params,
        "param_commit",
        None,
        &[
            ("k", v_u64(key.k as u64)),
            ("split_pct", v_u64(key.split_pct as u64)),
            ("changed", Value::Bool(changed)),
            ("param_gen", v_u64(state.param_gen)),
        ],
    );
}

fn handle_debounce(state: &mut ControllerState, gen: u64, commands: &mut Vec<Command>) {
    if gen != state.param_gen {
        note(
            commands,
            Level::Trace,
            Domain::Params,
            "debounce_stale",
            None,
            &[("param_gen", v_u64(gen))],
        );
        return;
    }
    state.debounce_armed = false;
    let ticket = state.issue();
    if let Some(old) = state.train_slot.replace(ticket) {
        note(commands, Level::Debug, Domain::Metrics, "train_superseded", Some(&old), &[]);
    }
    note(commands, Level::Info, Domain::Metrics, "train_issued", Some(&ticket), &[]);
    commands.push(Command::Train(ticket));
}

fn handle_train_done(
    state: &mut ControllerState,
    ticket: Ticket,
    result: Result<Metrics, FetchError>,
    commands: &mut Vec<Command>,
) {
    if state.train_slot != Some(ticket) {
        discard(commands, Intent::Train, &ticket);
        return;
    }
    state.train_slot = None;

    match result {
        Err(err) => fail(state, Intent::Train, ticket.key, &err, commands),
        Ok(metrics) => {
            state.metrics = Some(Stamped::new(metrics, ticket.key));
            state.clear_failure(Intent::Train);
            note(commands, Level::Info, Domain::Metrics, "metrics_committed", Some(&ticket), &[]);
            if state.is_settled() {
                settle(state, ticket.key, commands);
            } else {
                // A newer debounce window is open; its settle decides.
                note(commands, Level::Debug, Domain::Dashboard, "settle_deferred", Some(&ticket), &[]);
            }
        }
    }
}

// =============================================================================
// Settle: decide invalidation scope once metrics match the live parameters
// =============================================================================

fn settle(state: &mut ControllerState, key: ParamKey, commands: &mut Vec<Command>) {
    match state.phase {
        DerivedPhase::Empty => {}
        DerivedPhase::Reloading => {
            let stale_split = state.full_slot.map(|t| !t.key.same_split(&key)).unwrap_or(false);
            if stale_split {
                invalidate(state, "split_changed", commands);
                reload_if_focused(state, commands);
            }
        }
        DerivedPhase::Loaded | DerivedPhase::Refreshing => match state.dashboard.as_ref().map(|d| d.provenance()) {
            None => invalidate(state, "missing_artifact", commands),
            Some(produced) if !produced.same_split(&key) => {
                invalidate(state, "split_changed", commands);
                reload_if_focused(state, commands);
            }
            Some(produced) if produced.k != key.k => {
                let in_flight = state.soft_slot.map(|t| t.key == key).unwrap_or(false);
                if !in_flight {
                    start_soft_refresh(state, key, commands);
                }
            }
            Some(_) => {}
        },
    }

    retire_residuals(state, key, commands);
    if state.focus == View::Explainer {
        start_residual_load(state, commands);
    }
}

fn invalidate(state: &mut ControllerState, reason: &str, commands: &mut Vec<Command>) {
    state.dashboard = None;
    state.phase = DerivedPhase::Empty;
    if let Some(t) = state.full_slot.take() {
        discard(commands, Intent::FullLoad, &t);
    }
    state.soft_slot = None;
    state.residual = None;
    state.how_loaded = false;
    state.residual_slot = None;
    note(
        commands,
        Level::Info,
        Domain::Dashboard,
        "full_invalidation",
        None,
        &[("reason", v_str(reason))],
    );
}

fn reload_if_focused(state: &mut ControllerState, commands: &mut Vec<Command>) {
    if state.focus == View::Dashboard {
        start_full_load(state, commands);
    }
}

// =============================================================================
// Dashboard: full load and soft refresh
// =============================================================================

fn start_full_load(state: &mut ControllerState, commands: &mut Vec<Command>) {
    if state.phase != DerivedPhase::Empty {
        note(
            commands,
            Level::Trace,
            Domain::Dashboard,
            "full_load_skipped",
            None,
            &[("phase", serde_json::to_value(state.phase).unwrap_or(Value::Null))],
        );
        return;
    }
    let ticket = state.issue();
    state.full_slot = Some(ticket);
    state.phase = DerivedPhase::Reloading;
    state.dashboard = None;
    note(commands, Level::Info, Domain::Dashboard, "full_load_issued", Some(&ticket), &[]);
    commands.push(Command::FullLoad(ticket));
}

fn handle_full_load_done(
    state: &mut ControllerState,
    ticket: Ticket,
    result: Result<(DashboardResponse, KComparison), FetchError>,
    commands: &mut Vec<Command>,
) {
    if state.full_slot != Some(ticket) {
        discard(commands, Intent::FullLoad, &ticket);
        return;
    }
    state.full_slot = None;

    match result {
        Err(err) => {
            state.phase = DerivedPhase::Empty;
            fail(state, Intent::FullLoad, ticket.key, &err, commands);
        }
        Ok((dash, k_comparison)) => {
            remember_bill_histogram(state, &dash, ticket.key);
            state.dashboard = Some(Arc::new(DashboardArtifact::from_full_load(dash, k_comparison, ticket.key)));
            state.phase = DerivedPhase::Loaded;
            state.clear_failure(Intent::FullLoad);
            note(commands, Level::Info, Domain::Dashboard, "full_load_committed", Some(&ticket), &[]);

            // Parameters may have settled while the load was in flight; no
            // later settle would catch the difference.
            if state.is_settled() {
                let live = state.params.key();
                if live != ticket.key {
                    settle(state, live, commands);
                }
            }
        }
    }
}

fn start_soft_refresh(state: &mut ControllerState, key: ParamKey, commands: &mut Vec<Command>) {
    let ticket = state.issue_for(key);
    state.soft_slot = Some(ticket);
    state.phase = DerivedPhase::Refreshing;
    note(commands, Level::Info, Domain::Dashboard, "soft_refresh_issued", Some(&ticket), &[]);
    commands.push(Command::SoftRefresh(ticket));
}

fn handle_soft_refresh_done(
    state: &mut ControllerState,
    ticket: Ticket,
    result: Result<DashboardResponse, FetchError>,
    commands: &mut Vec<Command>,
) {
    if state.soft_slot != Some(ticket) {
        discard(commands, Intent::SoftRefresh, &ticket);
        return;
    }
    state.soft_slot = None;
    if state.phase == DerivedPhase::Refreshing {
        state.phase = DerivedPhase::Loaded;
    }

    let dash = match result {
        Err(err) => {
            fail(state, Intent::SoftRefresh, ticket.key, &err, commands);
            return;
        }
        Ok(dash) => dash,
    };

    remember_bill_histogram(state, &dash, ticket.key);
    match state.dashboard.as_mut() {
        Some(artifact) if artifact.produced_at_split == ticket.key.split_pct => {
            Arc::make_mut(artifact).merge_k_sensitive(&dash, ticket.key.k);
        }
        _ => {
            discard(commands, Intent::SoftRefresh, &ticket);
            return;
        }
    }
    state.clear_failure(Intent::SoftRefresh);
    note(commands, Level::Info, Domain::Dashboard, "soft_refresh_committed", Some(&ticket), &[]);

    retire_residuals(state, ticket.key, commands);
    if state.focus == View::Explainer {
        start_residual_load(state, commands);
    }
}

fn remember_bill_histogram(state: &mut ControllerState, dash: &DashboardResponse, key: ParamKey) {
    state.bill_histogram = Some(Stamped::new(dash.bill_histogram.clone(), key));
}

// =============================================================================
// Residuals
// =============================================================================

/// Residuals depend on both k and split; anything not stamped `key` is stale.
fn retire_residuals(state: &mut ControllerState, key: ParamKey, commands: &mut Vec<Command>) {
    let current = state.residual.as_ref().map(|r| r.key == key).unwrap_or(false);
    if state.how_loaded && !current {
        state.how_loaded = false;
        note(commands, Level::Debug, Domain::Residual, "residual_stale", None, &[]);
    }
    if let Some(t) = state.residual_slot {
        if t.key != key {
            state.residual_slot = None;
            discard(commands, Intent::ResidualLoad, &t);
        }
    }
}

fn start_residual_load(state: &mut ControllerState, commands: &mut Vec<Command>) {
    if state.how_loaded || state.residual_slot.is_some() {
        return;
    }
    let ticket = state.issue();
    state.residual_slot = Some(ticket);
    note(commands, Level::Info, Domain::Residual, "residual_load_issued", Some(&ticket), &[]);
    commands.push(Command::LoadResiduals(ticket));
}

fn handle_residual_done(
    state: &mut ControllerState,
    ticket: Ticket,
    result: Result<DashboardResponse, FetchError>,
    commands: &mut Vec<Command>,
) {
    if state.residual_slot != Some(ticket) {
        discard(commands, Intent::ResidualLoad, &ticket);
        return;
    }
    state.residual_slot = None;

    match result {
        Err(err) => fail(state, Intent::ResidualLoad, ticket.key, &err, commands),
        Ok(dash) => {
            remember_bill_histogram(state, &dash, ticket.key);
            state.residual = Some(Stamped::new(dash.residual_histogram, ticket.key));
            state.how_loaded = true;
            state.clear_failure(Intent::ResidualLoad);
            note(commands, Level::Info, Domain::Residual, "residual_committed", Some(&ticket), &[]);
        }
    }
}

// =============================================================================
// Prediction
// =============================================================================

fn start_predict(state: &mut ControllerState, features: FeatureVector, commands: &mut Vec<Command>) {
    let ticket = state.issue();
    let with_bill_histogram = state
        .bill_histogram
        .as_ref()
        .map(|h| h.key != ticket.key)
        .unwrap_or(true);
    if let Some(old) = state.predict_slot.replace(ticket) {
        note(commands, Level::Debug, Domain::Predict, "predict_superseded", Some(&old), &[]);
    }
    note(
        commands,
        Level::Info,
        Domain::Predict,
        "predict_issued",
        Some(&ticket),
        &[("with_bill_histogram", Value::Bool(with_bill_histogram))],
    );
    commands.push(Command::Predict {
        ticket,
        features,
        with_bill_histogram,
    });
}

fn handle_predict_done(
    state: &mut ControllerState,
    ticket: Ticket,
    result: Result<PredictionReply, FetchError>,
    commands: &mut Vec<Command>,
) {
    if state.predict_slot != Some(ticket) {
        discard(commands, Intent::Predict, &ticket);
        return;
    }
    state.predict_slot = None;

    match result {
        Err(err) => fail(state, Intent::Predict, ticket.key, &err, commands),
        Ok(reply) => {
            if let Some(h) = reply.bill_histogram {
                state.bill_histogram = Some(Stamped::new(h, ticket.key));
            }
            let bill_histogram = state
                .bill_histogram
                .as_ref()
                .filter(|h| h.key == ticket.key)
                .map(|h| h.value.clone());
            state.prediction = Some(Arc::new(PredictionOutcome {
                result: reply.result,
                features: reply.features,
                bill_histogram,
                key: ticket.key,
            }));
            state.clear_failure(Intent::Predict);
            note(commands, Level::Info, Domain::Predict, "prediction_committed", Some(&ticket), &[]);
        }
    }
}
