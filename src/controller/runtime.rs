//! Async shell around the reducer.
//!
//! One task owns the state. Consumer calls and fetch completions arrive as
//! events, go through `reduce`, and every resulting command is executed
//! here. A fresh snapshot is published after each transition.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

use super::events::{Command, Event, PredictionReply};
use super::reducer::reduce;
use super::state::{ControllerState, Snapshot, Ticket, View};
use crate::api::{bounded, FeatureVector, ModelService};
use crate::config::ControllerConfig;
use crate::logging::{agg_increment, log, obj, tick_aggregator, v_str, v_u64, Domain, Level, ProfileScope};
use crate::params::{parse_int, ParamError};

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("controller has shut down")]
    Closed,
    #[error(transparent)]
    Param(#[from] ParamError),
}

pub struct Controller {
    state: ControllerState,
    service: Arc<dyn ModelService>,
    cfg: ControllerConfig,
    inbox: mpsc::UnboundedReceiver<Event>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    tasks: JoinSet<Event>,
    debounce: Option<AbortHandle>,
}

impl Controller {
    pub fn new(service: Arc<dyn ModelService>, cfg: ControllerConfig) -> (Self, ControllerHandle) {
        let state = ControllerState::new(cfg.initial_params());
        let (tx, inbox) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(Arc::new(state.snapshot()));
        let controller = Self {
            state,
            service,
            cfg,
            inbox,
            snapshots,
            tasks: JoinSet::new(),
            debounce: None,
        };
        let handle = ControllerHandle {
            tx,
            snapshots: snapshot_rx,
        };
        (controller, handle)
    }

    /// Start the controller on the current runtime.
    pub fn spawn(service: Arc<dyn ModelService>, cfg: ControllerConfig) -> ControllerHandle {
        let (controller, handle) = Self::new(service, cfg);
        tokio::spawn(controller.run());
        handle
    }

    /// Runs until every handle is dropped. Outstanding fetches are aborted
    /// on exit.
    pub async fn run(mut self) {
        log(
            Level::Info,
            Domain::System,
            "controller_started",
            obj(&[
                ("k", v_u64(self.state.params.k() as u64)),
                ("split_pct", v_u64(self.state.params.split_pct() as u64)),
                ("debounce_ms", v_u64(self.cfg.debounce.as_millis() as u64)),
                ("timeout_ms", v_u64(self.cfg.request_timeout.as_millis() as u64)),
            ]),
        );
        self.dispatch(Event::Mount);

        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(event) => self.dispatch(event),
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => log(
                        Level::Error,
                        Domain::System,
                        "task_failed",
                        obj(&[("msg", v_str(&err.to_string()))]),
                    ),
                },
            }
        }

        self.tasks.shutdown().await;
        log(Level::Info, Domain::System, "controller_stopped", obj(&[("seq", v_u64(self.state.seq))]));
    }

    fn dispatch(&mut self, event: Event) {
        let name = event.name();
        let out = reduce(&mut self.state, event);
        log(
            Level::Trace,
            Domain::System,
            "event",
            obj(&[("name", v_str(name)), ("seq", v_u64(out.seq))]),
        );
        for cmd in out.commands {
            self.execute(cmd);
        }
        self.snapshots.send_replace(Arc::new(self.state.snapshot()));
        tick_aggregator();
    }

    fn execute(&mut self, cmd: Command) {
        let limit = self.cfg.request_timeout;
        match cmd {
            Command::Log {
                level,
                domain,
                event,
                fields,
            } => {
                if let Some(counter) = counter_for(event) {
                    agg_increment(counter);
                }
                log(level, domain, event, fields);
            }
            Command::ArmDebounce { gen } => {
                if let Some(old) = self.debounce.take() {
                    old.abort();
                }
                let wait = self.cfg.debounce;
                let handle = self.tasks.spawn(async move {
                    tokio::time::sleep(wait).await;
                    Event::DebounceElapsed { gen }
                });
                self.debounce = Some(handle);
            }
            Command::Train(ticket) => {
                let svc = self.service.clone();
                self.tasks.spawn(async move {
                    let _scope = ProfileScope::with_context(Domain::Fetch, "train", &ticket_fields(&ticket));
                    let result = bounded(limit, svc.train(ticket.key)).await;
                    Event::TrainDone { ticket, result }
                });
            }
            Command::FullLoad(ticket) => {
                let svc = self.service.clone();
                self.tasks.spawn(async move {
                    let _scope = ProfileScope::with_context(Domain::Fetch, "full_load", &ticket_fields(&ticket));
                    let (dash, k_comparison) = tokio::join!(
                        bounded(limit, svc.dashboard(ticket.key)),
                        bounded(limit, svc.k_comparison(ticket.key.split_pct)),
                    );
                    // Both halves or nothing.
                    let result = match (dash, k_comparison) {
                        (Ok(dash), Ok(kc)) => Ok((dash, kc)),
                        (Err(err), _) | (_, Err(err)) => Err(err),
                    };
                    Event::FullLoadDone { ticket, result }
                });
            }
            Command::SoftRefresh(ticket) => {
                let svc = self.service.clone();
                self.tasks.spawn(async move {
                    let _scope = ProfileScope::with_context(Domain::Fetch, "soft_refresh", &ticket_fields(&ticket));
                    let result = bounded(limit, svc.dashboard(ticket.key)).await;
                    Event::SoftRefreshDone { ticket, result }
                });
            }
            Command::LoadResiduals(ticket) => {
                let svc = self.service.clone();
                self.tasks.spawn(async move {
                    let _scope = ProfileScope::with_context(Domain::Fetch, "residual_load", &ticket_fields(&ticket));
                    let result = bounded(limit, svc.dashboard(ticket.key)).await;
                    Event::ResidualDone { ticket, result }
                });
            }
            Command::Predict {
                ticket,
                features,
                with_bill_histogram,
            } => {
                let svc = self.service.clone();
                self.tasks.spawn(async move {
                    let _scope = ProfileScope::with_context(Domain::Fetch, "predict", &ticket_fields(&ticket));
                    let result = run_predict(svc, ticket, features, with_bill_histogram, limit).await;
                    Event::PredictDone { ticket, result }
                });
            }
        }
    }
}

async fn run_predict(
    svc: Arc<dyn ModelService>,
    ticket: Ticket,
    features: FeatureVector,
    with_bill_histogram: bool,
    limit: std::time::Duration,
) -> Result<PredictionReply, crate::api::FetchError> {
    if !with_bill_histogram {
        let result = bounded(limit, svc.predict(&features, ticket.key)).await?;
        return Ok(PredictionReply {
            result,
            features,
            bill_histogram: None,
        });
    }

    let (result, dash) = tokio::join!(
        bounded(limit, svc.predict(&features, ticket.key)),
        bounded(limit, svc.dashboard(ticket.key)),
    );
    let result = result?;
    // The histogram only decorates the prediction.
    let bill_histogram = match dash {
        Ok(dash) => Some(dash.bill_histogram),
        Err(err) => {
            let mut fields = ticket_fields(&ticket);
            fields.push(("msg", v_str(&err.to_string())));
            log(Level::Warn, Domain::Predict, "bill_histogram_unavailable", obj(&fields));
            None
        }
    };
    Ok(PredictionReply {
        result,
        features,
        bill_histogram,
    })
}

fn ticket_fields(ticket: &Ticket) -> Vec<(&'static str, Value)> {
    vec![
        ("gen", v_u64(ticket.gen)),
        ("k", v_u64(ticket.key.k as u64)),
        ("split_pct", v_u64(ticket.key.split_pct as u64)),
    ]
}

fn counter_for(event: &str) -> Option<&'static str> {
    if event.ends_with("_issued") {
        Some("issued")
    } else if event.ends_with("_committed") {
        Some("committed")
    } else if event == "completion_discarded" || event.ends_with("_superseded") {
        Some("discarded")
    } else if event == "fetch_failed" {
        Some("failed")
    } else {
        None
    }
}

/// Consumer side of a running controller. Cheap to clone.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Event>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl ControllerHandle {
    fn send(&self, event: Event) -> Result<(), HandleError> {
        self.tx.send(event).map_err(|_| HandleError::Closed)
    }

    /// Out-of-range values are clamped and even values move up to the next
    /// odd one.
    pub fn set_k(&self, k: i64) -> Result<(), HandleError> {
        self.send(Event::SetK(k))
    }

    pub fn set_k_text(&self, raw: &str) -> Result<(), HandleError> {
        self.set_k(parse_int(raw)?)
    }

    pub fn set_split_percent(&self, pct: i64) -> Result<(), HandleError> {
        self.send(Event::SetSplitPercent(pct))
    }

    pub fn set_split_text(&self, raw: &str) -> Result<(), HandleError> {
        self.set_split_percent(parse_int(raw)?)
    }

    pub fn focus(&self, view: View) -> Result<(), HandleError> {
        self.send(Event::Focus(view))
    }

    pub fn load_dashboard(&self) -> Result<(), HandleError> {
        self.send(Event::LoadDashboard)
    }

    pub fn load_residuals(&self) -> Result<(), HandleError> {
        self.send(Event::LoadResiduals)
    }

    pub fn predict(&self, features: FeatureVector) -> Result<(), HandleError> {
        self.send(Event::Predict(features))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_for<F>(&self, mut pred: F) -> Result<Arc<Snapshot>, HandleError>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snap = rx
            .wait_for(|s| pred(s.as_ref()))
            .await
            .map_err(|_| HandleError::Closed)?;
        Ok(snap.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_mapping() {
        assert_eq!(counter_for("train_issued"), Some("issued"));
        assert_eq!(counter_for("soft_refresh_committed"), Some("committed"));
        assert_eq!(counter_for("completion_discarded"), Some("discarded"));
        assert_eq!(counter_for("predict_superseded"), Some("discarded"));
        assert_eq!(counter_for("fetch_failed"), Some("failed"));
        assert_eq!(counter_for("full_invalidation"), None);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_controller() {
        let svc: Arc<dyn ModelService> = Arc::new(crate::api::stub::StubService::new());
        let (controller, handle) = Controller::new(svc, ControllerConfig::default());
        drop(controller);
        assert!(matches!(handle.set_k(3), Err(HandleError::Closed)));
        assert!(matches!(handle.set_k_text("abc"), Err(HandleError::Param(_))));
    }
}
