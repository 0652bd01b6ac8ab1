//! Parameter-driven cache controller for the derived views.

pub mod events;
pub mod reducer;
pub mod runtime;
pub mod state;

pub use events::{Command, Event, PredictionReply};
pub use reducer::{reduce, ReducerOutput};
pub use runtime::{Controller, ControllerHandle, HandleError};
pub use state::{
    ControllerState, DashboardArtifact, DerivedPhase, FailureNotice, Intent, PredictionOutcome,
    Snapshot, Stamped, Ticket, View,
};
