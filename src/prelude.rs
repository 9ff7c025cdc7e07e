//! Everything needed to write a load test: `use stampede::prelude::*;`

pub use crate::config::{StampedeConfiguration, StampedeDefault, StampedeDefaultType};
pub use crate::logger::LogFormat;
pub use crate::metrics::{
    MetricsSnapshot, OutcomeStatus, RequestOutcome, StampedeMetrics, TransportErrorKind,
};
pub use crate::profile::{ConcurrencyProfile, ProfileAction, ProfileHistory, ProfileStep};
pub use crate::user::{
    http_get, Iteration, IterationError, IterationFunction, IterationResult, PauseDistribution,
    UserState, VirtualUser,
};
pub use crate::{iteration, Stampede, StampedeError};
