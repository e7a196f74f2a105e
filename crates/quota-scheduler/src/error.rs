//! Typed errors for the scheduler plugin layer: everything
//! [`crate::admission`], [`crate::events`], and [`crate::recovery`] can fail
//! with. Structural failures from `quota-core` pass through as a variant
//! rather than being re-wrapped into strings, so a denial still carries the
//! original invariant that was violated.

use quota_core::{error::TopologyError, resources::QuantityParseError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PluginError {
    #[snafu(display("quota topology rejected the request: {source}"))]
    Topology { source: TopologyError },

    #[snafu(display("pod {pod_uid:?} has no resolvable quota group"))]
    UnresolvedQuota { pod_uid: String },

    #[snafu(display("{subject} has an unparsable resource quantity: {source}"))]
    InvalidResourceQuantity {
        subject: String,
        source: QuantityParseError,
    },

    #[snafu(display("pod {pod_uid:?} was not found in the cycle-local snapshot"))]
    NoCycleSnapshot { pod_uid: String },
}

impl From<TopologyError> for PluginError {
    fn from(source: TopologyError) -> Self {
        Self::Topology { source }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
