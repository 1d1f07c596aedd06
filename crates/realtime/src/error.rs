//! Fleet realtime errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = anyhow::Result<T, Error>;

/// Domain level error type returned by the reconciliation engine.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// A change event or query row could not be interpreted.
    #[error("code: invalid_format, description: {0}")]
    InvalidFormat(String),

    /// A field required to apply a row is missing.
    #[error("code: missing_field, description: missing {0}")]
    MissingField(String),

    /// The row belongs to a tenant other than the subscribed one.
    #[error("code: cross_tenant, description: {0}")]
    CrossTenant(String),

    /// The change feed failed to establish or dropped.
    #[error("code: transport_error, description: {0}")]
    Transport(String),

    /// A hydration or poll query failed.
    #[error("code: query_error, description: {0}")]
    Query(String),

    /// The requested entity is not tracked.
    #[error("code: not_found, description: {0}")]
    NotFound(String),

    /// A non recoverable internal error occurred.
    #[error("code: internal_error, description: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the stable error code associated with the variant.
    #[must_use]
    pub const fn code(&self) -> &str {
        match self {
            Self::InvalidFormat(_) => "invalid_format",
            Self::MissingField(_) => "missing_field",
            Self::CrossTenant(_) => "cross_tenant",
            Self::Transport(_) => "transport_error",
            Self::Query(_) => "query_error",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> String {
        self.to_string()
    }

    /// Whether the error leaves state usable and the next trigger may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Query(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let chain = err.chain().map(ToString::to_string).collect::<Vec<_>>().join(" -> ");

        // if type is Error, return it with the newly added context
        if let Some(inner) = err.downcast_ref::<Self>() {
            tracing::debug!("Error: {err}, caused by: {inner}");

            return match inner {
                Self::InvalidFormat(e) => Self::InvalidFormat(format!("{err}: {e}")),
                Self::MissingField(e) => Self::MissingField(format!("{err}: {e}")),
                Self::CrossTenant(e) => Self::CrossTenant(format!("{err}: {e}")),
                Self::Transport(_) => Self::Transport(chain),
                Self::Query(_) => Self::Query(chain),
                Self::NotFound(_) => Self::NotFound(chain),
                Self::Internal(_) => Self::Internal(chain),
            };
        }

        // otherwise, return an Internal error
        Self::Internal(chain)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidFormat(err.to_string())
    }
}

#[macro_export]
macro_rules! invalid_format {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::InvalidFormat(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::InvalidFormat(format!($err))
    };
}

#[macro_export]
macro_rules! missing_field {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::MissingField(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::MissingField(format!($err))
    };
}

#[macro_export]
macro_rules! transport {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Transport(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::Transport(format!($err))
    };
}

#[macro_export]
macro_rules! query {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Query(format!($fmt, $($arg)*))
    };
     ($err:expr $(,)?) => {
        $crate::Error::Query(format!($err))
    };
}
