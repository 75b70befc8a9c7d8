//! rdsys error types.

use std::sync::Arc;

/// The core rdsys error type. This type is used in all external rdsys
/// apis as well as internally in some modules.
///
/// This type is required to implement `Clone` so results can cross
/// channel and task boundaries without re-wrapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RdError {
    /// A resource with the requested unique id is not in the hashring.
    #[error("resource not found in hashring")]
    NotFound,

    /// An `add` saw a resource whose unique id is already present.
    /// Callers typically ignore this; the existing node's timestamp
    /// has been refreshed.
    #[error("resource already present in hashring")]
    AlreadyPresent,

    /// An operation that needs at least one node ran on an empty ring.
    #[error("hashring is empty")]
    Empty,

    /// A bearer token was missing or did not match any configured token.
    #[error("invalid authentication token")]
    Unauthorized,

    /// The request was malformed: bad JSON, a missing type field, or an
    /// invalid resource.
    #[error("bad request: {0}")]
    BadRequest(Arc<str>),

    /// The named resource type has no registered constructor.
    #[error("resource type {0:?} not implemented")]
    NotImplemented(Arc<str>),

    /// A call to an external prober failed.
    #[error("upstream request failed: {0}")]
    Upstream(Arc<str>),

    /// Loading or saving persisted state failed.
    #[error("persistence error: {0}")]
    Persistence(Arc<str>),

    /// Generic rdsys internal error.
    #[error("{0}")]
    Other(Arc<str>),
}

impl RdError {
    /// Construct a [RdError::BadRequest] error.
    pub fn bad_request<C: std::fmt::Display>(ctx: C) -> Self {
        Self::BadRequest(ctx.to_string().into_boxed_str().into())
    }

    /// Construct a [RdError::NotImplemented] error.
    pub fn not_implemented<C: std::fmt::Display>(ctx: C) -> Self {
        Self::NotImplemented(ctx.to_string().into_boxed_str().into())
    }

    /// Construct a [RdError::Upstream] error.
    pub fn upstream<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Upstream(ctx.to_string().into_boxed_str().into())
    }

    /// Construct a [RdError::Persistence] error.
    pub fn persistence<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Persistence(ctx.to_string().into_boxed_str().into())
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other(ctx.to_string().into_boxed_str().into())
    }
}

/// The core rdsys result type.
pub type RdResult<T> = Result<T, RdError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "resource already present in hashring",
            RdError::AlreadyPresent.to_string().as_str(),
        );
        assert_eq!(
            "bad request: missing \"type\" field",
            RdError::bad_request("missing \"type\" field")
                .to_string()
                .as_str(),
        );
        assert_eq!(
            "resource type \"obfs9\" not implemented",
            RdError::not_implemented("obfs9").to_string().as_str(),
        );
    }

    #[test]
    fn ensure_rd_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(RdError::Empty);
    }
}
