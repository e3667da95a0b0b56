//! Error types for replica-router

use std::fmt;

use thiserror::Error;

use crate::endpoint::RoutingTarget;

/// Boxed error payload carried by [`EndpointError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a physical endpoint failure should be treated by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
   /// Connectivity-class failure that may succeed against another endpoint.
   Transient,
   /// Failure in the operation itself (constraint violation, bad SQL, ...).
   NonTransient,
}

impl fmt::Display for FailureKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         FailureKind::Transient => write!(f, "transient"),
         FailureKind::NonTransient => write!(f, "non-transient"),
      }
   }
}

/// Failure reported by an [`Endpoint`](crate::Endpoint), tagged with its [`FailureKind`].
///
/// The router never inspects the payload; it only reads the tag to decide
/// between retrying elsewhere and propagating immediately.
#[derive(Debug, Error)]
#[error("{kind} endpoint failure: {source}")]
pub struct EndpointError {
   kind: FailureKind,
   #[source]
   source: BoxError,
}

impl EndpointError {
   pub fn new(kind: FailureKind, source: impl Into<BoxError>) -> Self {
      Self {
         kind,
         source: source.into(),
      }
   }

   /// Connectivity loss, timeouts, busy nodes.
   pub fn transient(source: impl Into<BoxError>) -> Self {
      Self::new(FailureKind::Transient, source)
   }

   /// Errors that would fail the same way on any node.
   pub fn non_transient(source: impl Into<BoxError>) -> Self {
      Self::new(FailureKind::NonTransient, source)
   }

   pub fn kind(&self) -> FailureKind {
      self.kind
   }

   pub fn is_transient(&self) -> bool {
      self.kind == FailureKind::Transient
   }

   /// Borrow the underlying driver error.
   pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
      self.source.as_ref()
   }

   /// Take the underlying driver error.
   pub fn into_inner(self) -> BoxError {
      self.source
   }
}

/// Errors that may occur when routing operations through a logical connection
#[derive(Error, Debug)]
pub enum Error {
   /// The logical connection has been closed and cannot be used
   #[error("logical connection has been closed")]
   SessionClosed,

   /// An open transaction would have to move to another endpoint. This is a
   /// bug in the caller or the router and is never retried.
   #[error("transaction is bound to {bound} and cannot be moved to {requested}")]
   TransactionAffinityViolation {
      bound: RoutingTarget,
      requested: RoutingTarget,
   },

   /// Every candidate endpoint, the primary included, failed transiently.
   #[error("no endpoint could serve the operation (tried {}): {source}", format_targets(.tried))]
   AllEndpointsUnavailable {
      tried: Vec<RoutingTarget>,
      #[source]
      source: EndpointError,
   },

   /// A transient failure that could not be retried, e.g. inside a transaction.
   #[error("transient failure on {endpoint}: {source}")]
   TransientEndpoint {
      endpoint: RoutingTarget,
      #[source]
      source: EndpointError,
   },

   /// The endpoint rejected the operation itself.
   #[error("{endpoint} rejected the operation: {source}")]
   NonTransientExec {
      endpoint: RoutingTarget,
      #[source]
      source: EndpointError,
   },

   /// The session believed a transaction was open but holds no physical
   /// connection for it. Commit and rollback without a transaction succeed
   /// instead of returning this.
   #[error("no active transaction")]
   NoActiveTransaction,

   /// A transaction was begun while another one is still open.
   #[error("a transaction is already active on this connection")]
   TransactionAlreadyActive,
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> &'static str {
      match self {
         Error::SessionClosed => "SESSION_CLOSED",
         Error::TransactionAffinityViolation { .. } => "TRANSACTION_AFFINITY_VIOLATION",
         Error::AllEndpointsUnavailable { .. } => "ALL_ENDPOINTS_UNAVAILABLE",
         Error::TransientEndpoint { .. } => "TRANSIENT_ENDPOINT_ERROR",
         Error::NonTransientExec { .. } => "NON_TRANSIENT_EXEC_ERROR",
         Error::NoActiveTransaction => "NO_ACTIVE_TRANSACTION",
         Error::TransactionAlreadyActive => "TRANSACTION_ALREADY_ACTIVE",
      }
   }

   /// The endpoint failure behind this error, if it came from an endpoint.
   pub fn endpoint_error(&self) -> Option<&EndpointError> {
      match self {
         Error::AllEndpointsUnavailable { source, .. }
         | Error::TransientEndpoint { source, .. }
         | Error::NonTransientExec { source, .. } => Some(source),
         _ => None,
      }
   }

   /// Wrap a failure from `endpoint` that will not be retried.
   pub(crate) fn from_endpoint(endpoint: RoutingTarget, source: EndpointError) -> Self {
      match source.kind() {
         FailureKind::Transient => Error::TransientEndpoint { endpoint, source },
         FailureKind::NonTransient => Error::NonTransientExec { endpoint, source },
      }
   }
}

fn format_targets(targets: &[RoutingTarget]) -> String {
   targets
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
      .join(", ")
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
