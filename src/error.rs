/// Result type alias for replicated database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the SQLite replica adapter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from routing: closed session, affinity violation, or an
   /// endpoint failure that could not be failed over.
   #[error(transparent)]
   Router(#[from] replica_router::Error),

   /// Error from SQLx operations outside a routed call.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from fetchOne query.
   #[error("fetchOne() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// A statement produced a different kind of output than it was sent as.
   #[error("expected {expected} output from statement")]
   UnexpectedOutput { expected: &'static str },
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// SQLite failures surface their SQLite code whether or not they came
   /// through the router.
   pub fn error_code(&self) -> String {
      if let Some(code) = self.sqlite_code() {
         return format!("SQLITE_{}", code);
      }
      match self {
         Error::Router(e) => e.error_code().to_string(),
         Error::Sqlx(_) => "SQLX_ERROR".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::UnexpectedOutput { .. } => "UNEXPECTED_OUTPUT".to_string(),
      }
   }

   /// The underlying `sqlx::Error`, if there is one.
   pub fn as_sqlx(&self) -> Option<&sqlx::Error> {
      match self {
         Error::Sqlx(e) => Some(e),
         Error::Router(e) => e
            .endpoint_error()
            .and_then(|e| e.inner().downcast_ref::<sqlx::Error>()),
         _ => None,
      }
   }

   fn sqlite_code(&self) -> Option<String> {
      let db_err = self.as_sqlx()?.as_database_error()?;
      db_err.code().map(|code| code.into_owned())
   }
}

#[cfg(test)]
mod tests {
   use replica_router::{EndpointError, RoutingTarget};

   use super::*;

   #[test]
   fn test_error_code_multiple_rows_returned() {
      let err = Error::MultipleRowsReturned(5);
      assert_eq!(err.error_code(), "MULTIPLE_ROWS_RETURNED");
      assert!(err.to_string().contains("5 rows"));
   }

   #[test]
   fn test_error_code_transaction_rollback_failed() {
      let err = Error::TransactionRollbackFailed {
         transaction_error: "constraint".into(),
         rollback_error: "busy".into(),
      };
      assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");
      assert!(err.to_string().contains("constraint"));
      assert!(err.to_string().contains("busy"));
   }

   #[test]
   fn test_error_code_unsupported_datatype() {
      let err = Error::UnsupportedDatatype("WEIRD".into());
      assert_eq!(err.error_code(), "UNSUPPORTED_DATATYPE");
   }

   #[test]
   fn test_error_code_sqlx_non_database() {
      // RowNotFound is not a database error, so no SQLite code
      let err = Error::Sqlx(sqlx::Error::RowNotFound);
      assert_eq!(err.error_code(), "SQLX_ERROR");
   }

   #[test]
   fn test_error_code_router() {
      let err = Error::from(replica_router::Error::SessionClosed);
      assert_eq!(err.error_code(), "SESSION_CLOSED");

      let err = Error::from(replica_router::Error::AllEndpointsUnavailable {
         tried: vec![RoutingTarget::Primary],
         source: EndpointError::transient(sqlx::Error::PoolTimedOut),
      });
      assert_eq!(err.error_code(), "ALL_ENDPOINTS_UNAVAILABLE");
      assert!(matches!(err.as_sqlx(), Some(sqlx::Error::PoolTimedOut)));
   }
}
