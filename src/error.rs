//! Error types for query fetching.

use std::fmt;
use std::sync::Arc;

/// Errors surfaced by queries.
///
/// Fetch failures can be propagated from a query function with the `?`
/// operator: any `Into<anyhow::Error>` converts into [`QueryError::Fetch`].
#[derive(Debug, Clone)]
pub enum QueryError {
    /// The query function failed and retries were exhausted.
    Fetch(Arc<anyhow::Error>),

    /// The fetch was aborted before it settled.
    ///
    /// Cancellation never overwrites cached data or errors.
    Cancelled,

    /// A fetch was requested for a query that has no query function.
    MissingQueryFn {
        /// Fingerprint of the query.
        fingerprint: String,
    },

    /// Cached data is not of the type requested by the caller.
    TypeMismatch {
        /// Fingerprint of the query.
        fingerprint: String,
        /// The requested type.
        expected: &'static str,
    },

    /// A fetch was requested outside a Tokio runtime.
    NoRuntime,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Fetch(e) => write!(f, "query failed: {}", e),
            QueryError::Cancelled => write!(f, "query cancelled"),
            QueryError::MissingQueryFn { fingerprint } => {
                write!(f, "missing query function for {}", fingerprint)
            }
            QueryError::TypeMismatch {
                fingerprint,
                expected,
            } => write!(f, "cached data for {} is not a {}", fingerprint, expected),
            QueryError::NoRuntime => write!(f, "fetching requires a Tokio runtime"),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for QueryError {
    fn from(err: T) -> Self {
        QueryError::Fetch(Arc::new(err.into()))
    }
}

impl QueryError {
    /// Returns `true` if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }

    /// Returns the underlying fetch error, if any.
    pub fn fetch_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the fetch error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.fetch_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Identity comparison.
    ///
    /// Two fetch errors are the same only if they are clones of one failure.
    pub fn ptr_eq(&self, other: &QueryError) -> bool {
        match (self, other) {
            (QueryError::Fetch(a), QueryError::Fetch(b)) => Arc::ptr_eq(a, b),
            (QueryError::Cancelled, QueryError::Cancelled) => true,
            (
                QueryError::MissingQueryFn { fingerprint: a },
                QueryError::MissingQueryFn { fingerprint: b },
            ) => a == b,
            (
                QueryError::TypeMismatch {
                    fingerprint: a,
                    expected: x,
                },
                QueryError::TypeMismatch {
                    fingerprint: b,
                    expected: y,
                },
            ) => a == b && x == y,
            (QueryError::NoRuntime, QueryError::NoRuntime) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NotFound(u32);

    impl fmt::Display for NotFound {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "item {} not found", self.0)
        }
    }

    impl std::error::Error for NotFound {}

    #[test]
    fn test_from_custom_error() {
        let err: QueryError = NotFound(3).into();
        assert!(matches!(err, QueryError::Fetch(_)));
        assert_eq!(err.to_string(), "query failed: item 3 not found");
        assert_eq!(err.downcast_ref::<NotFound>().map(|e| e.0), Some(3));
    }

    #[test]
    fn test_question_mark_conversion() {
        fn parse(input: &str) -> Result<i32, QueryError> {
            Ok(input.parse::<i32>()?)
        }

        assert_eq!(parse("42").unwrap(), 42);
        assert!(parse("nope").unwrap_err().to_string().contains("invalid digit"));
    }

    #[test]
    fn test_ptr_eq() {
        let a: QueryError = anyhow::anyhow!("boom").into();
        let b: QueryError = anyhow::anyhow!("boom").into();
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
        assert!(QueryError::Cancelled.ptr_eq(&QueryError::Cancelled));
        assert!(!a.ptr_eq(&QueryError::Cancelled));
        assert!(QueryError::Cancelled.is_cancelled());
    }
}
