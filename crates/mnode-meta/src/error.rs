//! Error taxonomy shared by every member node operation.
//!
//! Every failure surfaced to a caller maps onto one of five kinds, each with
//! a stable name and numeric code. Storage and codec failures are reported as
//! service failures.

use std::fmt;

use thiserror::Error;

/// The externally visible category of a [`MetaError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The referenced object or series does not exist.
    NotFound,
    /// The caller lacks the required permission.
    NotAuthorized,
    /// The request is malformed or violates an object state rule.
    InvalidRequest,
    /// The identifier is already in use.
    IdentifierNotUnique,
    /// An internal failure, such as an inconsistent store.
    ServiceFailure,
}

impl ErrorKind {
    /// Stable name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::NotAuthorized => "NotAuthorized",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::IdentifierNotUnique => "IdentifierNotUnique",
            ErrorKind::ServiceFailure => "ServiceFailure",
        }
    }

    /// Numeric code of this kind.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::NotAuthorized => 401,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::IdentifierNotUnique => 409,
            ErrorKind::ServiceFailure => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors returned by the member node core.
#[derive(Debug, Error)]
pub enum MetaError {
    /// No object or series is known under the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// The active subjects do not hold the required permission.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The request cannot be applied to the current object state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The identifier is already used by an object, series or queued replica.
    #[error("identifier not unique: {0}")]
    IdentifierNotUnique(String),

    /// Internal inconsistency detected while processing a request.
    #[error("service failure: {0}")]
    ServiceFailure(String),

    /// The key-value store failed.
    #[error("KV store error: {0}")]
    KvError(String),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl MetaError {
    /// Category reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetaError::NotFound(_) => ErrorKind::NotFound,
            MetaError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            MetaError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            MetaError::IdentifierNotUnique(_) => ErrorKind::IdentifierNotUnique,
            MetaError::ServiceFailure(_)
            | MetaError::KvError(_)
            | MetaError::Serialization(_) => ErrorKind::ServiceFailure,
        }
    }

    /// Numeric code of this error's kind.
    pub fn code(&self) -> u16 {
        self.kind().code()
    }

    /// Human readable description without the kind prefix.
    pub fn description(&self) -> String {
        match self {
            MetaError::NotFound(msg)
            | MetaError::NotAuthorized(msg)
            | MetaError::InvalidRequest(msg)
            | MetaError::IdentifierNotUnique(msg)
            | MetaError::ServiceFailure(msg)
            | MetaError::KvError(msg) => msg.clone(),
            MetaError::Serialization(e) => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_and_codes() {
        let cases = [
            (MetaError::NotFound("a".into()), "NotFound", 404),
            (MetaError::NotAuthorized("a".into()), "NotAuthorized", 401),
            (MetaError::InvalidRequest("a".into()), "InvalidRequest", 400),
            (
                MetaError::IdentifierNotUnique("a".into()),
                "IdentifierNotUnique",
                409,
            ),
            (MetaError::ServiceFailure("a".into()), "ServiceFailure", 500),
        ];
        for (err, name, code) in cases {
            assert_eq!(err.kind().name(), name);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_store_failures_are_service_failures() {
        let err = MetaError::KvError("lock poisoned".into());
        assert_eq!(err.kind(), ErrorKind::ServiceFailure);
        assert_eq!(err.description(), "lock poisoned");
    }

    #[test]
    fn test_display_includes_description() {
        let err = MetaError::NotFound("pid-1".into());
        assert_eq!(err.to_string(), "not found: pid-1");
        assert_eq!(err.kind().to_string(), "NotFound");
    }
}
