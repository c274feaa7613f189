//! Error types
//!
//! `VelesError` is the single error value that crosses every layer boundary,
//! including the wire. Each variant has a stable code string; the protocol
//! serialises errors as `{code, msg}` maps so a client sees exactly the kind
//! the server produced.

use thiserror::Error;

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database belongs to another application (application_id {0:#x})")]
    ForeignDatabase(i64),

    #[error("Unknown database schema version {0}")]
    UnknownVersion(i64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Write at {start} is past the end of a {len} byte stream")]
    WritePastEnd { start: u64, len: u64 },
}

/// Errors produced by the store, the connection layer and the protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VelesError {
    #[error("Object gone: {0}")]
    ObjectGone(String),

    #[error("Object exists: {0}")]
    ObjectExists(String),

    #[error("Parent cycle: {0}")]
    ParentCycle(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Write past end: {0}")]
    WritePastEnd(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Subscription in use: {0}")]
    SubscriptionInUse(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Tags ambiguous: {0}")]
    TagsAmbiguous(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Broadcast not found: {0}")]
    BroadcastNotFound(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl VelesError {
    /// Stable wire code of this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            VelesError::ObjectGone(_) => "object_gone",
            VelesError::ObjectExists(_) => "object_exists",
            VelesError::ParentCycle(_) => "parent_cycle",
            VelesError::PreconditionFailed(_) => "precondition_failed",
            VelesError::WritePastEnd(_) => "write_past_end",
            VelesError::Schema(_) => "schema_error",
            VelesError::SubscriptionInUse(_) => "subscription_in_use",
            VelesError::UnknownSubscription(_) => "unknown_subscription",
            VelesError::ProtocolMismatch(_) => "protocol_mismatch",
            VelesError::Authentication(_) => "authentication_error",
            VelesError::ConnectionLost(_) => "connection_lost",
            VelesError::TagsAmbiguous(_) => "tags_ambiguous",
            VelesError::MethodNotFound(_) => "method_not_found",
            VelesError::QueryNotFound(_) => "query_not_found",
            VelesError::BroadcastNotFound(_) => "broadcast_not_found",
            VelesError::Handler(_) => "handler_error",
            VelesError::Storage(_) => "storage_error",
            VelesError::ConfigError(_) => "config_error",
            VelesError::Unsupported(_) => "unsupported",
        }
    }

    /// Human readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            VelesError::ObjectGone(m)
            | VelesError::ObjectExists(m)
            | VelesError::ParentCycle(m)
            | VelesError::PreconditionFailed(m)
            | VelesError::WritePastEnd(m)
            | VelesError::Schema(m)
            | VelesError::SubscriptionInUse(m)
            | VelesError::UnknownSubscription(m)
            | VelesError::ProtocolMismatch(m)
            | VelesError::Authentication(m)
            | VelesError::ConnectionLost(m)
            | VelesError::TagsAmbiguous(m)
            | VelesError::MethodNotFound(m)
            | VelesError::QueryNotFound(m)
            | VelesError::BroadcastNotFound(m)
            | VelesError::Handler(m)
            | VelesError::Storage(m)
            | VelesError::ConfigError(m)
            | VelesError::Unsupported(m) => m,
        }
    }

    /// Rebuild an error from its wire form.
    ///
    /// Unknown codes become `Handler` errors so plug-ins can raise their own
    /// kinds without breaking older peers.
    pub fn from_code(code: &str, msg: String) -> Self {
        match code {
            "object_gone" => VelesError::ObjectGone(msg),
            "object_exists" => VelesError::ObjectExists(msg),
            "parent_cycle" => VelesError::ParentCycle(msg),
            "precondition_failed" => VelesError::PreconditionFailed(msg),
            "write_past_end" => VelesError::WritePastEnd(msg),
            "schema_error" => VelesError::Schema(msg),
            "subscription_in_use" => VelesError::SubscriptionInUse(msg),
            "unknown_subscription" => VelesError::UnknownSubscription(msg),
            "protocol_mismatch" => VelesError::ProtocolMismatch(msg),
            "authentication_error" => VelesError::Authentication(msg),
            "connection_lost" => VelesError::ConnectionLost(msg),
            "tags_ambiguous" => VelesError::TagsAmbiguous(msg),
            "method_not_found" => VelesError::MethodNotFound(msg),
            "query_not_found" => VelesError::QueryNotFound(msg),
            "broadcast_not_found" => VelesError::BroadcastNotFound(msg),
            "handler_error" => VelesError::Handler(msg),
            "storage_error" => VelesError::Storage(msg),
            "config_error" => VelesError::ConfigError(msg),
            "unsupported" => VelesError::Unsupported(msg),
            other => VelesError::Handler(format!("{}: {}", other, msg)),
        }
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        VelesError::Schema(msg.into())
    }

    pub fn gone(what: impl std::fmt::Display) -> Self {
        VelesError::ObjectGone(what.to_string())
    }
}

impl From<StorageError> for VelesError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::WritePastEnd { .. } => VelesError::WritePastEnd(err.to_string()),
            other => VelesError::Storage(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for VelesError {
    fn from(err: rusqlite::Error) -> Self {
        VelesError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for VelesError {
    fn from(err: std::io::Error) -> Self {
        VelesError::ConnectionLost(err.to_string())
    }
}

impl From<config::ConfigError> for VelesError {
    fn from(err: config::ConfigError) -> Self {
        VelesError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        let errors = vec![
            VelesError::ObjectGone("a".into()),
            VelesError::ParentCycle("b".into()),
            VelesError::WritePastEnd("c".into()),
            VelesError::SubscriptionInUse("d".into()),
            VelesError::Authentication("e".into()),
        ];
        for err in errors {
            let back = VelesError::from_code(err.code(), err.message().to_string());
            assert_eq!(back, err);
        }
    }

    #[test]
    fn test_unknown_code_becomes_handler_error() {
        let err = VelesError::from_code("bmp_broken", "bad header".to_string());
        assert_eq!(err.code(), "handler_error");
        assert!(err.message().contains("bmp_broken"));
    }
}
