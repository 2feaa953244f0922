//! Error types for registry operations.
//!
//! CRUD callers get these back verbatim. The watch loops absorb the transient
//! ones internally and only surface `WatchStopped`, a fatal client
//! construction failure, or a closed event queue.

use thiserror::Error;

use crate::models::EtcdError;

/// Top-level error type for the subnet-registry crate.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A listing operation resolved to a leaf key instead of a directory.
    #[error("{0} is not a directory")]
    NotADirectory(String),

    /// Malformed JSON or integer text stored under `key`.
    #[error("failed to decode value of '{key}': {reason}")]
    Decode { key: String, reason: String },

    /// Network or connection failure talking to the store.
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with an API error (key not found, node exists, ...).
    #[error("{0}")]
    Etcd(EtcdError),

    /// The consumer fired the stop signal while a watch was in flight.
    #[error("watch stopped by consumer")]
    WatchStopped,

    /// The store client could not be built. Nothing in the registry can run
    /// without one, so this is never retried.
    #[error("failed to construct store client: {0}")]
    ClientConstruction(String),

    /// Invalid connection configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The consumer dropped the receiving half of an event queue.
    #[error("{0} event queue closed")]
    EventQueueClosed(&'static str),
}

impl RegistryError {
    /// Build a decode error for `key` from any displayable cause.
    pub fn decode(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RegistryError::Decode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for network failures a watch loop recovers from by
    /// rebuilding the client.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transport(_))
    }

    /// Returns true if the store reported that the key does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::Etcd(e) if e.is_key_not_found())
    }

    /// Returns true if the store reported that the key already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RegistryError::Etcd(e) if e.is_node_exist() || e.is_not_file())
    }

    /// Returns true if the process cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistryError::ClientConstruction(_))
    }
}

impl From<EtcdError> for RegistryError {
    fn from(err: EtcdError) -> Self {
        RegistryError::Etcd(err)
    }
}

/// Shorthand result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error_code;

    fn etcd(code: u64) -> RegistryError {
        RegistryError::Etcd(EtcdError {
            error_code: code,
            message: "msg".into(),
            cause: "/registry/minions/10.0.0.5".into(),
            index: 7,
        })
    }

    #[test]
    fn test_error_classification() {
        let transport = RegistryError::Transport("conn reset".into());
        assert!(transport.is_transient());
        assert!(!transport.is_fatal());
        assert!(!transport.is_not_found());

        let not_found = etcd(error_code::KEY_NOT_FOUND);
        assert!(not_found.is_not_found());
        assert!(!not_found.is_transient());
        assert!(!not_found.is_already_exists());

        assert!(etcd(error_code::NODE_EXIST).is_already_exists());
        assert!(etcd(error_code::NOT_FILE).is_already_exists());

        let fatal = RegistryError::ClientConstruction("bad cert".into());
        assert!(fatal.is_fatal());
        assert!(!fatal.is_transient());

        assert!(!RegistryError::WatchStopped.is_transient());
        assert!(!RegistryError::NotADirectory("/registry/minions".into()).is_transient());
    }

    #[test]
    fn test_error_display_names_key() {
        let err = RegistryError::decode("/registry/subnets/config/SubnetLength", "invalid digit");
        let msg = format!("{err}");
        assert!(msg.contains("/registry/subnets/config/SubnetLength"));
        assert!(msg.contains("invalid digit"));

        let msg = format!("{}", etcd(error_code::KEY_NOT_FOUND));
        assert!(msg.contains("/registry/minions/10.0.0.5"));
    }
}
