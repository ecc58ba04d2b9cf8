use std::io;
use thiserror::Error;

/// Errors surfaced to the caller of [`NetworkManager`](crate::NetworkManager).
#[derive(Debug, Error)]
pub enum GateError {
    /// Not running with the privilege needed to touch firewall rules.
    #[error("root privileges required for network management (effective uid {euid})")]
    Privilege { euid: u32 },

    /// A rule command failed; installed rules were rolled back.
    #[error("failed to install firewall rule `{rule}`: {source}")]
    RuleInstall {
        rule: String,
        #[source]
        source: RuleCommandError,
    },

    /// The inspection queue could not be bound; blocking was torn down.
    #[error("failed to bind inspection queue {queue_num}: {source}")]
    QueueBind {
        queue_num: u16,
        #[source]
        source: io::Error,
    },
}

/// A single invocation of the privileged rule tool failed.
#[derive(Debug, Error)]
pub enum RuleCommandError {
    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Errors while loading a [`GateConfig`](crate::GateConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
