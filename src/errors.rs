use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::SchedulerState;

/// Failures while talking to the trapper server over the wire.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

#[derive(Error, Debug)]
pub enum TrapperError {
    #[error("error sending data to trapper server: {0}")]
    Send(#[source] TransportError),

    #[error("invalid response from trapper server")]
    Protocol,

    #[error("payload of {0} bytes does not fit in a trapper frame")]
    PayloadTooLarge(usize),

    #[error("refusing to send an empty item batch")]
    EmptyBatch,

    #[error("host name must be set before sending")]
    MissingHostName,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("logging initialisation failed: {0}")]
    Logging(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is {0:?}; tasks can only be changed or started while idle")]
    NotIdle(SchedulerState),

    #[error("task interval must be greater than zero")]
    InvalidInterval,
}
