//! Error types for the chat transport, the bus client and configuration.

use std::io;

use thiserror::Error;

/// Failures raised by the XMPP transport and the stanza codec.
#[derive(Debug, Error)]
pub enum XmppError {
    /// Socket could not be opened. Fatal for the current connection attempt.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    /// Decode-level failure; the offending element is dropped and reading continues.
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The server closed the stream (or the socket went away).
    #[error("stream closed by server")]
    EndOfStream,

    /// Any other read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Room discovery or profile decode failure.
    #[error("directory lookup failed: {0}")]
    DirectoryLookup(String),
}

impl XmppError {
    /// Classify a raw I/O error from the socket. Errors meaning the peer is gone
    /// become `EndOfStream` so the read loop reconnects instead of retrying a dead
    /// socket forever.
    pub fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => XmppError::EndOfStream,
            _ => XmppError::Io(err),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, XmppError::EndOfStream)
    }
}

/// Failures talking to the bot bus server.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to bus server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("bus I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bus serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_and_eof_classify_as_end_of_stream() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
        ] {
            let err = XmppError::from_read(io::Error::new(kind, "gone"));
            assert!(err.is_end_of_stream(), "{kind:?} should end the stream");
        }
    }

    #[test]
    fn test_other_io_errors_stay_transient() {
        let err = XmppError::from_read(io::Error::new(io::ErrorKind::InvalidData, "garbled"));
        assert!(matches!(err, XmppError::Io(_)));
    }
}
