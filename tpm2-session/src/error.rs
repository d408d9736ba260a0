// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy of the session layer

use thiserror::Error;

use crate::constants::{ResponseCode, TpmCc};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid descriptor or command shape, detected before anything is sent.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The device rejected the presented authorization.
    #[error("{command:?} rejected authorization of session #{session} ({code})")]
    WrongSecret {
        command: TpmCc,
        session: u8,
        code: ResponseCode,
    },
    /// No free slot for a persistent session, locally or on the device.
    #[error("no free session slot")]
    SlotExhausted,
    /// The device's nonce or response HMAC does not match the issued nonceCaller.
    /// The session must be discarded.
    #[error("nonce mismatch: {0}")]
    NonceMismatch(String),
    /// Session state is no longer trustworthy or the response is malformed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// I/O failure or timeout talking to the device.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    /// A persistent session was released twice or used after release.
    #[error("session already released")]
    AlreadyReleased,
    /// Any other non-success response code.
    #[error("{command:?} failed with {code}")]
    Tpm { command: TpmCc, code: ResponseCode },
    #[error("cryptographic failure: {0}")]
    Crypto(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Whether a session involved in the failed exchange must be thrown away.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Error::NonceMismatch(_) | Error::ProtocolViolation(_) | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poisoning_classification() {
        assert!(Error::NonceMismatch("replayed".into()).poisons_session());
        assert!(Error::Transport(std::io::ErrorKind::TimedOut.into()).poisons_session());
        assert!(!Error::SlotExhausted.poisons_session());
        assert!(!Error::WrongSecret {
            command: TpmCc::Unseal,
            session: 1,
            code: ResponseCode(0x98E),
        }
        .poisons_session());
    }
}
