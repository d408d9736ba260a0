// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session key derivation and authorization HMACs
//!
//! Layouts follow TPM 2.0 Part 1, section 19.6:
//!
//! ```text
//! sessionKey = KDFa(hash, bindAuth ‖ salt, "ATH", nonceTPM, nonceCaller, digestBits)
//! cpHash     = H(commandCode ‖ name1 ‖ ... ‖ parameters)
//! rpHash     = H(responseCode ‖ commandCode ‖ parameters)
//! cmd HMAC   = HMAC(sessionKey ‖ authValue, cpHash ‖ nonceCaller ‖ nonceTPM
//!                   ‖ [decryptNonce] ‖ [encryptNonce] ‖ attributes)
//! rsp HMAC   = HMAC(sessionKey ‖ authValue, rpHash ‖ nonceTPM ‖ nonceCaller ‖ attributes)
//! ```

use std::fmt;

use zeroize::Zeroizing;

use crate::constants::{TpmAlgId, TpmCc, TpmaSa};
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};

pub fn cp_hash(alg: TpmAlgId, command: TpmCc, names: &[&[u8]], parameters: &[u8]) -> Result<Vec<u8>> {
    let cc = command.to_u32().to_be_bytes();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(names.len() + 2);
    parts.push(&cc);
    parts.extend_from_slice(names);
    parts.push(parameters);
    crypto::digest(alg, &parts)
}

pub fn rp_hash(alg: TpmAlgId, code: u32, command: TpmCc, parameters: &[u8]) -> Result<Vec<u8>> {
    crypto::digest(
        alg,
        &[&code.to_be_bytes(), &command.to_u32().to_be_bytes(), parameters],
    )
}

/// Secret state of one HMAC session
pub struct SessionSecrets {
    hash_alg: TpmAlgId,
    session_key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("hash_alg", &self.hash_alg)
            .field("bound_or_salted", &!self.session_key.is_empty())
            .finish()
    }
}

impl SessionSecrets {
    /// Derive the session key from the bind auth value and the salt
    ///
    /// `None` stands for a TPM_RH_NULL bind or tpmKey handle. Only a session
    /// with neither has an empty session key; an empty bind auth value still
    /// goes through KDFa.
    pub fn derive(
        hash_alg: TpmAlgId,
        bind_auth: Option<&[u8]>,
        salt: Option<&[u8]>,
        nonce_tpm: &[u8],
        nonce_caller: &[u8],
    ) -> Result<Self> {
        if bind_auth.is_none() && salt.is_none() {
            return Ok(Self {
                hash_alg,
                session_key: Zeroizing::new(Vec::new()),
            });
        }
        let bind_auth = bind_auth.unwrap_or_default();
        let salt = salt.unwrap_or_default();
        let mut secret = Zeroizing::new(Vec::with_capacity(bind_auth.len() + salt.len()));
        secret.extend_from_slice(bind_auth);
        secret.extend_from_slice(salt);
        let bits = (hash_alg.digest_size() * 8) as u32;
        let session_key = crypto::kdfa(hash_alg, &secret, "ATH", nonce_tpm, nonce_caller, bits)?;
        Ok(Self {
            hash_alg,
            session_key,
        })
    }

    /// `sessionKey ‖ authValue`, `auth` already trimmed
    pub fn hmac_key(&self, auth: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
        let auth = auth.unwrap_or_default();
        let mut key = Zeroizing::new(Vec::with_capacity(self.session_key.len() + auth.len()));
        key.extend_from_slice(&self.session_key);
        key.extend_from_slice(auth);
        key
    }

    pub fn command_hmac(
        &self,
        key: &[u8],
        cp_hash: &[u8],
        nonces: CommandNonces<'_>,
        attributes: TpmaSa,
    ) -> Result<Vec<u8>> {
        crypto::hmac(
            self.hash_alg,
            key,
            &[
                cp_hash,
                nonces.caller,
                nonces.tpm,
                nonces.decrypt.unwrap_or_default(),
                nonces.encrypt.unwrap_or_default(),
                &[attributes.0],
            ],
        )
    }

    pub fn response_hmac(
        &self,
        key: &[u8],
        rp_hash: &[u8],
        nonce_tpm: &[u8],
        nonce_caller: &[u8],
        attributes: TpmaSa,
    ) -> Result<Vec<u8>> {
        crypto::hmac(
            self.hash_alg,
            key,
            &[rp_hash, nonce_tpm, nonce_caller, &[attributes.0]],
        )
    }
}

/// Nonces entering one command HMAC
#[derive(Debug, Clone, Copy)]
pub struct CommandNonces<'a> {
    pub caller: &'a [u8],
    pub tpm: &'a [u8],
    /// nonceTPM of a separate decrypt session (first session only)
    pub decrypt: Option<&'a [u8]>,
    /// nonceTPM of a separate encrypt session (first session only)
    pub encrypt: Option<&'a [u8]>,
}

/// Rolling nonce pair of one HMAC session
///
/// `caller` and `tpm` are the last pair both sides agreed on. A command in
/// flight holds its fresh nonceCaller in `pending` until the response is
/// accepted.
#[derive(Debug, Clone)]
pub struct NonceState {
    size: usize,
    caller: Vec<u8>,
    tpm: Vec<u8>,
    pending: Option<Vec<u8>>,
}

impl NonceState {
    pub fn new(caller: Vec<u8>, tpm: Vec<u8>) -> Self {
        Self {
            size: caller.len(),
            caller,
            tpm,
            pending: None,
        }
    }

    pub fn caller(&self) -> &[u8] {
        &self.caller
    }

    pub fn tpm(&self) -> &[u8] {
        &self.tpm
    }

    pub fn pending(&self) -> Option<&[u8]> {
        self.pending.as_deref()
    }

    /// Issue a fresh nonceCaller for the next command
    pub fn rotate(&mut self) -> &[u8] {
        let mut next = crypto::random_bytes(self.size);
        while next == self.caller {
            next = crypto::random_bytes(self.size);
        }
        self.pending.insert(next)
    }

    /// Accept the device's new nonceTPM for the pending command
    pub fn commit(&mut self, nonce_tpm: &[u8]) -> Result<()> {
        let caller = self
            .pending
            .take()
            .ok_or_else(|| Error::protocol("no command in flight for this session"))?;
        if nonce_tpm.is_empty() || nonce_tpm == self.tpm.as_slice() {
            return Err(Error::NonceMismatch(
                "device did not rotate nonceTPM".into(),
            ));
        }
        self.caller = caller;
        self.tpm = nonce_tpm.to_vec();
        Ok(())
    }

    /// Forget the pending nonce of a command the device rejected
    pub fn abort(&mut self) {
        self.pending = None;
    }
}

/// One command authorization entry (TPMS_AUTH_COMMAND)
#[derive(Clone, PartialEq, Eq)]
pub struct AuthArea {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for AuthArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthArea")
            .field("session_handle", &format_args!("0x{:08x}", self.session_handle))
            .field("nonce_len", &self.nonce.len())
            .field("attributes", &self.attributes)
            .field("hmac_len", &self.hmac.len())
            .finish()
    }
}

impl Marshal for AuthArea {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for AuthArea {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: buf.get_tpm2b()?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: Zeroizing::new(buf.get_tpm2b()?),
        })
    }
}

/// One response authorization entry (TPMS_AUTH_RESPONSE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl Marshal for AuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for AuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: buf.get_tpm2b()?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}
