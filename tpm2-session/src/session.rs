// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session lifecycle
//!
//! A [`Session`] carries the secret state of one authorization session
//! between exchanges. Persistent sessions occupy a slot of the
//! [`SessionManager`] pool until their [`Release`] token is handed back to
//! the context; ephemeral sessions are started inline for a single exchange.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{AuthArea, AuthResponse, CommandNonces, NonceState, SessionSecrets};
use crate::constants::{tpm_rh, TpmAlgId, TpmaSa};
use crate::descriptor::{AuthValue, Encryption, KeyMaterial, SessionDescriptor};
use crate::error::{Error, Result};
use crate::param::{self, ParameterCipher};
use crate::types::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHandle {
    /// Started inline for one exchange, flushed by the device afterwards
    Ephemeral,
    /// Device session owning one pool slot
    Persistent {
        device_handle: u32,
        slot: usize,
        generation: u64,
    },
}

/// Device-side state of an active HMAC session
#[derive(Debug)]
pub(crate) struct HmacState {
    pub(crate) device_handle: u32,
    pub(crate) secrets: SessionSecrets,
    pub(crate) nonces: NonceState,
}

/// Per-command decisions taken by [`Session::prepare`]
#[derive(Debug, Clone)]
struct Exchange {
    include_auth: bool,
    attributes: TpmaSa,
}

/// An authorization session usable for command exchanges
///
/// Not internally synchronized; share across threads behind a `Mutex`.
#[derive(Debug)]
pub struct Session {
    descriptor: SessionDescriptor,
    handle: SessionHandle,
    state: Option<HmacState>,
    exchange: Option<Exchange>,
    poisoned: bool,
    max_parameter_size: usize,
}

impl Session {
    pub(crate) fn new(
        descriptor: SessionDescriptor,
        handle: SessionHandle,
        state: Option<HmacState>,
        max_parameter_size: usize,
    ) -> Self {
        Self {
            descriptor,
            handle,
            state,
            exchange: None,
            poisoned: false,
            max_parameter_size,
        }
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Handle of the session on the device, if one is active
    pub fn device_handle(&self) -> Option<u32> {
        match &self.descriptor {
            SessionDescriptor::Password(_) => Some(tpm_rh::PW),
            SessionDescriptor::Hmac(_) => self.state.as_ref().map(|s| s.device_handle),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.handle, SessionHandle::Persistent { .. })
    }

    /// Whether the session has lost sync with the device and must be discarded
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn encryption(&self) -> Option<Encryption> {
        self.descriptor.encryption()
    }

    /// Current (nonceCaller, nonceTPM) pair
    pub fn nonces(&self) -> Option<(&[u8], &[u8])> {
        self.state
            .as_ref()
            .map(|s| (s.nonces.caller(), s.nonces.tpm()))
    }

    /// nonceCaller issued for the command in flight
    pub fn pending_nonce(&self) -> Option<&[u8]> {
        self.state.as_ref().and_then(|s| s.nonces.pending())
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::protocol(
                "session was poisoned by an earlier failure and must be discarded",
            ));
        }
        Ok(())
    }

    pub(crate) fn poison(&mut self) {
        if !self.poisoned {
            debug!(handle = ?self.device_handle(), "poisoning session");
        }
        self.poisoned = true;
        self.exchange = None;
    }

    pub(crate) fn activate(&mut self, state: HmacState) {
        self.state = Some(state);
    }

    /// Drop inline device state once the exchange is over
    pub(crate) fn deactivate(&mut self) -> Option<u32> {
        self.exchange = None;
        if self.is_persistent() {
            return None;
        }
        self.state.take().map(|s| s.device_handle)
    }

    fn state(&self) -> Result<&HmacState> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::protocol("session is not active on the device"))
    }

    fn exchange(&self) -> Result<&Exchange> {
        self.exchange
            .as_ref()
            .ok_or_else(|| Error::protocol("session has no command in flight"))
    }

    /// Start a command exchange
    ///
    /// Issues a fresh nonceCaller and fixes the session attributes. `target`
    /// is the entity this session authorizes, `None` for a session that only
    /// encrypts.
    pub fn prepare(&mut self, target: Option<&Entity>, decrypt: bool, encrypt: bool) -> Result<()> {
        self.ensure_usable()?;
        let hmac = match &self.descriptor {
            SessionDescriptor::Password(_) => {
                if target.is_none() {
                    return Err(Error::config(
                        "a password session can only authorize a handle",
                    ));
                }
                if decrypt || encrypt {
                    return Err(Error::config("a password session cannot encrypt"));
                }
                self.exchange = Some(Exchange {
                    include_auth: true,
                    attributes: TpmaSa::new().with_continue_session(),
                });
                return Ok(());
            }
            SessionDescriptor::Hmac(h) => h,
        };
        let encryption = hmac.encryption();
        if decrypt && !encryption.is_some_and(|e| e.direction.decrypts_command()) {
            return Err(Error::config("session is not set up to encrypt commands"));
        }
        if encrypt && !encryption.is_some_and(|e| e.direction.encrypts_response()) {
            return Err(Error::config("session is not set up to encrypt responses"));
        }

        let include_auth = match (target, hmac.key_material()) {
            (None, _) => false,
            (Some(entity), KeyMaterial::Bound { bind, .. }) => bind.name != entity.name,
            (Some(_), _) => true,
        };
        let mut attributes = TpmaSa::new();
        if self.is_persistent() {
            attributes = attributes.with_continue_session();
        }
        if decrypt {
            attributes = attributes.with_decrypt();
        }
        if encrypt {
            attributes = attributes.with_encrypt();
        }

        let persistent = self.is_persistent();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::protocol("session is not active on the device"))?;
        state.nonces.rotate();
        debug!(
            handle = format_args!("0x{:08x}", state.device_handle),
            persistent, include_auth, decrypt, encrypt, "prepared session"
        );
        self.exchange = Some(Exchange {
            include_auth,
            attributes,
        });
        Ok(())
    }

    fn auth_value(&self) -> Option<&AuthValue> {
        match &self.descriptor {
            SessionDescriptor::Password(v) => Some(v),
            SessionDescriptor::Hmac(h) => Some(h.key_material().auth()),
        }
    }

    fn hmac_key(&self, override_auth: Option<&AuthValue>) -> Result<Zeroizing<Vec<u8>>> {
        let exchange = self.exchange()?;
        let auth = if exchange.include_auth {
            override_auth.or(self.auth_value()).map(AuthValue::trimmed)
        } else {
            None
        };
        Ok(self.state()?.secrets.hmac_key(auth))
    }

    fn encryption_bits(&self) -> Result<(TpmAlgId, u16)> {
        match &self.descriptor {
            SessionDescriptor::Hmac(h) => match h.encryption() {
                Some(e) => Ok((h.hash_alg(), e.key_bits)),
                None => Err(Error::config("session does not encrypt parameters")),
            },
            SessionDescriptor::Password(_) => {
                Err(Error::config("a password session cannot encrypt"))
            }
        }
    }

    /// Encrypt the first command parameter in place for the exchange in flight
    pub fn encrypt_parameter(&self, plaintext: &mut [u8]) -> Result<()> {
        self.ensure_usable()?;
        param::check_size(plaintext.len(), self.max_parameter_size)?;
        let (alg, bits) = self.encryption_bits()?;
        let state = self.state()?;
        let caller = state
            .nonces
            .pending()
            .ok_or_else(|| Error::protocol("session has no command in flight"))?;
        let key = self.hmac_key(None)?;
        ParameterCipher::derive(alg, &key, bits, caller, state.nonces.tpm())?.encrypt(plaintext)
    }

    /// Decrypt the first response parameter in place with the current nonce pair
    pub fn decrypt_parameter(&self, ciphertext: &mut [u8]) -> Result<()> {
        self.ensure_usable()?;
        param::check_size(ciphertext.len(), self.max_parameter_size)?;
        let (alg, bits) = self.encryption_bits()?;
        let state = self.state()?;
        let key = self.hmac_key(None)?;
        ParameterCipher::derive(alg, &key, bits, state.nonces.tpm(), state.nonces.caller())?
            .decrypt(ciphertext)
    }

    /// Authorization entry for the exchange in flight
    pub fn authorize(&self, cp_hash: &[u8]) -> Result<AuthArea> {
        self.authorize_with(cp_hash, None, None)
    }

    /// As [`Session::authorize`], folding in the nonceTPM of separate
    /// decrypt/encrypt sessions (first session of a command only)
    pub(crate) fn authorize_with(
        &self,
        cp_hash: &[u8],
        decrypt_nonce: Option<&[u8]>,
        encrypt_nonce: Option<&[u8]>,
    ) -> Result<AuthArea> {
        self.ensure_usable()?;
        let exchange = self.exchange()?;
        if let SessionDescriptor::Password(value) = &self.descriptor {
            return Ok(AuthArea {
                session_handle: tpm_rh::PW,
                nonce: Vec::new(),
                attributes: exchange.attributes,
                hmac: Zeroizing::new(value.as_bytes().to_vec()),
            });
        }
        let state = self.state()?;
        let caller = state
            .nonces
            .pending()
            .ok_or_else(|| Error::protocol("session has no command in flight"))?;
        let key = self.hmac_key(None)?;
        let hmac = state.secrets.command_hmac(
            &key,
            cp_hash,
            CommandNonces {
                caller,
                tpm: state.nonces.tpm(),
                decrypt: decrypt_nonce,
                encrypt: encrypt_nonce,
            },
            exchange.attributes,
        )?;
        Ok(AuthArea {
            session_handle: state.device_handle,
            nonce: caller.to_vec(),
            attributes: exchange.attributes,
            hmac: Zeroizing::new(hmac),
        })
    }

    /// Check the device's authorization entry and accept its new nonceTPM
    ///
    /// Any mismatch poisons the session. `new_auth` replaces the entity's
    /// auth value when the command changed it.
    pub(crate) fn verify_response(
        &mut self,
        rp_hash: &[u8],
        response: &AuthResponse,
        new_auth: Option<&AuthValue>,
    ) -> Result<()> {
        // The exchange stays open so the response parameter can still be
        // decrypted; the context closes it afterwards.
        let result = self.check_response(rp_hash, response, new_auth);
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn check_response(
        &mut self,
        rp_hash: &[u8],
        response: &AuthResponse,
        new_auth: Option<&AuthValue>,
    ) -> Result<()> {
        self.ensure_usable()?;
        let exchange = self.exchange()?.clone();
        if response.attributes.contains(TpmaSa::CONTINUE_SESSION)
            != exchange.attributes.contains(TpmaSa::CONTINUE_SESSION)
        {
            return Err(Error::protocol("continueSession not echoed by the device"));
        }
        if self.descriptor.is_password() {
            if !response.nonce.is_empty() || !response.hmac.is_empty() {
                return Err(Error::protocol("password session answered with an HMAC"));
            }
            return Ok(());
        }
        let key = self.hmac_key(new_auth)?;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::protocol("session is not active on the device"))?;
        let caller = state
            .nonces
            .pending()
            .ok_or_else(|| Error::protocol("session has no command in flight"))?;
        if response.nonce == state.nonces.tpm() {
            return Err(Error::NonceMismatch("device reused nonceTPM".into()));
        }
        let expected = state.secrets.response_hmac(
            &key,
            rp_hash,
            &response.nonce,
            caller,
            response.attributes,
        )?;
        if !crate::crypto::verify_mac(&expected, &response.hmac) {
            return Err(Error::NonceMismatch(format!(
                "response HMAC of session 0x{:08x} does not verify",
                state.device_handle
            )));
        }
        state.nonces.commit(&response.nonce)
    }

    /// Forget the exchange in flight after the device rejected the command
    pub(crate) fn abort(&mut self) {
        self.exchange = None;
        if let Some(state) = self.state.as_mut() {
            state.nonces.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Acquired, device session not yet started
    Reserved,
    Active(u32),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u64,
    state: SlotState,
}

/// Fixed-capacity pool of persistent session slots
///
/// Each slot carries a generation bumped on release so a stale handle can
/// never free a slot that has since been handed to another session.
#[derive(Debug)]
pub struct SessionManager {
    slots: Vec<Slot>,
}

impl SessionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![
                Slot {
                    generation: 0,
                    state: SlotState::Free,
                };
                capacity
            ],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently held by started sessions
    pub fn active_sessions(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count()
    }

    /// Device handles of every active persistent session
    pub fn active_handles(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter_map(|s| match s.state {
                SlotState::Active(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    pub fn acquire(&mut self) -> Result<(usize, u64)> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.state == SlotState::Free)
            .ok_or(Error::SlotExhausted)?;
        slot.state = SlotState::Reserved;
        Ok((index, slot.generation))
    }

    fn slot_mut(&mut self, index: usize, generation: u64) -> Result<&mut Slot> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && slot.state != SlotState::Free => {
                Ok(slot)
            }
            _ => Err(Error::AlreadyReleased),
        }
    }

    pub fn commit(&mut self, index: usize, generation: u64, device_handle: u32) -> Result<()> {
        let slot = self.slot_mut(index, generation)?;
        slot.state = SlotState::Active(device_handle);
        Ok(())
    }

    /// Return a reserved slot whose device session failed to start
    pub fn abandon(&mut self, index: usize, generation: u64) {
        if let Ok(slot) = self.slot_mut(index, generation) {
            if slot.state == SlotState::Reserved {
                slot.state = SlotState::Free;
            }
        }
    }

    /// Free a slot, returning the device handle it held
    pub fn release(&mut self, index: usize, generation: u64) -> Result<u32> {
        let slot = self.slot_mut(index, generation)?;
        let SlotState::Active(device_handle) = slot.state else {
            return Err(Error::AlreadyReleased);
        };
        slot.state = SlotState::Free;
        slot.generation += 1;
        Ok(device_handle)
    }

    /// Fail unless `handle` still owns its slot
    pub fn check(&self, handle: SessionHandle) -> Result<()> {
        match handle {
            SessionHandle::Ephemeral => Ok(()),
            SessionHandle::Persistent {
                device_handle,
                slot,
                generation,
            } => match self.slots.get(slot) {
                Some(s) if s.generation == generation && s.state == SlotState::Active(device_handle) => {
                    Ok(())
                }
                _ => Err(Error::AlreadyReleased),
            },
        }
    }
}

/// Obligation to release a persistent session
///
/// Hand it to [`crate::TpmContext::release`]. Dropping it unreleased leaves
/// the device slot occupied and is reported as a leak.
#[must_use = "persistent sessions must be released through TpmContext::release"]
#[derive(Debug)]
pub struct Release {
    handle: SessionHandle,
    armed: bool,
}

impl Release {
    pub(crate) fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub(crate) fn disarm(mut self) -> SessionHandle {
        self.armed = false;
        self.handle
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if self.armed {
            if let SessionHandle::Persistent { device_handle, .. } = self.handle {
                warn!(
                    "persistent session 0x{device_handle:08x} dropped without release; slot leaked"
                );
            }
        }
    }
}
