// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command execution with authorization sessions

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{self, AuthResponse, NonceState, SessionSecrets};
use crate::config::SessionConfig;
use crate::constants::*;
use crate::crypto;
use crate::descriptor::{AuthValue, Direction, HmacDescriptor, KeyMaterial, SessionDescriptor};
use crate::device::{open_transport, TpmCommand, TpmResponse, Transport};
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, Unmarshal};
use crate::param;
use crate::session::{HmacState, Release, Session, SessionHandle, SessionManager};
use crate::types::{Entity, TpmtSymDef};

/// A command ready to be authorized and sent
///
/// Handles are added in wire order; authorized handles must precede the
/// others. Only the first parameter may be sensitive, and only if it is a
/// TPM2B.
#[derive(Debug, Clone)]
pub struct Command {
    code: TpmCc,
    handles: Vec<Entity>,
    auth_count: usize,
    parameters: Zeroizing<Vec<u8>>,
    sensitive: bool,
    response_handles: usize,
    encrypted_response: bool,
    new_auth: Option<AuthValue>,
}

impl Command {
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            auth_count: 0,
            parameters: Zeroizing::new(Vec::new()),
            sensitive: false,
            response_handles: 0,
            encrypted_response: false,
            new_auth: None,
        }
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    /// Handle that needs an authorization session
    pub fn add_auth_handle(&mut self, entity: Entity) -> Result<&mut Self> {
        if self.auth_count != self.handles.len() {
            return Err(Error::config(
                "authorized handles must precede unauthorized ones",
            ));
        }
        self.handles.push(entity);
        self.auth_count += 1;
        Ok(self)
    }

    pub fn add_handle(&mut self, entity: Entity) -> &mut Self {
        self.handles.push(entity);
        self
    }

    /// First parameter, eligible for encryption by a decrypt session
    pub fn add_sensitive(&mut self, data: &[u8]) -> Result<&mut Self> {
        if self.sensitive {
            return Err(Error::config(
                "only one parameter per command can be encrypted",
            ));
        }
        if !self.parameters.is_empty() {
            return Err(Error::config(
                "the encrypted parameter must be the first parameter",
            ));
        }
        if data.len() > usize::from(u16::MAX) {
            return Err(Error::config("parameter does not fit a TPM2B"));
        }
        self.sensitive = true;
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(data);
        self.parameters.extend_from_slice(buf.as_bytes());
        Ok(self)
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) -> &mut Self {
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(data);
        self.parameters.extend_from_slice(buf.as_bytes());
        self
    }

    pub fn add<M: Marshal>(&mut self, value: &M) -> &mut Self {
        self.parameters.extend_from_slice(&value.to_bytes());
        self
    }

    /// Number of handles the response carries before its parameters
    pub fn expect_handles(&mut self, count: usize) -> &mut Self {
        self.response_handles = count;
        self
    }

    /// The first response parameter is a TPM2B an encrypt session may protect
    pub fn expect_sensitive_response(&mut self) -> &mut Self {
        self.encrypted_response = true;
        self
    }

    /// The command replaces the auth value of its first authorized entity;
    /// the response HMAC is keyed with the new value.
    pub fn replaces_auth(&mut self, new_auth: AuthValue) -> &mut Self {
        self.new_auth = Some(new_auth);
        self
    }

    pub fn auth_count(&self) -> usize {
        self.auth_count
    }

    pub fn handles(&self) -> &[Entity] {
        &self.handles
    }
}

/// Decoded successful response
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub handles: Vec<u32>,
    pub parameters: Zeroizing<Vec<u8>>,
}

/// Session-aware TPM context
///
/// One logical channel: methods take `&mut self` and exchanges are strictly
/// sequential. Share across threads behind a `Mutex`.
pub struct TpmContext<T: Transport = Box<dyn Transport>> {
    transport: T,
    config: SessionConfig,
    manager: SessionManager,
}

impl TpmContext {
    /// Open the transport named by `config.device`
    pub fn open(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let transport = open_transport(&config)?;
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> TpmContext<T> {
    pub fn with_transport(transport: T, config: SessionConfig) -> Self {
        let manager = SessionManager::new(config.max_persistent_sessions);
        Self {
            transport,
            config,
            manager,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.manager
    }

    /// Persistent sessions started and not yet released
    pub fn active_sessions(&self) -> usize {
        self.manager.active_sessions()
    }

    fn check_descriptor(&self, descriptor: &SessionDescriptor) -> Result<()> {
        if let Some(alg) = descriptor.hash_alg() {
            if !self.config.supports_hash(alg) {
                return Err(Error::config(format!(
                    "{alg:?} is not enabled for sessions on this device"
                )));
            }
        }
        Ok(())
    }

    /// Session started inline for each exchange it takes part in
    pub fn build_session(&self, descriptor: &SessionDescriptor) -> Result<Session> {
        self.check_descriptor(descriptor)?;
        Ok(Session::new(
            descriptor.clone(),
            SessionHandle::Ephemeral,
            None,
            self.config.max_parameter_size,
        ))
    }

    /// Start a session on the device that survives across exchanges
    pub fn start_session(&mut self, descriptor: &SessionDescriptor) -> Result<(Session, Release)> {
        let SessionDescriptor::Hmac(hmac) = descriptor else {
            return Err(Error::config(
                "password authorization has no device session to start",
            ));
        };
        self.check_descriptor(descriptor)?;
        let (slot, generation) = self.manager.acquire()?;
        let state = match self.start_device_session(hmac) {
            Ok(state) => state,
            Err(e) => {
                self.manager.abandon(slot, generation);
                return Err(e);
            }
        };
        let device_handle = state.device_handle;
        self.manager.commit(slot, generation, device_handle)?;
        let handle = SessionHandle::Persistent {
            device_handle,
            slot,
            generation,
        };
        debug!(
            "persistent session 0x{device_handle:08x} in slot {slot} ({} active)",
            self.manager.active_sessions()
        );
        let session = Session::new(
            descriptor.clone(),
            handle,
            Some(state),
            self.config.max_parameter_size,
        );
        Ok((session, Release::new(handle)))
    }

    /// Flush a persistent session and free its slot
    ///
    /// If the flush fails the slot stays active and shows up in
    /// [`TpmContext::active_sessions`]; retry with [`TpmContext::release_handle`].
    pub fn release(&mut self, token: Release) -> Result<()> {
        self.release_handle(token.disarm())
    }

    /// Release by handle; a second release reports [`Error::AlreadyReleased`]
    pub fn release_handle(&mut self, handle: SessionHandle) -> Result<()> {
        let SessionHandle::Persistent {
            device_handle,
            slot,
            generation,
        } = handle
        else {
            return Err(Error::config("ephemeral sessions have nothing to release"));
        };
        self.manager.check(handle)?;
        debug!("releasing session 0x{device_handle:08x} from slot {slot}");
        match self.flush_handle(device_handle) {
            Ok(()) => {}
            Err(Error::Tpm { code, .. }) if code.base() == tpm_rc::HANDLE => {
                warn!("session 0x{device_handle:08x} was no longer loaded on the device");
            }
            Err(e) => {
                warn!("failed to flush session 0x{device_handle:08x}, slot {slot} stays active: {e}");
                return Err(e);
            }
        }
        self.manager.release(slot, generation)?;
        Ok(())
    }

    /// TPM2_FlushContext on a transient object or session handle
    pub(crate) fn flush_handle(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);
        let response = self.round_trip(&cmd.finalize())?;
        if !response.is_success() {
            return Err(Error::Tpm {
                command: TpmCc::FlushContext,
                code: response.response_code,
            });
        }
        Ok(())
    }

    fn round_trip(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let raw = self.transport.exchange(command)?;
        TpmResponse::parse(&raw)
    }

    /// TPM2_StartAuthSession for an HMAC session
    fn start_device_session(&mut self, descriptor: &HmacDescriptor) -> Result<HmacState> {
        let hash_alg = descriptor.hash_alg();
        let nonce_caller = crypto::random_bytes(descriptor.nonce_size());

        let (tpm_key, bind, bind_auth, salt, encrypted_salt) = match descriptor.key_material() {
            KeyMaterial::PlainAuth { .. } => (tpm_rh::NULL, tpm_rh::NULL, None, None, Vec::new()),
            KeyMaterial::Bound {
                bind, bind_auth, ..
            } => (tpm_rh::NULL, bind.handle, Some(bind_auth.trimmed()), None, Vec::new()),
            KeyMaterial::Salted {
                salt_key,
                salt_public,
                ..
            } => {
                // The seed is sized by the salt key's name algorithm.
                let salt = Zeroizing::new(crypto::random_bytes(salt_public.name_alg.digest_size()));
                let key = crypto::rsa_public_key(salt_public)?;
                let encrypted = crypto::rsa_oaep_encrypt(&key, salt_public.name_alg, &salt)?;
                (salt_key.handle, tpm_rh::NULL, None, Some(salt), encrypted)
            }
        };
        let symmetric = descriptor
            .encryption()
            .map_or_else(TpmtSymDef::null, |e| TpmtSymDef::aes_cfb(e.key_bits));

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_key);
        cmd.add_handle(bind);
        cmd.add_tpm2b(&nonce_caller);
        cmd.add_tpm2b(&encrypted_salt);
        cmd.add_u8(TpmSe::Hmac as u8);
        cmd.add(&symmetric);
        cmd.add_u16(hash_alg.to_u16());

        let response = self.round_trip(&cmd.finalize())?;
        if !response.is_success() {
            let code = response.response_code;
            debug!("StartAuthSession failed: {code}");
            if code.is_session_exhaustion() {
                return Err(Error::SlotExhausted);
            }
            return Err(Error::Tpm {
                command: TpmCc::StartAuthSession,
                code,
            });
        }
        let mut buf = response.data_buffer();
        let device_handle = buf.get_u32()?;
        let nonce_tpm = buf.get_tpm2b()?;
        buf.finish()?;
        if TpmHt::of(device_handle) != Some(TpmHt::HmacSession) {
            return Err(Error::protocol(format!(
                "StartAuthSession returned non-session handle 0x{device_handle:08x}"
            )));
        }

        let secrets = SessionSecrets::derive(
            hash_alg,
            bind_auth,
            salt.as_deref().map(|s| s.as_slice()),
            &nonce_tpm,
            &nonce_caller,
        )?;
        debug!(
            "started {:?} session 0x{device_handle:08x} (tpmKey 0x{tpm_key:08x}, bind 0x{bind:08x})",
            hash_alg
        );
        Ok(HmacState {
            device_handle,
            secrets,
            nonces: NonceState::new(nonce_caller, nonce_tpm),
        })
    }

    /// Authorize, send and verify one command
    ///
    /// `sessions[i]` authorizes the i-th authorized handle; sessions past the
    /// authorized handles only encrypt. Ephemeral sessions are started for
    /// this exchange and gone afterwards.
    pub fn execute(&mut self, command: &Command, sessions: &mut [&mut Session]) -> Result<Response> {
        let mut device_freed = false;
        let result = self.execute_inner(command, sessions, &mut device_freed);
        if let Err(e) = &result {
            for session in sessions.iter_mut() {
                session.abort();
                if e.poisons_session() {
                    session.poison();
                }
            }
        }
        for session in sessions.iter_mut() {
            if let Some(handle) = session.deactivate() {
                if result.is_err() && !device_freed {
                    if let Err(e) = self.flush_handle(handle) {
                        warn!("failed to flush inline session 0x{handle:08x}: {e}");
                    }
                }
            }
        }
        result
    }

    fn select_crypt_session(
        sessions: &[&mut Session],
        wanted: bool,
        pick: impl Fn(Direction) -> bool,
        what: &str,
    ) -> Result<Option<usize>> {
        if !wanted {
            return Ok(None);
        }
        let mut found = None;
        for (i, session) in sessions.iter().enumerate() {
            if session.encryption().is_some_and(|e| pick(e.direction)) {
                if found.is_some() {
                    return Err(Error::config(format!(
                        "at most one session per command may {what}"
                    )));
                }
                found = Some(i);
            }
        }
        Ok(found)
    }

    fn execute_inner(
        &mut self,
        command: &Command,
        sessions: &mut [&mut Session],
        device_freed: &mut bool,
    ) -> Result<Response> {
        let cc = command.code;
        let auth_count = command.auth_count;
        if sessions.len() > MAX_SESSIONS_PER_COMMAND {
            return Err(Error::config(format!(
                "{} sessions exceed the limit of {MAX_SESSIONS_PER_COMMAND}",
                sessions.len()
            )));
        }
        if sessions.len() < auth_count {
            return Err(Error::config(format!(
                "{cc:?} needs {auth_count} authorization sessions, got {}",
                sessions.len()
            )));
        }
        for (i, session) in sessions.iter().enumerate() {
            session.ensure_usable()?;
            self.manager.check(session.handle())?;
            if i >= auth_count && session.descriptor().is_password() {
                return Err(Error::config(
                    "password sessions can only authorize a handle",
                ));
            }
        }
        let decrypt = Self::select_crypt_session(
            sessions,
            command.sensitive,
            |d| d.decrypts_command(),
            "encrypt the command",
        )?;
        let encrypt = Self::select_crypt_session(
            sessions,
            command.encrypted_response,
            |d| d.encrypts_response(),
            "encrypt the response",
        )?;

        for session in sessions.iter_mut() {
            if let SessionDescriptor::Hmac(hmac) = session.descriptor() {
                if !session.is_persistent() && session.device_handle().is_none() {
                    let state = self.start_device_session(hmac)?;
                    session.activate(state);
                }
            }
        }

        for (i, session) in sessions.iter_mut().enumerate() {
            let target = command.handles.get(i).filter(|_| i < auth_count);
            session.prepare(target, decrypt == Some(i), encrypt == Some(i))?;
        }

        let mut parameters = command.parameters.clone();
        if let Some(d) = decrypt {
            let range = param::first_tpm2b(&parameters)?;
            sessions[d].encrypt_parameter(&mut parameters[range])?;
        }

        let names: Vec<&[u8]> = command.handles.iter().map(|e| e.name.as_slice()).collect();
        let nonce_tpm_of = |idx: Option<usize>| -> Option<Vec<u8>> {
            idx.filter(|&i| i != 0)
                .and_then(|i| sessions[i].nonces().map(|(_, tpm)| tpm.to_vec()))
        };
        let decrypt_nonce = nonce_tpm_of(decrypt);
        let encrypt_nonce = nonce_tpm_of(encrypt.filter(|&e| Some(e) != decrypt));

        let mut areas = Vec::with_capacity(sessions.len());
        for (i, session) in sessions.iter().enumerate() {
            let cp_hash = match session.descriptor().hash_alg() {
                Some(alg) => auth::cp_hash(alg, cc, &names, &parameters)?,
                None => Vec::new(),
            };
            let area = if i == 0 {
                session.authorize_with(&cp_hash, decrypt_nonce.as_deref(), encrypt_nonce.as_deref())?
            } else {
                session.authorize(&cp_hash)?
            };
            areas.push(area);
        }

        let mut cmd = if sessions.is_empty() {
            TpmCommand::new(cc)
        } else {
            TpmCommand::with_sessions(cc)
        };
        for entity in &command.handles {
            cmd.add_handle(entity.handle);
        }
        if !sessions.is_empty() {
            cmd.add_auth_areas(&areas);
        }
        cmd.add_bytes(&parameters);
        let bytes = Zeroizing::new(cmd.finalize());
        debug!(
            "{cc:?}: {} bytes, {} handles, {} sessions",
            bytes.len(),
            command.handles.len(),
            sessions.len()
        );

        let response = self.round_trip(&bytes)?;
        let code = response.response_code;
        if !response.is_success() {
            debug!("{cc:?} failed: {code}");
            if code.is_auth_failure() {
                return Err(Error::WrongSecret {
                    command: cc,
                    session: code.session().unwrap_or(1),
                    code,
                });
            }
            if code.is_session_exhaustion() {
                return Err(Error::SlotExhausted);
            }
            return Err(Error::Tpm { command: cc, code });
        }
        *device_freed = true;

        let expected_tag = if sessions.is_empty() {
            TpmSt::NoSessions
        } else {
            TpmSt::Sessions
        };
        if response.tag != expected_tag {
            return Err(Error::protocol(format!(
                "{cc:?} answered with tag {:?}",
                response.tag
            )));
        }
        let mut buf = response.data_buffer();
        let mut handles = Vec::with_capacity(command.response_handles);
        for _ in 0..command.response_handles {
            handles.push(buf.get_u32()?);
        }
        let mut out_params = if sessions.is_empty() {
            Zeroizing::new(buf.get_remaining())
        } else {
            let size = buf.get_u32()? as usize;
            Zeroizing::new(buf.get_bytes(size)?)
        };
        let mut auth_responses = Vec::with_capacity(sessions.len());
        for _ in 0..sessions.len() {
            auth_responses.push(AuthResponse::unmarshal(&mut buf)?);
        }
        buf.finish()?;

        for (i, (session, auth)) in sessions.iter_mut().zip(&auth_responses).enumerate() {
            let rp_hash = match session.descriptor().hash_alg() {
                Some(alg) => auth::rp_hash(alg, code.0, cc, &out_params)?,
                None => Vec::new(),
            };
            let new_auth = command.new_auth.as_ref().filter(|_| i == 0);
            session.verify_response(&rp_hash, auth, new_auth)?;
        }

        if let Some(e) = encrypt {
            let range = param::first_tpm2b(&out_params)?;
            sessions[e].decrypt_parameter(&mut out_params[range])?;
        }

        Ok(Response {
            handles,
            parameters: out_params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_parameter_must_be_first() {
        let mut cmd = Command::new(TpmCc::Create);
        cmd.add_tpm2b(b"first");
        assert!(matches!(
            cmd.add_sensitive(b"secret"),
            Err(Error::Configuration(_))
        ));

        let mut cmd = Command::new(TpmCc::Create);
        cmd.add_sensitive(b"secret").unwrap();
        assert!(matches!(
            cmd.add_sensitive(b"again"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_auth_handles_come_first() {
        let mut cmd = Command::new(TpmCc::NvUndefineSpace);
        cmd.add_auth_handle(Entity::owner()).unwrap();
        cmd.add_handle(Entity::permanent(0x01000001));
        assert!(cmd.add_auth_handle(Entity::platform()).is_err());
        assert_eq!(cmd.auth_count(), 1);
        assert_eq!(cmd.handles().len(), 2);
    }
}
