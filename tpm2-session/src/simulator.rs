// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM 2.0 simulator
//!
//! Implements enough of the command set to drive authorization sessions end
//! to end: session start with bind and salt, HMAC and password checks,
//! parameter encryption in both directions, and the object, hierarchy and NV
//! commands used by [`crate::TpmContext`]. All state lives in memory.
//!
//! Every command and response frame is kept in a wire log so tests can check
//! what actually crossed the "bus".

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::auth::{self, AuthArea, AuthResponse, CommandNonces, SessionSecrets};
use crate::constants::*;
use crate::crypto;
use crate::descriptor::AuthValue;
use crate::device::Transport;
use crate::error::Result;
use crate::marshal::*;
use crate::param::{self, ParameterCipher};
use crate::types::*;

/// Loaded HMAC sessions the simulated TPM can hold
pub const SESSION_SLOTS: usize = 4;
const OBJECT_SLOTS: usize = 8;
const NV_SLOTS: usize = 16;
const MAX_COMMAND_SIZE: usize = 4096;
const MAX_AUTH_SIZE: usize = 64;

type SimResult<T> = std::result::Result<T, ResponseCode>;

trait OrCode<T> {
    fn or_code(self, code: ResponseCode) -> SimResult<T>;
}

impl<T> OrCode<T> for Result<T> {
    fn or_code(self, code: ResponseCode) -> SimResult<T> {
        self.map_err(|_| code)
    }
}

fn failure() -> ResponseCode {
    ResponseCode(tpm_rc::FAILURE)
}

fn insufficient() -> ResponseCode {
    ResponseCode(tpm_rc::INSUFFICIENT)
}

/// RSA keys by (bits, index), shared by every simulator in the process
///
/// Primaries use one index per hierarchy so they come out the same each
/// time, like keys derived from a fixed seed.
fn rsa_key(bits: u16, index: u32) -> SimResult<RsaPrivateKey> {
    static KEYS: OnceLock<Mutex<HashMap<(u16, u32), RsaPrivateKey>>> = OnceLock::new();
    let mut keys = KEYS
        .get_or_init(Default::default)
        .lock()
        .map_err(|_| failure())?;
    if let Some(key) = keys.get(&(bits, index)) {
        return Ok(key.clone());
    }
    let key = RsaPrivateKey::new(&mut OsRng, usize::from(bits)).map_err(|_| failure())?;
    keys.insert((bits, index), key.clone());
    Ok(key)
}

fn primary_key_index(hierarchy: u32) -> u32 {
    match hierarchy {
        tpm_rh::OWNER => 0,
        tpm_rh::ENDORSEMENT => 1,
        tpm_rh::PLATFORM => 2,
        _ => 3,
    }
}

/// (handles, authorized handles) of each command
fn shape(cc: TpmCc) -> (usize, usize) {
    match cc {
        TpmCc::NvUndefineSpace => (2, 1),
        TpmCc::HierarchyChangeAuth
        | TpmCc::NvDefineSpace
        | TpmCc::CreatePrimary
        | TpmCc::Create
        | TpmCc::Load
        | TpmCc::Unseal => (1, 1),
        TpmCc::NvReadPublic | TpmCc::ReadPublic => (1, 0),
        TpmCc::StartAuthSession => (2, 0),
        TpmCc::FlushContext => (0, 0),
    }
}

fn first_parameter_is_tpm2b(cc: TpmCc) -> bool {
    matches!(
        cc,
        TpmCc::CreatePrimary
            | TpmCc::Create
            | TpmCc::Load
            | TpmCc::HierarchyChangeAuth
            | TpmCc::NvDefineSpace
    )
}

fn first_response_is_tpm2b(cc: TpmCc) -> bool {
    matches!(
        cc,
        TpmCc::CreatePrimary
            | TpmCc::Create
            | TpmCc::Load
            | TpmCc::Unseal
            | TpmCc::ReadPublic
            | TpmCc::NvReadPublic
    )
}

fn is_session_hash(alg: TpmAlgId) -> bool {
    matches!(alg, TpmAlgId::Sha256 | TpmAlgId::Sha384 | TpmAlgId::Sha512)
}

#[derive(Clone)]
struct Object {
    public: TpmtPublic,
    public_area: Vec<u8>,
    name: Vec<u8>,
    auth: AuthValue,
    data: Zeroizing<Vec<u8>>,
    key: Option<RsaPrivateKey>,
}

struct Blob {
    parent_name: Vec<u8>,
    object: Object,
}

struct NvIndex {
    public: TpmsNvPublic,
    name: Vec<u8>,
    auth: AuthValue,
}

struct SimSession {
    hash_alg: TpmAlgId,
    secrets: SessionSecrets,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
    bind_name: Option<Vec<u8>>,
    symmetric: TpmtSymDef,
}

struct EntityRef<'a> {
    name: Vec<u8>,
    auth: &'a AuthValue,
    no_da: bool,
}

impl EntityRef<'_> {
    fn auth_failure(&self) -> u32 {
        if self.no_da {
            tpm_rc::BAD_AUTH
        } else {
            tpm_rc::AUTH_FAIL
        }
    }
}

/// One checked authorization entry of the command being executed
struct Checked {
    area: AuthArea,
    /// Session table index; `None` for a password entry
    slot: Option<usize>,
    target: Option<u32>,
    include_auth: bool,
    key: Zeroizing<Vec<u8>>,
}

#[derive(Default)]
struct Reply {
    handles: Vec<u32>,
    params: Zeroizing<Vec<u8>>,
}

impl Reply {
    fn new(params: CommandBuffer) -> Self {
        Self {
            handles: Vec::new(),
            params: Zeroizing::new(params.into_vec()),
        }
    }

    fn with_handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }
}

/// Simulated TPM reachable through [`Transport`]
pub struct Simulator {
    hierarchies: HashMap<u32, AuthValue>,
    objects: HashMap<u32, Object>,
    next_object: u32,
    blobs: HashMap<Vec<u8>, Blob>,
    children: u32,
    sessions: Vec<Option<SimSession>>,
    nv: HashMap<u32, NvIndex>,
    wire_log: Vec<Vec<u8>>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Fresh TPM with empty hierarchy auth values
    pub fn new() -> Self {
        let hierarchies = [tpm_rh::OWNER, tpm_rh::ENDORSEMENT, tpm_rh::PLATFORM, tpm_rh::NULL]
            .into_iter()
            .map(|h| (h, AuthValue::empty()))
            .collect();
        Self {
            hierarchies,
            objects: HashMap::new(),
            next_object: 0,
            blobs: HashMap::new(),
            children: 0,
            sessions: (0..SESSION_SLOTS).map(|_| None).collect(),
            nv: HashMap::new(),
            wire_log: Vec::new(),
        }
    }

    /// Preset the auth value of a hierarchy; unknown handles are ignored
    pub fn with_hierarchy_auth(mut self, hierarchy: u32, auth: impl Into<AuthValue>) -> Self {
        if let Some(value) = self.hierarchies.get_mut(&hierarchy) {
            *value = auth.into();
        }
        self
    }

    /// Every command and response frame exchanged so far, in order
    pub fn wire_log(&self) -> &[Vec<u8>] {
        &self.wire_log
    }

    pub fn clear_wire_log(&mut self) {
        self.wire_log.clear();
    }

    /// Whether `needle` appears anywhere in the wire log
    pub fn wire_contains(&self, needle: &[u8]) -> bool {
        !needle.is_empty()
            && self
                .wire_log
                .iter()
                .any(|frame| frame.windows(needle.len()).any(|w| w == needle))
    }

    /// HMAC sessions currently held by the simulated TPM
    pub fn loaded_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn loaded_objects(&self) -> usize {
        self.objects.len()
    }

    fn session_slot(&self, handle: u32) -> Option<usize> {
        let slot = handle.checked_sub(TpmHt::HmacSession.first_handle())? as usize;
        self.sessions.get(slot)?.as_ref().map(|_| slot)
    }

    fn session(&self, slot: usize) -> SimResult<&SimSession> {
        self.sessions
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(failure)
    }

    fn entity(&self, handle: u32) -> Option<EntityRef<'_>> {
        match TpmHt::of(handle)? {
            TpmHt::Permanent => self.hierarchies.get(&handle).map(|auth| EntityRef {
                name: handle.to_be_bytes().to_vec(),
                auth,
                no_da: false,
            }),
            TpmHt::Transient => self.objects.get(&handle).map(|o| EntityRef {
                name: o.name.clone(),
                auth: &o.auth,
                no_da: o.public.object_attributes.contains(TpmaObject::NO_DA),
            }),
            TpmHt::NvIndex => self.nv.get(&handle).map(|n| EntityRef {
                name: n.name.clone(),
                auth: &n.auth,
                no_da: n.public.attributes.0 & TpmaNv::NO_DA != 0,
            }),
            _ => None,
        }
    }

    fn dispatch(&mut self, command: &[u8]) -> SimResult<Vec<u8>> {
        if command.len() > MAX_COMMAND_SIZE {
            return Err(ResponseCode(tpm_rc::COMMAND_SIZE));
        }
        let mut buf = ResponseBuffer::new(command);
        let header_error = ResponseCode(tpm_rc::COMMAND_SIZE);
        let tag = TpmSt::from_u16(buf.get_u16().or_code(header_error)?)
            .filter(|t| *t != TpmSt::Creation)
            .ok_or(ResponseCode(tpm_rc::BAD_TAG))?;
        if buf.get_u32().or_code(header_error)? as usize != command.len() {
            return Err(header_error);
        }
        let cc = TpmCc::from_u32(buf.get_u32().or_code(header_error)?)
            .ok_or(ResponseCode(tpm_rc::COMMAND_CODE))?;
        let (handle_count, auth_count) = shape(cc);

        let mut handles = Vec::with_capacity(handle_count);
        for _ in 0..handle_count {
            handles.push(buf.get_u32().or_code(insufficient())?);
        }

        let mut areas = Vec::new();
        if tag == TpmSt::Sessions {
            if matches!(cc, TpmCc::StartAuthSession | TpmCc::FlushContext) {
                return Err(ResponseCode(tpm_rc::AUTH_CONTEXT));
            }
            let auth_error = ResponseCode(tpm_rc::AUTHSIZE);
            let size = buf.get_u32().or_code(auth_error)? as usize;
            let mut auth_buf = ResponseBuffer::new(buf.get_slice(size).or_code(auth_error)?);
            while auth_buf.remaining() > 0 {
                areas.push(AuthArea::unmarshal(&mut auth_buf).or_code(auth_error)?);
            }
            if areas.is_empty() || areas.len() > MAX_SESSIONS_PER_COMMAND {
                return Err(auth_error);
            }
        }
        if areas.len() < auth_count {
            return Err(ResponseCode(tpm_rc::AUTH_MISSING));
        }
        let mut params = Zeroizing::new(buf.get_remaining());
        trace!(
            "simulator: {cc:?} with {} handles, {} sessions, {} parameter bytes",
            handles.len(),
            areas.len(),
            params.len()
        );

        let checked = self.check_sessions(cc, &handles, areas, auth_count, &params)?;
        let decrypt = checked
            .iter()
            .position(|c| c.area.attributes.contains(TpmaSa::DECRYPT));
        let encrypt = checked
            .iter()
            .position(|c| c.area.attributes.contains(TpmaSa::ENCRYPT));
        if let Some(d) = decrypt {
            let range = param::first_tpm2b(&params)
                .or_code(ResponseCode::for_parameter(tpm_rc::SIZE, 1))?;
            self.command_cipher(&checked[d])?
                .decrypt(&mut params[range])
                .or_code(failure())?;
        }

        let mut reply = self.execute(cc, &handles, &params)?;
        if checked.is_empty() {
            return Ok(frame(TpmSt::NoSessions, &reply, &[]));
        }

        let new_nonces = checked
            .iter()
            .map(|c| match c.slot {
                Some(slot) => self.session(slot).map(|s| {
                    let mut nonce = crypto::random_bytes(s.hash_alg.digest_size());
                    while nonce == s.nonce_tpm {
                        nonce = crypto::random_bytes(s.hash_alg.digest_size());
                    }
                    nonce
                }),
                None => Ok(Vec::new()),
            })
            .collect::<SimResult<Vec<_>>>()?;
        if let Some(e) = encrypt {
            let range = param::first_tpm2b(&reply.params).or_code(failure())?;
            self.response_cipher(&checked[e], &new_nonces[e])?
                .encrypt(&mut reply.params[range])
                .or_code(failure())?;
        }

        let mut auth_responses = Vec::with_capacity(checked.len());
        for (c, nonce_tpm) in checked.iter().zip(&new_nonces) {
            let Some(slot) = c.slot else {
                auth_responses.push(AuthResponse {
                    nonce: Vec::new(),
                    attributes: c.area.attributes,
                    hmac: Vec::new(),
                });
                continue;
            };
            let session = self.session(slot)?;
            let rp_hash =
                auth::rp_hash(session.hash_alg, tpm_rc::SUCCESS, cc, &reply.params).or_code(failure())?;
            // An auth value changed by the command keys the response.
            let key = match (c.include_auth, c.target.and_then(|t| self.entity(t))) {
                (true, Some(entity)) => session.secrets.hmac_key(Some(entity.auth.trimmed())),
                _ => c.key.clone(),
            };
            let hmac = session
                .secrets
                .response_hmac(&key, &rp_hash, nonce_tpm, &c.area.nonce, c.area.attributes)
                .or_code(failure())?;
            auth_responses.push(AuthResponse {
                nonce: nonce_tpm.clone(),
                attributes: c.area.attributes,
                hmac,
            });
        }

        for (c, nonce_tpm) in checked.iter().zip(new_nonces) {
            let Some(slot) = c.slot else { continue };
            if !c.area.attributes.contains(TpmaSa::CONTINUE_SESSION) {
                trace!("simulator: session 0x{:08x} closed", c.area.session_handle);
                self.sessions[slot] = None;
            } else if let Some(session) = self.sessions[slot].as_mut() {
                session.nonce_caller = c.area.nonce.clone();
                session.nonce_tpm = nonce_tpm;
            }
        }
        Ok(frame(TpmSt::Sessions, &reply, &auth_responses))
    }

    fn check_sessions(
        &self,
        cc: TpmCc,
        handles: &[u32],
        areas: Vec<AuthArea>,
        auth_count: usize,
        params: &[u8],
    ) -> SimResult<Vec<Checked>> {
        if areas.is_empty() {
            return Ok(Vec::new());
        }
        let mut names = Vec::with_capacity(handles.len());
        for (i, &handle) in handles.iter().enumerate() {
            let entity = self
                .entity(handle)
                .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, i as u8 + 1))?;
            names.push(entity.name);
        }
        let names: Vec<&[u8]> = names.iter().map(Vec::as_slice).collect();

        let mut decrypt = None;
        let mut encrypt = None;
        let mut slots = Vec::with_capacity(areas.len());
        for (i, area) in areas.iter().enumerate() {
            let n = i as u8 + 1;
            let attrs = area.attributes;
            if attrs.contains(TpmaSa::DECRYPT) {
                if decrypt.is_some() || !first_parameter_is_tpm2b(cc) {
                    return Err(ResponseCode::for_session(tpm_rc::ATTRIBUTES, n));
                }
                decrypt = Some(i);
            }
            if attrs.contains(TpmaSa::ENCRYPT) {
                if encrypt.is_some() || !first_response_is_tpm2b(cc) {
                    return Err(ResponseCode::for_session(tpm_rc::ATTRIBUTES, n));
                }
                encrypt = Some(i);
            }
            if area.session_handle == tpm_rh::PW {
                if i >= auth_count {
                    return Err(ResponseCode::for_session(tpm_rc::VALUE, n));
                }
                if !area.nonce.is_empty() {
                    return Err(ResponseCode::for_session(tpm_rc::SIZE, n));
                }
                if attrs.contains(TpmaSa::DECRYPT) || attrs.contains(TpmaSa::ENCRYPT) {
                    return Err(ResponseCode::for_session(tpm_rc::ATTRIBUTES, n));
                }
                slots.push(None);
                continue;
            }
            let slot = self
                .session_slot(area.session_handle)
                .ok_or(ResponseCode::for_session(tpm_rc::HANDLE, n))?;
            let session = self.session(slot)?;
            let digest_size = session.hash_alg.digest_size();
            if !(MIN_NONCE_SIZE..=digest_size).contains(&area.nonce.len()) {
                return Err(ResponseCode::for_session(tpm_rc::SIZE, n));
            }
            if (attrs.contains(TpmaSa::DECRYPT) || attrs.contains(TpmaSa::ENCRYPT))
                && session.symmetric.is_null()
            {
                return Err(ResponseCode::for_session(tpm_rc::SYMMETRIC, n));
            }
            slots.push(Some(slot));
        }

        let extra_nonce = |idx: Option<usize>| -> SimResult<Option<&[u8]>> {
            match idx.filter(|&i| i != 0).and_then(|i| slots[i]) {
                Some(slot) => Ok(Some(self.session(slot)?.nonce_tpm.as_slice())),
                None => Ok(None),
            }
        };
        let decrypt_nonce = extra_nonce(decrypt)?;
        let encrypt_nonce = extra_nonce(encrypt.filter(|&e| Some(e) != decrypt))?;

        let mut checked = Vec::with_capacity(areas.len());
        for (i, area) in areas.into_iter().enumerate() {
            let n = i as u8 + 1;
            let target = handles.get(i).copied().filter(|_| i < auth_count);
            let entity = target.and_then(|t| self.entity(t));
            let Some(slot) = slots[i] else {
                let entity = entity.ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, n))?;
                let presented = AuthValue::new(area.hmac.as_slice());
                if !crypto::verify_mac(entity.auth.trimmed(), presented.trimmed()) {
                    debug!("simulator: {cc:?} password mismatch in session #{n}");
                    return Err(ResponseCode::for_session(entity.auth_failure(), n));
                }
                checked.push(Checked {
                    area,
                    slot: None,
                    target,
                    include_auth: true,
                    key: Zeroizing::new(Vec::new()),
                });
                continue;
            };
            let session = self.session(slot)?;
            let include_auth = match (&entity, &session.bind_name) {
                (None, _) => false,
                (Some(e), Some(bind)) => e.name != *bind,
                (Some(_), None) => true,
            };
            let key = session
                .secrets
                .hmac_key(entity.as_ref().filter(|_| include_auth).map(|e| e.auth.trimmed()));
            let failure_code = entity
                .as_ref()
                .map_or(tpm_rc::AUTH_FAIL, EntityRef::auth_failure);

            if target.is_some() || !area.hmac.is_empty() {
                let cp_hash =
                    auth::cp_hash(session.hash_alg, cc, &names, params).or_code(failure())?;
                let expected = session
                    .secrets
                    .command_hmac(
                        &key,
                        &cp_hash,
                        CommandNonces {
                            caller: &area.nonce,
                            tpm: &session.nonce_tpm,
                            decrypt: decrypt_nonce.filter(|_| i == 0),
                            encrypt: encrypt_nonce.filter(|_| i == 0),
                        },
                        area.attributes,
                    )
                    .or_code(failure())?;
                if !crypto::verify_mac(&expected, &area.hmac) {
                    debug!("simulator: {cc:?} HMAC mismatch in session #{n}");
                    return Err(ResponseCode::for_session(failure_code, n));
                }
            }
            checked.push(Checked {
                area,
                slot: Some(slot),
                target,
                include_auth,
                key,
            });
        }
        Ok(checked)
    }

    fn command_cipher(&self, checked: &Checked) -> SimResult<ParameterCipher> {
        let slot = checked.slot.ok_or_else(failure)?;
        let session = self.session(slot)?;
        ParameterCipher::derive(
            session.hash_alg,
            &checked.key,
            session.symmetric.key_bits,
            &checked.area.nonce,
            &session.nonce_tpm,
        )
        .or_code(failure())
    }

    fn response_cipher(&self, checked: &Checked, nonce_tpm: &[u8]) -> SimResult<ParameterCipher> {
        let slot = checked.slot.ok_or_else(failure)?;
        let session = self.session(slot)?;
        ParameterCipher::derive(
            session.hash_alg,
            &checked.key,
            session.symmetric.key_bits,
            nonce_tpm,
            &checked.area.nonce,
        )
        .or_code(failure())
    }

    fn execute(&mut self, cc: TpmCc, handles: &[u32], params: &[u8]) -> SimResult<Reply> {
        let mut buf = ResponseBuffer::new(params);
        let reply = match cc {
            TpmCc::StartAuthSession => self.start_auth_session(handles, &mut buf)?,
            TpmCc::CreatePrimary => self.create_primary(handles[0], &mut buf)?,
            TpmCc::Create => self.create(handles[0], &mut buf)?,
            TpmCc::Load => self.load(handles[0], &mut buf)?,
            TpmCc::Unseal => self.unseal(handles[0])?,
            TpmCc::ReadPublic => self.read_public(handles[0])?,
            TpmCc::FlushContext => self.flush_context(&mut buf)?,
            TpmCc::HierarchyChangeAuth => self.hierarchy_change_auth(handles[0], &mut buf)?,
            TpmCc::NvDefineSpace => self.nv_define_space(handles[0], &mut buf)?,
            TpmCc::NvUndefineSpace => self.nv_undefine_space(handles[0], handles[1])?,
            TpmCc::NvReadPublic => self.nv_read_public(handles[0])?,
        };
        buf.finish().or_code(ResponseCode(tpm_rc::SIZE))?;
        Ok(reply)
    }

    // ==================== Sessions ====================

    fn start_auth_session(&mut self, handles: &[u32], buf: &mut ResponseBuffer) -> SimResult<Reply> {
        let (tpm_key, bind) = (handles[0], handles[1]);
        let nonce_caller = buf
            .get_tpm2b()
            .or_code(ResponseCode::for_parameter(tpm_rc::SIZE, 1))?;
        let encrypted_salt = buf
            .get_tpm2b()
            .or_code(ResponseCode::for_parameter(tpm_rc::SIZE, 2))?;
        let session_type = buf.get_u8().or_code(insufficient())?;
        let symmetric = TpmtSymDef::unmarshal(buf)
            .or_code(ResponseCode::for_parameter(tpm_rc::SYMMETRIC, 4))?;
        let auth_hash = buf.get_u16().or_code(insufficient())?;

        if TpmSe::from_u8(session_type) != Some(TpmSe::Hmac) {
            return Err(ResponseCode::for_parameter(tpm_rc::VALUE, 3));
        }
        let hash_alg = TpmAlgId::from_u16(auth_hash)
            .filter(|a| is_session_hash(*a))
            .ok_or(ResponseCode::for_parameter(tpm_rc::HASH, 5))?;
        if !(MIN_NONCE_SIZE..=hash_alg.digest_size()).contains(&nonce_caller.len()) {
            return Err(ResponseCode::for_parameter(tpm_rc::SIZE, 1));
        }
        if !symmetric.is_null()
            && (symmetric.algorithm != TpmAlgId::Aes
                || symmetric.mode != TpmAlgId::Cfb
                || !matches!(symmetric.key_bits, 128 | 192 | 256))
        {
            return Err(ResponseCode::for_parameter(tpm_rc::SYMMETRIC, 4));
        }
        let slot = self
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(ResponseCode(tpm_rc::SESSION_MEMORY))?;

        let salt = if tpm_key == tpm_rh::NULL {
            if !encrypted_salt.is_empty() {
                return Err(ResponseCode::for_parameter(tpm_rc::VALUE, 2));
            }
            None
        } else {
            let object = self
                .objects
                .get(&tpm_key)
                .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 1))?;
            let key = object
                .key
                .as_ref()
                .filter(|_| object.public.object_attributes.contains(TpmaObject::DECRYPT))
                .ok_or(ResponseCode::for_handle(tpm_rc::TYPE, 1))?;
            let salt = crypto::rsa_oaep_decrypt(key, object.public.name_alg, &encrypted_salt)
                .or_code(ResponseCode::for_parameter(tpm_rc::VALUE, 2))?;
            if salt.len() > object.public.name_alg.digest_size() {
                return Err(ResponseCode::for_parameter(tpm_rc::VALUE, 2));
            }
            Some(salt)
        };
        let (bind_auth, bind_name) = if bind == tpm_rh::NULL {
            (None, None)
        } else {
            let entity = self
                .entity(bind)
                .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 2))?;
            (Some(Zeroizing::new(entity.auth.trimmed().to_vec())), Some(entity.name))
        };

        let nonce_tpm = crypto::random_bytes(hash_alg.digest_size());
        let secrets = SessionSecrets::derive(
            hash_alg,
            bind_auth.as_deref().map(|a| a.as_slice()),
            salt.as_deref().map(|s| s.as_slice()),
            &nonce_tpm,
            &nonce_caller,
        )
        .or_code(failure())?;
        let handle = TpmHt::HmacSession.first_handle() + slot as u32;
        debug!(
            "simulator: started session 0x{handle:08x} ({hash_alg:?}, salted: {}, bound: {})",
            salt.is_some(),
            bind_name.is_some()
        );
        self.sessions[slot] = Some(SimSession {
            hash_alg,
            secrets,
            nonce_caller,
            nonce_tpm: nonce_tpm.clone(),
            bind_name,
            symmetric,
        });

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&nonce_tpm);
        Ok(Reply::new(out).with_handle(handle))
    }

    fn flush_context(&mut self, buf: &mut ResponseBuffer) -> SimResult<Reply> {
        let handle = buf.get_u32().or_code(insufficient())?;
        let flushed = match TpmHt::of(handle) {
            Some(TpmHt::Transient) => self.objects.remove(&handle).is_some(),
            Some(TpmHt::HmacSession) => match self.session_slot(handle) {
                Some(slot) => self.sessions[slot].take().is_some(),
                None => false,
            },
            _ => false,
        };
        if !flushed {
            return Err(ResponseCode::for_parameter(tpm_rc::HANDLE, 1));
        }
        trace!("simulator: flushed 0x{handle:08x}");
        Ok(Reply::default())
    }

    // ==================== Objects ====================

    fn parse_create_input(
        buf: &mut ResponseBuffer,
    ) -> SimResult<(Tpm2bSensitiveCreate, TpmtPublic)> {
        let sensitive = Tpm2bSensitiveCreate::unmarshal(buf)
            .or_code(ResponseCode::for_parameter(tpm_rc::SIZE, 1))?;
        let template = Tpm2bPublic::unmarshal(buf)
            .and_then(|p| p.parse())
            .or_code(ResponseCode::for_parameter(tpm_rc::VALUE, 2))?;
        let _outside_info = buf.get_tpm2b().or_code(insufficient())?;
        let selections = buf.get_u32().or_code(insufficient())?;
        for _ in 0..selections {
            let _hash = buf.get_u16().or_code(insufficient())?;
            let size = buf.get_u8().or_code(insufficient())?;
            buf.skip(usize::from(size)).or_code(insufficient())?;
        }
        Ok((sensitive, template))
    }

    fn instantiate(
        mut template: TpmtPublic,
        sensitive: Tpm2bSensitiveCreate,
        key_index: u32,
    ) -> SimResult<Object> {
        if !template.name_alg.is_hash() || template.name_alg == TpmAlgId::Sha1 {
            return Err(ResponseCode::for_parameter(tpm_rc::HASH, 2));
        }
        if sensitive.user_auth.len() > template.name_alg.digest_size() {
            return Err(ResponseCode::for_parameter(tpm_rc::SIZE, 1));
        }
        let key = match &template.parameters {
            TpmtPublicParms::Rsa(parms) => {
                if !matches!(parms.key_bits, 1024 | 2048) {
                    return Err(ResponseCode::for_parameter(tpm_rc::KEY_SIZE, 2));
                }
                if !matches!(parms.exponent, 0 | 65537) {
                    return Err(ResponseCode::for_parameter(tpm_rc::VALUE, 2));
                }
                if !sensitive.data.is_empty() {
                    return Err(ResponseCode::for_parameter(tpm_rc::SIZE, 1));
                }
                let key = rsa_key(parms.key_bits, key_index)?;
                template.unique = TpmtPublicUnique::Rsa(crypto::rsa_modulus(&key));
                Some(key)
            }
            TpmtPublicParms::KeyedHash => {
                if sensitive.data.len() > MAX_SYM_DATA {
                    return Err(ResponseCode::for_parameter(tpm_rc::SIZE, 1));
                }
                let seed = crypto::random_bytes(template.name_alg.digest_size());
                let unique = crypto::digest(template.name_alg, &[&seed, &sensitive.data])
                    .or_code(failure())?;
                template.unique = TpmtPublicUnique::KeyedHash(unique);
                None
            }
        };
        let public_area = template.to_bytes();
        let name = compute_name(template.name_alg, &public_area).or_code(failure())?;
        Ok(Object {
            public: template,
            public_area,
            name,
            auth: AuthValue::new(sensitive.user_auth.as_slice()),
            data: sensitive.data,
            key,
        })
    }

    fn load_object(&mut self, object: Object) -> SimResult<u32> {
        if self.objects.len() >= OBJECT_SLOTS {
            return Err(ResponseCode(tpm_rc::OBJECT_MEMORY));
        }
        let handle = TpmHt::Transient.first_handle() + self.next_object;
        self.next_object += 1;
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn put_creation_info(out: &mut CommandBuffer) -> SimResult<()> {
        out.put_tpm2b_empty(); // creationData
        let creation_hash = crypto::digest(TpmAlgId::Sha256, &[]).or_code(failure())?;
        out.put_tpm2b(&creation_hash);
        TpmtTkCreation::null().marshal(out);
        Ok(())
    }

    fn create_primary(&mut self, hierarchy: u32, buf: &mut ResponseBuffer) -> SimResult<Reply> {
        if !self.hierarchies.contains_key(&hierarchy) {
            return Err(ResponseCode::for_handle(tpm_rc::VALUE, 1));
        }
        let (sensitive, template) = Self::parse_create_input(buf)?;
        if template.rsa_parms().is_none() {
            return Err(ResponseCode::for_parameter(tpm_rc::TYPE, 2));
        }
        let object = Self::instantiate(template, sensitive, primary_key_index(hierarchy))?;
        let public_area = object.public_area.clone();
        let name = object.name.clone();
        let handle = self.load_object(object)?;
        debug!("simulator: primary 0x{handle:08x} under 0x{hierarchy:08x}");

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&public_area);
        Self::put_creation_info(&mut out)?;
        out.put_tpm2b(&name);
        Ok(Reply::new(out).with_handle(handle))
    }

    fn storage_parent(&self, parent: u32) -> SimResult<&Object> {
        let object = self
            .objects
            .get(&parent)
            .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 1))?;
        let storage = TpmaObject::RESTRICTED | TpmaObject::DECRYPT;
        if object.key.is_none() || !object.public.object_attributes.contains(storage) {
            return Err(ResponseCode::for_handle(tpm_rc::TYPE, 1));
        }
        Ok(object)
    }

    fn create(&mut self, parent: u32, buf: &mut ResponseBuffer) -> SimResult<Reply> {
        let parent_name = self.storage_parent(parent)?.name.clone();
        let (sensitive, template) = Self::parse_create_input(buf)?;
        let key_index = 4 + self.children;
        let object = Self::instantiate(template, sensitive, key_index)?;
        if object.key.is_some() {
            self.children += 1;
        }
        let public_area = object.public_area.clone();
        let blob_id = crypto::random_bytes(32);
        self.blobs.insert(
            blob_id.clone(),
            Blob {
                parent_name,
                object,
            },
        );

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&blob_id);
        out.put_tpm2b(&public_area);
        Self::put_creation_info(&mut out)?;
        Ok(Reply::new(out))
    }

    fn load(&mut self, parent: u32, buf: &mut ResponseBuffer) -> SimResult<Reply> {
        let parent_name = self.storage_parent(parent)?.name.clone();
        let private = buf.get_tpm2b().or_code(insufficient())?;
        let public = buf.get_tpm2b().or_code(insufficient())?;
        let blob = self
            .blobs
            .get(&private)
            .ok_or(ResponseCode::for_parameter(tpm_rc::INTEGRITY, 1))?;
        if blob.parent_name != parent_name {
            return Err(ResponseCode::for_parameter(tpm_rc::INTEGRITY, 1));
        }
        if blob.object.public_area != public {
            return Err(ResponseCode::for_parameter(tpm_rc::INTEGRITY, 2));
        }
        let object = blob.object.clone();
        let name = object.name.clone();
        let handle = self.load_object(object)?;

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&name);
        Ok(Reply::new(out).with_handle(handle))
    }

    fn unseal(&self, item: u32) -> SimResult<Reply> {
        let object = self
            .objects
            .get(&item)
            .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 1))?;
        if object.public.type_alg != TpmAlgId::KeyedHash {
            return Err(ResponseCode::for_handle(tpm_rc::TYPE, 1));
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&object.data);
        Ok(Reply::new(out))
    }

    fn read_public(&self, handle: u32) -> SimResult<Reply> {
        let object = self
            .objects
            .get(&handle)
            .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 1))?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&object.public_area);
        out.put_tpm2b(&object.name);
        out.put_tpm2b(&object.name); // qualifiedName
        Ok(Reply::new(out))
    }

    // ==================== Hierarchies and NV ====================

    fn hierarchy_change_auth(&mut self, hierarchy: u32, buf: &mut ResponseBuffer) -> SimResult<Reply> {
        let new_auth = Zeroizing::new(buf.get_tpm2b().or_code(insufficient())?);
        if new_auth.len() > MAX_AUTH_SIZE {
            return Err(ResponseCode::for_parameter(tpm_rc::SIZE, 1));
        }
        match self.hierarchies.get_mut(&hierarchy) {
            Some(auth) if hierarchy != tpm_rh::NULL => *auth = AuthValue::new(new_auth.as_slice()),
            _ => return Err(ResponseCode::for_handle(tpm_rc::VALUE, 1)),
        }
        debug!("simulator: auth of hierarchy 0x{hierarchy:08x} changed");
        Ok(Reply::default())
    }

    fn nv_define_space(&mut self, auth_handle: u32, buf: &mut ResponseBuffer) -> SimResult<Reply> {
        if !matches!(auth_handle, tpm_rh::OWNER | tpm_rh::PLATFORM) {
            return Err(ResponseCode::for_handle(tpm_rc::VALUE, 1));
        }
        let auth = Zeroizing::new(buf.get_tpm2b().or_code(insufficient())?);
        let public = Tpm2bNvPublic::unmarshal(buf)
            .or_code(ResponseCode::for_parameter(tpm_rc::SIZE, 2))?
            .nv_public;
        let index = public.nv_index;
        if TpmHt::of(index) != Some(TpmHt::NvIndex) || !public.name_alg.is_hash() {
            return Err(ResponseCode::for_parameter(tpm_rc::VALUE, 2));
        }
        if auth.len() > public.name_alg.digest_size() {
            return Err(ResponseCode::for_parameter(tpm_rc::SIZE, 1));
        }
        if self.nv.contains_key(&index) {
            return Err(ResponseCode(tpm_rc::NV_DEFINED));
        }
        if self.nv.len() >= NV_SLOTS {
            return Err(ResponseCode(tpm_rc::NV_SPACE));
        }
        let name = public.name().or_code(failure())?;
        self.nv.insert(
            index,
            NvIndex {
                public,
                name,
                auth: AuthValue::new(auth.as_slice()),
            },
        );
        debug!("simulator: NV index 0x{index:08x} defined");
        Ok(Reply::default())
    }

    fn nv_undefine_space(&mut self, auth_handle: u32, index: u32) -> SimResult<Reply> {
        if !matches!(auth_handle, tpm_rh::OWNER | tpm_rh::PLATFORM) {
            return Err(ResponseCode::for_handle(tpm_rc::VALUE, 1));
        }
        self.nv
            .remove(&index)
            .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 2))?;
        Ok(Reply::default())
    }

    fn nv_read_public(&self, index: u32) -> SimResult<Reply> {
        let nv = self
            .nv
            .get(&index)
            .ok_or(ResponseCode::for_handle(tpm_rc::HANDLE, 1))?;
        let mut out = CommandBuffer::new();
        Tpm2bNvPublic {
            nv_public: nv.public.clone(),
        }
        .marshal(&mut out);
        out.put_tpm2b(&nv.name);
        Ok(Reply::new(out))
    }
}

fn frame(tag: TpmSt, reply: &Reply, auths: &[AuthResponse]) -> Vec<u8> {
    let mut out = CommandBuffer::with_capacity(64 + reply.params.len());
    out.put_u16(tag.to_u16());
    out.put_u32(0);
    out.put_u32(tpm_rc::SUCCESS);
    for handle in &reply.handles {
        out.put_u32(*handle);
    }
    if tag == TpmSt::Sessions {
        out.put_u32(reply.params.len() as u32);
    }
    out.put_bytes(&reply.params);
    for auth in auths {
        auth.marshal(&mut out);
    }
    let size = out.len() as u32;
    out.update_u32(2, size);
    out.into_vec()
}

fn error_frame(code: ResponseCode) -> Vec<u8> {
    let mut out = CommandBuffer::with_capacity(10);
    out.put_u16(TpmSt::NoSessions.to_u16());
    out.put_u32(10);
    out.put_u32(code.0);
    out.into_vec()
}

impl Transport for Simulator {
    fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.wire_log.push(command.to_vec());
        let response = self.dispatch(command).unwrap_or_else(|code| {
            debug!("simulator: command failed with {code}");
            error_frame(code)
        });
        self.wire_log.push(response.clone());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TpmCommand, TpmResponse};

    fn start_session(sim: &mut Simulator) -> TpmResponse {
        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_tpm2b(&[7; 16]);
        cmd.add_tpm2b(&[]);
        cmd.add_u8(TpmSe::Hmac as u8);
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(TpmAlgId::Sha256.to_u16());
        TpmResponse::parse(&sim.exchange(&cmd.finalize()).unwrap()).unwrap()
    }

    #[test]
    fn test_session_table_is_bounded() {
        let mut sim = Simulator::new();
        for i in 0..SESSION_SLOTS {
            let response = start_session(&mut sim);
            assert!(response.is_success());
            assert_eq!(
                response.data_buffer().get_u32().unwrap(),
                0x02000000 + i as u32
            );
        }
        let response = start_session(&mut sim);
        assert_eq!(response.response_code, ResponseCode(tpm_rc::SESSION_MEMORY));

        let mut flush = TpmCommand::new(TpmCc::FlushContext);
        flush.add_handle(0x02000001);
        let response = TpmResponse::parse(&sim.exchange(&flush.finalize()).unwrap()).unwrap();
        assert!(response.is_success());
        assert_eq!(sim.loaded_sessions(), SESSION_SLOTS - 1);
        assert_eq!(
            start_session(&mut sim).data_buffer().get_u32().unwrap(),
            0x02000001
        );
    }

    #[test]
    fn test_short_nonce_is_rejected() {
        let mut sim = Simulator::new();
        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_tpm2b(&[7; 8]);
        cmd.add_tpm2b(&[]);
        cmd.add_u8(TpmSe::Hmac as u8);
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(TpmAlgId::Sha256.to_u16());
        let response = TpmResponse::parse(&sim.exchange(&cmd.finalize()).unwrap()).unwrap();
        assert_eq!(
            response.response_code,
            ResponseCode::for_parameter(tpm_rc::SIZE, 1)
        );
    }

    #[test]
    fn test_wrong_password_names_the_session() {
        let mut sim = Simulator::new().with_hierarchy_auth(tpm_rh::OWNER, "mysecret");
        let mut cmd = TpmCommand::with_sessions(TpmCc::HierarchyChangeAuth);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_auth_areas(&[AuthArea {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: TpmaSa::new().with_continue_session(),
            hmac: Zeroizing::new(b"wrongpassword".to_vec()),
        }]);
        cmd.add_tpm2b(b"new");
        let response = TpmResponse::parse(&sim.exchange(&cmd.finalize()).unwrap()).unwrap();
        assert_eq!(response.response_code, ResponseCode(0x98E));
        assert_eq!(sim.wire_log().len(), 2);
        assert!(sim.wire_contains(b"wrongpassword"));
    }

    #[test]
    fn test_unknown_command_and_bad_size() {
        let mut sim = Simulator::new();
        let bad_code = [0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x01, 0x7B];
        let response = TpmResponse::parse(&sim.exchange(&bad_code).unwrap()).unwrap();
        assert_eq!(response.response_code, ResponseCode(tpm_rc::COMMAND_CODE));

        let bad_size = [0x80, 0x01, 0, 0, 0, 11, 0, 0, 0x01, 0x65];
        let response = TpmResponse::parse(&sim.exchange(&bad_size).unwrap()).unwrap();
        assert_eq!(response.response_code, ResponseCode(tpm_rc::COMMAND_SIZE));
    }
}
