// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session descriptors
//!
//! A [`SessionDescriptor`] is an immutable description of how a session
//! derives its secret and whether it encrypts parameters. Descriptors are
//! plain data: they can be built on any thread and reused for many sessions.

use std::fmt;

use zeroize::Zeroizing;

use crate::constants::{TpmAlgId, TpmaObject, MIN_NONCE_SIZE};
use crate::error::{Error, Result};
use crate::types::{Entity, TpmtPublic};

/// Authorization value of an entity, wiped on drop
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthValue(Zeroizing<Vec<u8>>);

impl AuthValue {
    pub fn new(value: impl AsRef<[u8]>) -> Self {
        Self(Zeroizing::new(value.as_ref().to_vec()))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value with trailing zero octets removed, as used in HMAC keys
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1);
        &self.0[..end]
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthValue(<{} bytes>)", self.0.len())
    }
}

impl From<&str> for AuthValue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<&[u8]> for AuthValue {
    fn from(b: &[u8]) -> Self {
        Self::new(b)
    }
}

/// Which parameters a session encrypts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First command parameter (TPMA_SESSION.decrypt)
    In,
    /// First response parameter (TPMA_SESSION.encrypt)
    Out,
    InOut,
}

impl Direction {
    pub fn decrypts_command(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn encrypts_response(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encryption {
    pub key_bits: u16,
    pub direction: Direction,
}

/// Where an HMAC session's secret comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// Unbound, unsalted: the HMAC key is the caller's auth value
    PlainAuth { auth: AuthValue },
    /// Session key derived from the bind entity's auth value
    Bound {
        bind: Entity,
        bind_auth: AuthValue,
        auth: AuthValue,
    },
    /// Session key derived from a random salt only the salt key can decrypt
    Salted {
        salt_key: Entity,
        salt_public: TpmtPublic,
        auth: AuthValue,
    },
}

impl KeyMaterial {
    /// Auth value of the entity the session authorizes
    pub fn auth(&self) -> &AuthValue {
        match self {
            KeyMaterial::PlainAuth { auth }
            | KeyMaterial::Bound { auth, .. }
            | KeyMaterial::Salted { auth, .. } => auth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmacDescriptor {
    hash_alg: TpmAlgId,
    nonce_size: usize,
    key_material: KeyMaterial,
    encryption: Option<Encryption>,
}

impl HmacDescriptor {
    pub fn hash_alg(&self) -> TpmAlgId {
        self.hash_alg
    }

    pub fn nonce_size(&self) -> usize {
        self.nonce_size
    }

    pub fn key_material(&self) -> &KeyMaterial {
        &self.key_material
    }

    pub fn encryption(&self) -> Option<Encryption> {
        self.encryption
    }
}

/// How a session authorizes and protects a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDescriptor {
    /// Cleartext password (TPM_RS_PW); no device session
    Password(AuthValue),
    Hmac(HmacDescriptor),
}

impl SessionDescriptor {
    pub fn password(value: impl Into<AuthValue>) -> Self {
        SessionDescriptor::Password(value.into())
    }

    pub fn hmac(hash_alg: TpmAlgId) -> DescriptorBuilder {
        DescriptorBuilder::new(hash_alg)
    }

    /// Unbound, unsalted HMAC authorization without encryption
    pub fn hmac_auth(hash_alg: TpmAlgId, auth: impl Into<AuthValue>) -> Result<Self> {
        Self::hmac(hash_alg).auth(auth).build()
    }

    /// Unbound, unsalted session encrypting both directions with AES-128
    pub fn unbound(hash_alg: TpmAlgId) -> Result<Self> {
        Self::hmac(hash_alg)
            .aes_cfb(128, Direction::InOut)
            .build()
    }

    /// Session bound to `bind`, encrypting both directions with AES-128
    pub fn bound(
        hash_alg: TpmAlgId,
        bind: Entity,
        bind_auth: impl Into<AuthValue>,
    ) -> Result<Self> {
        Self::hmac(hash_alg)
            .bound(bind, bind_auth)
            .aes_cfb(128, Direction::InOut)
            .build()
    }

    /// Session salted to an RSA key, encrypting both directions with AES-128
    pub fn salted(hash_alg: TpmAlgId, salt_key: Entity, salt_public: TpmtPublic) -> Result<Self> {
        Self::hmac(hash_alg)
            .salted(salt_key, salt_public)
            .aes_cfb(128, Direction::InOut)
            .build()
    }

    pub fn is_password(&self) -> bool {
        matches!(self, SessionDescriptor::Password(_))
    }

    pub fn hash_alg(&self) -> Option<TpmAlgId> {
        match self {
            SessionDescriptor::Password(_) => None,
            SessionDescriptor::Hmac(h) => Some(h.hash_alg),
        }
    }

    pub fn encryption(&self) -> Option<Encryption> {
        match self {
            SessionDescriptor::Password(_) => None,
            SessionDescriptor::Hmac(h) => h.encryption,
        }
    }
}

/// Builder for HMAC session descriptors
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    hash_alg: TpmAlgId,
    nonce_size: usize,
    auth: AuthValue,
    bind: Option<(Entity, AuthValue)>,
    salt: Option<(Entity, TpmtPublic)>,
    encryption: Option<Encryption>,
}

impl DescriptorBuilder {
    fn new(hash_alg: TpmAlgId) -> Self {
        Self {
            hash_alg,
            nonce_size: MIN_NONCE_SIZE,
            auth: AuthValue::empty(),
            bind: None,
            salt: None,
            encryption: None,
        }
    }

    /// Auth value of the entity this session will authorize
    pub fn auth(mut self, auth: impl Into<AuthValue>) -> Self {
        self.auth = auth.into();
        self
    }

    pub fn bound(mut self, bind: Entity, bind_auth: impl Into<AuthValue>) -> Self {
        self.bind = Some((bind, bind_auth.into()));
        self
    }

    pub fn salted(mut self, salt_key: Entity, salt_public: TpmtPublic) -> Self {
        self.salt = Some((salt_key, salt_public));
        self
    }

    pub fn aes_cfb(mut self, key_bits: u16, direction: Direction) -> Self {
        self.encryption = Some(Encryption {
            key_bits,
            direction,
        });
        self
    }

    pub fn nonce_size(mut self, nonce_size: usize) -> Self {
        self.nonce_size = nonce_size;
        self
    }

    pub fn build(self) -> Result<SessionDescriptor> {
        if !matches!(
            self.hash_alg,
            TpmAlgId::Sha256 | TpmAlgId::Sha384 | TpmAlgId::Sha512
        ) {
            return Err(Error::config(format!(
                "{:?} is not a supported session hash",
                self.hash_alg
            )));
        }
        let digest_size = self.hash_alg.digest_size();
        if !(MIN_NONCE_SIZE..=digest_size).contains(&self.nonce_size) {
            return Err(Error::config(format!(
                "nonce size {} outside [{MIN_NONCE_SIZE}, {digest_size}]",
                self.nonce_size
            )));
        }
        if let Some(enc) = &self.encryption {
            if !matches!(enc.key_bits, 128 | 192 | 256) {
                return Err(Error::config(format!(
                    "unsupported AES key size {}",
                    enc.key_bits
                )));
            }
        }
        let key_material = match (self.bind, self.salt) {
            (Some(_), Some(_)) => {
                return Err(Error::config("a session cannot be both bound and salted"))
            }
            (Some((bind, bind_auth)), None) => KeyMaterial::Bound {
                bind,
                bind_auth,
                auth: self.auth,
            },
            (None, Some((salt_key, salt_public))) => {
                validate_salt_key(&salt_key, &salt_public)?;
                KeyMaterial::Salted {
                    salt_key,
                    salt_public,
                    auth: self.auth,
                }
            }
            (None, None) => KeyMaterial::PlainAuth { auth: self.auth },
        };
        Ok(SessionDescriptor::Hmac(HmacDescriptor {
            hash_alg: self.hash_alg,
            nonce_size: self.nonce_size,
            key_material,
            encryption: self.encryption,
        }))
    }
}

fn validate_salt_key(salt_key: &Entity, public: &TpmtPublic) -> Result<()> {
    if public.rsa_parms().is_none() {
        return Err(Error::config("salt key must be an RSA key"));
    }
    if !public.object_attributes.contains(TpmaObject::DECRYPT) {
        return Err(Error::config("salt key must be a decryption key"));
    }
    if !matches!(
        public.name_alg,
        TpmAlgId::Sha256 | TpmAlgId::Sha384 | TpmAlgId::Sha512
    ) {
        return Err(Error::config(format!(
            "salt key name algorithm {:?} is not supported",
            public.name_alg
        )));
    }
    if public.name()? != salt_key.name {
        return Err(Error::config("salt key name does not match its public area"));
    }
    Ok(())
}
