// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use zeroize::Zeroizing;

use crate::constants::*;
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::*;

fn alg_from_wire(raw: u16, what: &str) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(raw)
        .ok_or_else(|| Error::protocol(format!("unknown {what} algorithm: 0x{raw:04x}")))
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

/// An addressable TPM entity and its name
///
/// Permanent handles (hierarchies) and sessions are named by their handle;
/// objects and NV indices by `nameAlg ‖ H(public area)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub handle: u32,
    pub name: Vec<u8>,
}

impl Entity {
    pub fn new(handle: u32, name: Vec<u8>) -> Self {
        Self { handle, name }
    }

    pub fn permanent(handle: u32) -> Self {
        Self {
            handle,
            name: handle.to_be_bytes().to_vec(),
        }
    }

    pub fn owner() -> Self {
        Self::permanent(tpm_rh::OWNER)
    }

    pub fn endorsement() -> Self {
        Self::permanent(tpm_rh::ENDORSEMENT)
    }

    pub fn platform() -> Self {
        Self::permanent(tpm_rh::PLATFORM)
    }
}

/// `nameAlg ‖ H(marshalled public area)`
pub fn compute_name(name_alg: TpmAlgId, public_area: &[u8]) -> Result<Vec<u8>> {
    let mut name = name_alg.to_u16().to_be_bytes().to_vec();
    name.extend_from_slice(&crypto::digest(name_alg, &[public_area])?);
    Ok(name)
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_cfb(key_bits: u16) -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits,
            mode: TpmAlgId::Cfb,
        }
    }

    pub fn is_null(&self) -> bool {
        self.algorithm == TpmAlgId::Null
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg_from_wire(buf.get_u16()?, "symmetric")?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let key_bits = buf.get_u16()?;
        let mode = alg_from_wire(buf.get_u16()?, "mode")?;
        Ok(Self {
            algorithm,
            key_bits,
            mode,
        })
    }
}

/// TPMS_RSA_PARMS - RSA key parameters (scheme fixed to NULL)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_cfb(128),
            key_bits: 2048,
            exponent: 0, // Default exponent (65537)
        }
    }
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        buf.put_u16(TpmAlgId::Null.to_u16());
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = alg_from_wire(buf.get_u16()?, "scheme")?;
        if scheme != TpmAlgId::Null {
            return Err(Error::protocol(format!(
                "unsupported RSA scheme {scheme:?}"
            )));
        }
        let key_bits = buf.get_u16()?;
        let exponent = buf.get_u32()?;
        Ok(Self {
            symmetric,
            key_bits,
            exponent,
        })
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    /// Keyed-hash object with a NULL scheme (sealed data)
    KeyedHash,
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),       // TPM2B_PUBLIC_KEY_RSA
    KeyedHash(Vec<u8>), // TPM2B_DIGEST
}

impl TpmtPublicUnique {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TpmtPublicUnique::Rsa(b) | TpmtPublicUnique::KeyedHash(b) => b,
        }
    }
}

/// TPMT_PUBLIC - Public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// Restricted RSA decryption key usable as a parent and as a salt key
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_no_da()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::storage_key()),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    /// Keyed-hash object holding caller-provided data, unsealed with its auth value
    pub fn sealed_object() -> Self {
        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth()
                .with_no_da(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::KeyedHash,
            unique: TpmtPublicUnique::KeyedHash(Vec::new()),
        }
    }

    pub fn with_name_alg(mut self, name_alg: TpmAlgId) -> Self {
        self.name_alg = name_alg;
        self
    }

    pub fn rsa_parms(&self) -> Option<&TpmsRsaParms> {
        match &self.parameters {
            TpmtPublicParms::Rsa(p) => Some(p),
            TpmtPublicParms::KeyedHash => None,
        }
    }

    /// Name of the object described by this public area
    pub fn name(&self) -> Result<Vec<u8>> {
        compute_name(self.name_alg, &self.to_bytes())
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        match &self.parameters {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash => buf.put_u16(TpmAlgId::Null.to_u16()),
        }
        buf.put_tpm2b(self.unique.as_bytes());
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg_from_wire(buf.get_u16()?, "object type")?;
        let name_alg = alg_from_wire(buf.get_u16()?, "name")?;
        if !name_alg.is_hash() {
            return Err(Error::protocol(format!("invalid name algorithm {name_alg:?}")));
        }
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let (parameters, unique) = match type_alg {
            TpmAlgId::Rsa => {
                let parms = TpmsRsaParms::unmarshal(buf)?;
                (
                    TpmtPublicParms::Rsa(parms),
                    TpmtPublicUnique::Rsa(buf.get_tpm2b()?),
                )
            }
            TpmAlgId::KeyedHash => {
                let scheme = alg_from_wire(buf.get_u16()?, "scheme")?;
                if scheme != TpmAlgId::Null {
                    return Err(Error::protocol(format!(
                        "unsupported keyed-hash scheme {scheme:?}"
                    )));
                }
                (
                    TpmtPublicParms::KeyedHash,
                    TpmtPublicUnique::KeyedHash(buf.get_tpm2b()?),
                )
            }
            other => {
                return Err(Error::protocol(format!(
                    "unsupported object type {other:?}"
                )))
            }
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
///
/// Keeps the exact octets so names are computed over what the TPM produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>,
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }

    pub fn parse(&self) -> Result<TpmtPublic> {
        let mut rd = ResponseBuffer::new(&self.public_area);
        let public = TpmtPublic::unmarshal(&mut rd)?;
        rd.finish()?;
        Ok(public)
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            public_area: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_PRIVATE - Private area, opaque to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPrivate {
    pub buffer: Vec<u8>,
}

impl Tpm2bPrivate {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bPrivate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bPrivate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_SENSITIVE_CREATE - auth value and data of a new object
#[derive(Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Zeroizing<Vec<u8>>,
    pub data: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Tpm2bSensitiveCreate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tpm2bSensitiveCreate")
            .field("user_auth", &format_args!("<{} bytes>", self.user_auth.len()))
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .finish()
    }
}

impl Tpm2bSensitiveCreate {
    pub fn new(user_auth: &[u8], data: &[u8]) -> Self {
        Self {
            user_auth: Zeroizing::new(user_auth.to_vec()),
            data: Zeroizing::new(data.to_vec()),
        }
    }

    pub fn with_auth(user_auth: &[u8]) -> Self {
        Self::new(user_auth, &[])
    }

    /// Marshalled TPMS_SENSITIVE_CREATE, without the outer size
    pub fn contents(&self) -> Zeroizing<Vec<u8>> {
        let mut inner = CommandBuffer::new();
        inner.put_tpm2b(&self.user_auth);
        inner.put_tpm2b(&self.data);
        Zeroizing::new(inner.into_vec())
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.contents());
    }
}

impl Unmarshal for Tpm2bSensitiveCreate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let outer = Zeroizing::new(buf.get_tpm2b()?);
        let mut inner = ResponseBuffer::new(&outer);
        let user_auth = Zeroizing::new(inner.get_tpm2b()?);
        let data = Zeroizing::new(inner.get_tpm2b()?);
        inner.finish()?;
        Ok(Self { user_auth, data })
    }
}

/// TPMT_TK_CREATION - Creation ticket
#[derive(Debug, Clone)]
pub struct TpmtTkCreation {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl TpmtTkCreation {
    pub fn null() -> Self {
        Self {
            tag: TpmSt::Creation.to_u16(),
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }
}

impl Marshal for TpmtTkCreation {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTkCreation {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }

    pub fn name(&self) -> Result<Vec<u8>> {
        compute_name(self.name_alg, &self.to_bytes())
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nv_index = buf.get_u32()?;
        let name_alg = alg_from_wire(buf.get_u16()?, "name")?;
        let attributes = TpmaNv(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let data_size = buf.get_u16()?;
        Ok(Self {
            nv_index,
            name_alg,
            attributes,
            auth_policy,
            data_size,
        })
    }
}

/// TPM2B_NV_PUBLIC - NV public with size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bNvPublic {
    pub nv_public: TpmsNvPublic,
}

impl Marshal for Tpm2bNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nv_public.to_bytes());
    }
}

impl Unmarshal for Tpm2bNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let data = buf.get_tpm2b()?;
        if data.is_empty() {
            return Err(Error::protocol("empty NV public"));
        }
        let mut inner = ResponseBuffer::new(&data);
        let nv_public = TpmsNvPublic::unmarshal(&mut inner)?;
        inner.finish()?;
        Ok(Self { nv_public })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_area_parses_back() {
        let template = TpmtPublic::rsa_storage_key();
        let wire = Tpm2bPublic::from_template(&template);
        assert_eq!(wire.parse().unwrap(), template);

        let sealed = TpmtPublic::sealed_object().with_name_alg(TpmAlgId::Sha384);
        let parsed = Tpm2bPublic::from_template(&sealed).parse().unwrap();
        assert_eq!(parsed.name_alg, TpmAlgId::Sha384);
        assert!(parsed.rsa_parms().is_none());
    }

    #[test]
    fn test_object_name_layout() {
        let name = TpmtPublic::sealed_object().name().unwrap();
        assert_eq!(name.len(), 2 + 32);
        assert_eq!(&name[..2], &[0x00, 0x0B]);
    }

    #[test]
    fn test_permanent_entity_name_is_handle() {
        assert_eq!(Entity::owner().name, vec![0x40, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_sensitive_create_layout() {
        let bytes = Tpm2bSensitiveCreate::new(b"pw", b"data").to_bytes();
        assert_eq!(
            bytes,
            vec![0, 10, 0, 2, b'p', b'w', 0, 4, b'd', b'a', b't', b'a']
        );
        let back = Tpm2bSensitiveCreate::from_bytes(&bytes).unwrap();
        assert_eq!(back.user_auth.as_slice(), b"pw");
    }

    #[test]
    fn test_sym_def_null_has_no_details() {
        assert_eq!(TpmtSymDef::null().to_bytes(), vec![0x00, 0x10]);
        assert_eq!(
            TpmtSymDef::aes_cfb(256).to_bytes(),
            vec![0x00, 0x06, 0x01, 0x00, 0x00, 0x43]
        );
    }
}
