// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

use std::fmt;

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    NvUndefineSpace = 0x00000122,
    HierarchyChangeAuth = 0x00000129,
    NvDefineSpace = 0x0000012A,
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Unseal = 0x0000015E,
    FlushContext = 0x00000165,
    NvReadPublic = 0x00000169,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x00000122 => Some(TpmCc::NvUndefineSpace),
            0x00000129 => Some(TpmCc::HierarchyChangeAuth),
            0x0000012A => Some(TpmCc::NvDefineSpace),
            0x00000131 => Some(TpmCc::CreatePrimary),
            0x00000153 => Some(TpmCc::Create),
            0x00000157 => Some(TpmCc::Load),
            0x0000015E => Some(TpmCc::Unseal),
            0x00000165 => Some(TpmCc::FlushContext),
            0x00000169 => Some(TpmCc::NvReadPublic),
            0x00000173 => Some(TpmCc::ReadPublic),
            0x00000176 => Some(TpmCc::StartAuthSession),
            _ => None,
        }
    }
}

/// TPM 2.0 Response Codes (TPM_RC)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;
    pub const BAD_TAG: u32 = 0x01E;

    // Format 0
    pub const FAILURE: u32 = 0x101;
    pub const AUTH_MISSING: u32 = 0x125;
    pub const COMMAND_SIZE: u32 = 0x142;
    pub const COMMAND_CODE: u32 = 0x143;
    pub const AUTHSIZE: u32 = 0x144;
    pub const AUTH_CONTEXT: u32 = 0x145;
    pub const NV_SPACE: u32 = 0x14B;
    pub const NV_DEFINED: u32 = 0x14C;

    // Format 1, combined with one of the H/P/S modifiers below
    pub const ATTRIBUTES: u32 = 0x082;
    pub const HASH: u32 = 0x083;
    pub const VALUE: u32 = 0x084;
    pub const KEY_SIZE: u32 = 0x087;
    pub const TYPE: u32 = 0x08A;
    pub const HANDLE: u32 = 0x08B;
    pub const AUTH_FAIL: u32 = 0x08E;
    pub const SIZE: u32 = 0x095;
    pub const INTEGRITY: u32 = 0x09F;
    pub const SYMMETRIC: u32 = 0x096;
    pub const INSUFFICIENT: u32 = 0x09A;
    pub const BAD_AUTH: u32 = 0x0A2;

    // Warnings
    pub const SESSION_MEMORY: u32 = 0x903;
    pub const SESSION_HANDLES: u32 = 0x905;
    pub const OBJECT_MEMORY: u32 = 0x902;

    pub const RC_FMT1: u32 = 0x080;
    pub const RC_P: u32 = 0x040;
    pub const RC_S: u32 = 0x800;
}

/// A raw TPM_RC with format-1 decoding helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub const SUCCESS: Self = Self(tpm_rc::SUCCESS);

    /// Format-1 code attributed to the n-th (1-based) session
    pub fn for_session(code: u32, n: u8) -> Self {
        Self(code | tpm_rc::RC_S | (u32::from(n & 0x7) << 8))
    }

    /// Format-1 code attributed to the n-th (1-based) parameter
    pub fn for_parameter(code: u32, n: u8) -> Self {
        Self(code | tpm_rc::RC_P | (u32::from(n & 0xF) << 8))
    }

    /// Format-1 code attributed to the n-th (1-based) handle
    pub fn for_handle(code: u32, n: u8) -> Self {
        Self(code | (u32::from(n & 0x7) << 8))
    }

    pub fn is_success(self) -> bool {
        self.0 == tpm_rc::SUCCESS
    }

    fn is_format_one(self) -> bool {
        self.0 & tpm_rc::RC_FMT1 != 0
    }

    /// The code with handle/parameter/session numbering stripped
    pub fn base(self) -> u32 {
        if self.is_format_one() {
            tpm_rc::RC_FMT1 | (self.0 & 0x3F)
        } else {
            self.0
        }
    }

    /// 1-based index of the session the error refers to
    pub fn session(self) -> Option<u8> {
        if self.is_format_one() && self.0 & tpm_rc::RC_P == 0 && self.0 & tpm_rc::RC_S != 0 {
            Some(((self.0 >> 8) & 0x7) as u8)
        } else {
            None
        }
    }

    pub fn is_auth_failure(self) -> bool {
        matches!(self.base(), tpm_rc::AUTH_FAIL | tpm_rc::BAD_AUTH)
    }

    pub fn is_session_exhaustion(self) -> bool {
        matches!(self.0, tpm_rc::SESSION_MEMORY | tpm_rc::SESSION_HANDLES)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TPM_RC 0x{:08x}", self.0)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Hmac = 0x0005,
    Rsa = 0x0001,
    Oaep = 0x0017,
    Aes = 0x0006,
    Cfb = 0x0043,
    KeyedHash = 0x0008,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0005 => Some(TpmAlgId::Hmac),
            0x0001 => Some(TpmAlgId::Rsa),
            0x0017 => Some(TpmAlgId::Oaep),
            0x0006 => Some(TpmAlgId::Aes),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0008 => Some(TpmAlgId::KeyedHash),
            _ => None,
        }
    }

    /// Parse a lowercase algorithm name as used in configuration files
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Some(TpmAlgId::Sha1),
            "sha256" => Some(TpmAlgId::Sha256),
            "sha384" => Some(TpmAlgId::Sha384),
            "sha512" => Some(TpmAlgId::Sha512),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }

    pub fn first_handle(self) -> u32 {
        (self as u32) << 24
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
    pub const PW: u32 = 0x40000009; // Password authorization
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const NO_DA: u32 = 1 << 25;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_owner_write(mut self) -> Self {
        self.0 |= Self::OWNER_WRITE;
        self
    }

    pub fn with_owner_read(mut self) -> Self {
        self.0 |= Self::OWNER_READ;
        self
    }

    pub fn with_auth_write(mut self) -> Self {
        self.0 |= Self::AUTH_WRITE;
        self
    }

    pub fn with_auth_read(mut self) -> Self {
        self.0 |= Self::AUTH_READ;
        self
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8021 => Some(TpmSt::Creation),
            _ => None,
        }
    }
}

/// Largest sealed data object (MAX_SYM_DATA)
pub const MAX_SYM_DATA: usize = 128;

/// Upper bound on authorization sessions per command
pub const MAX_SESSIONS_PER_COMMAND: usize = 3;

/// Smallest nonce the TPM accepts for nonceCaller
pub const MIN_NONCE_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_one_decoding() {
        let rc = ResponseCode::for_session(tpm_rc::AUTH_FAIL, 1);
        assert_eq!(rc.0, 0x98E);
        assert_eq!(rc.base(), tpm_rc::AUTH_FAIL);
        assert_eq!(rc.session(), Some(1));
        assert!(rc.is_auth_failure());

        let rc = ResponseCode::for_parameter(tpm_rc::SIZE, 1);
        assert_eq!(rc.0, 0x1D5);
        assert_eq!(rc.session(), None);
        assert!(!rc.is_auth_failure());
    }

    #[test]
    fn test_warnings_are_not_format_one() {
        let rc = ResponseCode(tpm_rc::SESSION_MEMORY);
        assert!(rc.is_session_exhaustion());
        assert_eq!(rc.base(), tpm_rc::SESSION_MEMORY);
        assert_eq!(rc.session(), None);
    }

    #[test]
    fn test_handle_types() {
        assert_eq!(TpmHt::of(tpm_rh::OWNER), Some(TpmHt::Permanent));
        assert_eq!(TpmHt::of(0x02000001), Some(TpmHt::HmacSession));
        assert_eq!(TpmHt::Transient.first_handle(), 0x80000000);
    }
}
