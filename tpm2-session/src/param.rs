// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! AES-CFB encryption of the first command/response parameter

use std::ops::Range;

use zeroize::Zeroizing;

use crate::constants::TpmAlgId;
use crate::crypto;
use crate::error::{Error, Result};

const AES_BLOCK_SIZE: usize = 16;

/// Key and IV for one direction of one exchange
pub struct ParameterCipher {
    key: Zeroizing<Vec<u8>>,
    iv: Zeroizing<Vec<u8>>,
}

impl ParameterCipher {
    /// `KDFa(hash, hmacKey, "CFB", newer, older, keyBits + 128)` split into key ‖ IV
    ///
    /// Commands use (nonceCaller, nonceTPM); responses use (nonceTPM, nonceCaller).
    pub fn derive(
        hash_alg: TpmAlgId,
        hmac_key: &[u8],
        key_bits: u16,
        nonce_newer: &[u8],
        nonce_older: &[u8],
    ) -> Result<Self> {
        let key_len = usize::from(key_bits / 8);
        let bits = u32::from(key_bits) + (AES_BLOCK_SIZE * 8) as u32;
        let material = crypto::kdfa(hash_alg, hmac_key, "CFB", nonce_newer, nonce_older, bits)?;
        Ok(Self {
            key: Zeroizing::new(material[..key_len].to_vec()),
            iv: Zeroizing::new(material[key_len..].to_vec()),
        })
    }

    pub fn encrypt(&self, data: &mut [u8]) -> Result<()> {
        crypto::aes_cfb_encrypt(&self.key, &self.iv, data)
    }

    pub fn decrypt(&self, data: &mut [u8]) -> Result<()> {
        crypto::aes_cfb_decrypt(&self.key, &self.iv, data)
    }
}

/// Reject sensitive parameters above the configured limit
pub fn check_size(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::config(format!(
            "sensitive parameter of {len} bytes exceeds the {max} byte limit"
        )));
    }
    Ok(())
}

/// Octet range of the first TPM2B's contents within a parameter area
pub fn first_tpm2b(parameters: &[u8]) -> Result<Range<usize>> {
    let [hi, lo, ..] = parameters else {
        return Err(Error::protocol("parameter area too short for a TPM2B"));
    };
    let len = usize::from(u16::from_be_bytes([*hi, *lo]));
    if parameters.len() < 2 + len {
        return Err(Error::protocol(format!(
            "first parameter claims {len} bytes, {} available",
            parameters.len() - 2
        )));
    }
    Ok(2..2 + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directions_use_distinct_keys() {
        let key = b"session-key";
        let caller = [1u8; 16];
        let tpm = [2u8; 16];
        let cmd = ParameterCipher::derive(TpmAlgId::Sha256, key, 128, &caller, &tpm).unwrap();
        let rsp = ParameterCipher::derive(TpmAlgId::Sha256, key, 128, &tpm, &caller).unwrap();

        let mut a = b"mypassword".to_vec();
        let mut b = a.clone();
        cmd.encrypt(&mut a).unwrap();
        rsp.encrypt(&mut b).unwrap();
        assert_ne!(a, b);
        cmd.decrypt(&mut a).unwrap();
        assert_eq!(a, b"mypassword");
    }

    #[test]
    fn test_response_direction_known_answer() {
        use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let hmac_key = b"session-key";
        let caller = [0x11u8; 16];
        let tpm = [0x22u8; 32];
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(hmac_key).unwrap();
        mac.update(&1u32.to_be_bytes());
        mac.update(b"CFB\0");
        mac.update(&tpm);
        mac.update(&caller);
        mac.update(&256u32.to_be_bytes());
        let material = mac.finalize().into_bytes();

        let mut expected = b"unsealed secret".to_vec();
        cfb_mode::Encryptor::<aes::Aes128>::new_from_slices(&material[..16], &material[16..])
            .unwrap()
            .encrypt(&mut expected);

        let mut actual = b"unsealed secret".to_vec();
        ParameterCipher::derive(TpmAlgId::Sha256, hmac_key, 128, &tpm, &caller)
            .unwrap()
            .encrypt(&mut actual)
            .unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_key_sizes() {
        for bits in [128u16, 192, 256] {
            let c = ParameterCipher::derive(TpmAlgId::Sha384, b"k", bits, &[1; 16], &[2; 16]).unwrap();
            assert_eq!(c.key.len(), usize::from(bits / 8));
            assert_eq!(c.iv.len(), AES_BLOCK_SIZE);
        }
    }

    #[test]
    fn test_size_limit() {
        assert!(check_size(1024, 1024).is_ok());
        assert!(matches!(check_size(1025, 1024), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_first_tpm2b() {
        assert_eq!(first_tpm2b(&[0, 3, 1, 2, 3, 9, 9]).unwrap(), 2..5);
        assert_eq!(first_tpm2b(&[0, 0]).unwrap(), 2..2);
        assert!(first_tpm2b(&[0, 4, 1]).is_err());
        assert!(first_tpm2b(&[0]).is_err());
    }
}
