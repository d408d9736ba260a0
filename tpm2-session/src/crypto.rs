// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Hashing, HMAC, KDFa, AES-CFB and RSA-OAEP used by sessions

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};
use crate::types::{TpmtPublic, TpmtPublicUnique};

/// OAEP label for secrets shared with the TPM
const SECRET_LABEL: &str = "SECRET\0";

fn unsupported(alg: TpmAlgId) -> Error {
    Error::config(format!("unsupported hash algorithm {alg:?}"))
}

fn hash_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// H(part0 ‖ part1 ‖ ...)
pub fn digest(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    match alg {
        TpmAlgId::Sha256 => Ok(hash_parts::<Sha256>(parts)),
        TpmAlgId::Sha384 => Ok(hash_parts::<Sha384>(parts)),
        TpmAlgId::Sha512 => Ok(hash_parts::<Sha512>(parts)),
        other => Err(unsupported(other)),
    }
}

fn mac_parts<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("hmac key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC(key, part0 ‖ part1 ‖ ...)
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    match alg {
        TpmAlgId::Sha256 => mac_parts::<Hmac<Sha256>>(key, parts),
        TpmAlgId::Sha384 => mac_parts::<Hmac<Sha384>>(key, parts),
        TpmAlgId::Sha512 => mac_parts::<Hmac<Sha512>>(key, parts),
        other => Err(unsupported(other)),
    }
}

/// Constant-time comparison of two MACs
pub fn verify_mac(expected: &[u8], actual: &[u8]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    expected
        .iter()
        .zip(actual)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Counter-mode KDF from TPM 2.0 part 1, section 11.4.10.2
///
/// `label` is written with its terminating zero octet.
pub fn kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let len = bits.div_ceil(8) as usize;
    let bits_be = bits.to_be_bytes();
    let mut out = Zeroizing::new(Vec::with_capacity(len + alg.digest_size()));
    let mut counter: u32 = 0;
    while out.len() < len {
        counter += 1;
        let block = Zeroizing::new(hmac(
            alg,
            key,
            &[
                &counter.to_be_bytes(),
                label.as_bytes(),
                &[0],
                context_u,
                context_v,
                &bits_be,
            ],
        )?);
        out.extend_from_slice(&block);
    }
    out.truncate(len);
    if bits % 8 != 0 {
        out[0] &= (1u8 << (bits % 8)) - 1;
    }
    Ok(out)
}

fn cfb_apply(key: &[u8], iv: &[u8], data: &mut [u8], encrypt: bool) -> Result<()> {
    macro_rules! run {
        ($cipher:ty) => {
            if encrypt {
                Encryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|e| Error::Crypto(format!("aes-cfb init: {e}")))?
                    .encrypt(data)
            } else {
                Decryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|e| Error::Crypto(format!("aes-cfb init: {e}")))?
                    .decrypt(data)
            }
        };
    }
    match key.len() {
        16 => run!(Aes128),
        24 => run!(Aes192),
        32 => run!(Aes256),
        n => return Err(Error::Crypto(format!("invalid AES key length {n}"))),
    }
    Ok(())
}

pub fn aes_cfb_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    cfb_apply(key, iv, data, true)
}

pub fn aes_cfb_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    cfb_apply(key, iv, data, false)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Public key of an RSA object as described by its public area
pub fn rsa_public_key(public: &TpmtPublic) -> Result<RsaPublicKey> {
    let (parms, TpmtPublicUnique::Rsa(modulus)) = (public.rsa_parms(), &public.unique) else {
        return Err(Error::config("salt key is not an RSA key"));
    };
    let parms = parms.ok_or_else(|| Error::config("salt key is not an RSA key"))?;
    if modulus.is_empty() {
        return Err(Error::config("salt key public area has no modulus"));
    }
    let exponent = if parms.exponent == 0 {
        65537
    } else {
        parms.exponent
    };
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(u64::from(exponent)),
    )
    .map_err(|e| Error::Crypto(format!("rsa public key: {e}")))
}

fn oaep(alg: TpmAlgId) -> Result<Oaep> {
    match alg {
        TpmAlgId::Sha256 => Ok(Oaep::new_with_label::<Sha256, _>(SECRET_LABEL)),
        TpmAlgId::Sha384 => Ok(Oaep::new_with_label::<Sha384, _>(SECRET_LABEL)),
        TpmAlgId::Sha512 => Ok(Oaep::new_with_label::<Sha512, _>(SECRET_LABEL)),
        other => Err(unsupported(other)),
    }
}

/// Encrypt a session salt to the TPM (OAEP, label "SECRET")
pub fn rsa_oaep_encrypt(key: &RsaPublicKey, hash: TpmAlgId, secret: &[u8]) -> Result<Vec<u8>> {
    key.encrypt(&mut OsRng, oaep(hash)?, secret)
        .map_err(|e| Error::Crypto(format!("rsa-oaep encrypt: {e}")))
}

pub fn rsa_oaep_decrypt(
    key: &RsaPrivateKey,
    hash: TpmAlgId,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    key.decrypt(oaep(hash)?, ciphertext)
        .map(Zeroizing::new)
        .map_err(|e| Error::Crypto(format!("rsa-oaep decrypt: {e}")))
}

/// Big-endian modulus of a private key, as stored in `unique.rsa`
pub fn rsa_modulus(key: &RsaPrivateKey) -> Vec<u8> {
    key.n().to_bytes_be()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let mac = hmac(
            TpmAlgId::Sha256,
            b"Jefe",
            &[b"what do ya want ", b"for nothing?"],
        )
        .unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_kdfa_is_one_hmac_block_for_digest_bits() {
        let key = [0x11u8; 32];
        let out = kdfa(TpmAlgId::Sha256, &key, "ATH", b"tpm", b"caller", 256).unwrap();
        let expected = hmac(
            TpmAlgId::Sha256,
            &key,
            &[&[0, 0, 0, 1], b"ATH", &[0], b"tpm", b"caller", &[0, 0, 1, 0]],
        )
        .unwrap();
        assert_eq!(out.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_kdfa_iterates_and_truncates() {
        let key = b"key";
        let long = kdfa(TpmAlgId::Sha256, key, "CFB", b"u", b"v", 384).unwrap();
        assert_eq!(long.len(), 48);
        let again = kdfa(TpmAlgId::Sha256, key, "CFB", b"u", b"v", 384).unwrap();
        assert_eq!(long, again);
        // The requested bit count is part of every block's input.
        let short = kdfa(TpmAlgId::Sha256, key, "CFB", b"u", b"v", 256).unwrap();
        assert_ne!(&long[..32], short.as_slice());
    }

    #[test]
    fn test_kdfa_masks_partial_octet() {
        let out = kdfa(TpmAlgId::Sha384, b"k", "X", &[], &[], 12).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0] & 0xF0, 0);
    }

    #[test]
    fn test_aes_cfb_round_trip_all_key_sizes() {
        for key_len in [16, 24, 32] {
            let key = vec![7u8; key_len];
            let iv = [9u8; 16];
            let mut data = b"not a multiple of the block size".to_vec();
            aes_cfb_encrypt(&key, &iv, &mut data).unwrap();
            assert_ne!(&data[..], b"not a multiple of the block size");
            aes_cfb_decrypt(&key, &iv, &mut data).unwrap();
            assert_eq!(&data[..], b"not a multiple of the block size");
        }
        assert!(aes_cfb_encrypt(&[0u8; 8], &[0u8; 16], &mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_sha1_is_rejected() {
        assert!(matches!(
            digest(TpmAlgId::Sha1, &[b"x"]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_verify_mac() {
        assert!(verify_mac(b"abc", b"abc"));
        assert!(!verify_mac(b"abc", b"abd"));
        assert!(!verify_mac(b"abc", b"ab"));
    }
}
