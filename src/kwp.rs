//! AES Key Wrap with Padding (RFC 5649).
//!
//! Used by the in-process boundary to perform the private-key wrap, and by
//! callers that need to check a wrapped blob against the intermediate key
//! value. HSM-side wraps never touch this module.
//!
//! Output layout: `[ AIV-derived block (8 bytes) ][ wrapped semiblocks ]`,
//! always `ceil(len / 8) * 8 + 8` bytes.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use zeroize::Zeroizing;

use crate::error::{ByokError, Result};

/// Constant prefix of the Alternative Initial Value.
const AIV_PREFIX: [u8; 4] = [0xA6, 0x59, 0x59, 0xA6];

const SEMIBLOCK: usize = 8;

/// Size of a KWP output for a plaintext of `len` bytes.
pub fn wrapped_len(len: usize) -> usize {
    len.div_ceil(SEMIBLOCK) * SEMIBLOCK + SEMIBLOCK
}

enum Kek {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl Kek {
    fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| ByokError::Wrap(format!("invalid AES key length {}", key.len()));
        match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128).map_err(invalid),
            24 => Aes192::new_from_slice(key).map(Self::Aes192).map_err(invalid),
            32 => Aes256::new_from_slice(key).map(Self::Aes256).map_err(invalid),
            n => Err(ByokError::Wrap(format!("invalid AES key length {}", n))),
        }
    }

    fn encrypt(&self, block: &mut [u8; 16]) {
        let mut b = Block::from(*block);
        match self {
            Self::Aes128(c) => c.encrypt_block(&mut b),
            Self::Aes192(c) => c.encrypt_block(&mut b),
            Self::Aes256(c) => c.encrypt_block(&mut b),
        }
        block.copy_from_slice(&b);
    }

    fn decrypt(&self, block: &mut [u8; 16]) {
        let mut b = Block::from(*block);
        match self {
            Self::Aes128(c) => c.decrypt_block(&mut b),
            Self::Aes192(c) => c.decrypt_block(&mut b),
            Self::Aes256(c) => c.decrypt_block(&mut b),
        }
        block.copy_from_slice(&b);
    }
}

/// Wrap `plaintext` under `kek`.
pub fn wrap(kek: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() || plaintext.len() > u32::MAX as usize {
        return Err(ByokError::Wrap(format!(
            "cannot wrap {} bytes",
            plaintext.len()
        )));
    }
    let cipher = Kek::new(kek)?;

    let mut aiv = [0u8; SEMIBLOCK];
    aiv[..4].copy_from_slice(&AIV_PREFIX);
    aiv[4..].copy_from_slice(&(plaintext.len() as u32).to_be_bytes());

    let padded_len = plaintext.len().div_ceil(SEMIBLOCK) * SEMIBLOCK;
    let mut padded = Zeroizing::new(vec![0u8; padded_len]);
    padded[..plaintext.len()].copy_from_slice(plaintext);

    // A single semiblock is encrypted directly with the AIV as one AES block.
    if padded_len == SEMIBLOCK {
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&aiv);
        block[8..].copy_from_slice(&padded);
        cipher.encrypt(&mut block);
        return Ok(block.to_vec());
    }

    let n = padded_len / SEMIBLOCK;
    let mut a = aiv;
    let mut out = vec![0u8; padded_len + SEMIBLOCK];
    out[SEMIBLOCK..].copy_from_slice(&padded);

    let mut block = [0u8; 16];
    for j in 0..6 {
        for i in 1..=n {
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&out[i * SEMIBLOCK..(i + 1) * SEMIBLOCK]);
            cipher.encrypt(&mut block);
            let t = ((n * j) + i) as u64;
            a.copy_from_slice(&block[..8]);
            xor_counter(&mut a, t);
            out[i * SEMIBLOCK..(i + 1) * SEMIBLOCK].copy_from_slice(&block[8..]);
        }
    }
    out[..SEMIBLOCK].copy_from_slice(&a);
    Ok(out)
}

/// Unwrap a KWP blob, checking the AIV and padding.
pub fn unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if wrapped.len() < 2 * SEMIBLOCK || wrapped.len() % SEMIBLOCK != 0 {
        return Err(ByokError::Wrap(format!(
            "invalid wrapped length {}",
            wrapped.len()
        )));
    }
    let cipher = Kek::new(kek)?;

    let mut a = [0u8; SEMIBLOCK];
    let mut padded = Zeroizing::new(vec![0u8; wrapped.len() - SEMIBLOCK]);

    if wrapped.len() == 2 * SEMIBLOCK {
        let mut block = [0u8; 16];
        block.copy_from_slice(wrapped);
        cipher.decrypt(&mut block);
        a.copy_from_slice(&block[..8]);
        padded.copy_from_slice(&block[8..]);
    } else {
        let n = padded.len() / SEMIBLOCK;
        a.copy_from_slice(&wrapped[..SEMIBLOCK]);
        padded.copy_from_slice(&wrapped[SEMIBLOCK..]);

        let mut block = [0u8; 16];
        for j in (0..6).rev() {
            for i in (1..=n).rev() {
                let t = ((n * j) + i) as u64;
                xor_counter(&mut a, t);
                block[..8].copy_from_slice(&a);
                block[8..].copy_from_slice(&padded[(i - 1) * SEMIBLOCK..i * SEMIBLOCK]);
                cipher.decrypt(&mut block);
                a.copy_from_slice(&block[..8]);
                padded[(i - 1) * SEMIBLOCK..i * SEMIBLOCK].copy_from_slice(&block[8..]);
            }
        }
    }

    let len = check_aiv(&a, &padded)?;
    padded.truncate(len);
    Ok(padded)
}

fn xor_counter(a: &mut [u8; SEMIBLOCK], t: u64) {
    for (byte, t_byte) in a.iter_mut().zip(t.to_be_bytes()) {
        *byte ^= t_byte;
    }
}

/// Validate the AIV and return the message length it encodes.
fn check_aiv(aiv: &[u8; SEMIBLOCK], padded: &[u8]) -> Result<usize> {
    let integrity = || ByokError::Wrap("AES-KWP integrity check failed".into());
    if aiv[..4] != AIV_PREFIX {
        return Err(integrity());
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&aiv[4..]);
    let mli = u32::from_be_bytes(len_bytes) as usize;

    // 8 * (n - 1) < MLI <= 8 * n
    let n = padded.len() / SEMIBLOCK;
    if mli <= SEMIBLOCK * (n - 1) || mli > SEMIBLOCK * n {
        return Err(integrity());
    }
    if padded[mli..].iter().any(|&b| b != 0) {
        return Err(integrity());
    }
    Ok(mli)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5649, section 6.
    const KEK_192: &str = "5840df6e29b02af1ab493b705bf16ea1ae8338f4dcc176a8";

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_rfc5649_twenty_octets() {
        let wrapped = wrap(&h(KEK_192), &h("c37b7e6492584340bed12207808941155068f738")).unwrap();
        assert_eq!(
            wrapped,
            h("138bdeaa9b8fa7fc61f97742e72248ee5ae6ae5360d1ae6a5f54f373fa543b6a")
        );
        let plain = unwrap(&h(KEK_192), &wrapped).unwrap();
        assert_eq!(&plain[..], &h("c37b7e6492584340bed12207808941155068f738")[..]);
    }

    #[test]
    fn test_rfc5649_seven_octets() {
        let wrapped = wrap(&h(KEK_192), &h("466f7250617369")).unwrap();
        assert_eq!(wrapped, h("afbeb0f07dfbf5419200f2ccb50bb24f"));
        let plain = unwrap(&h(KEK_192), &wrapped).unwrap();
        assert_eq!(&plain[..], b"ForPasi");
    }

    #[test]
    fn test_wrapped_len_matches_output() {
        let kek = [7u8; 32];
        for len in [1, 8, 9, 32, 1217] {
            let wrapped = wrap(&kek, &vec![0xAB; len]).unwrap();
            assert_eq!(wrapped.len(), wrapped_len(len), "len {}", len);
        }
    }

    #[test]
    fn test_wrong_kek_fails_integrity() {
        let wrapped = wrap(&[1u8; 32], b"private key bytes").unwrap();
        assert!(unwrap(&[2u8; 32], &wrapped).is_err());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let kek = [3u8; 32];
        let mut wrapped = wrap(&kek, b"some longer key material").unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(unwrap(&kek, &wrapped).is_err());
    }

    #[test]
    fn test_rejects_empty_and_bad_lengths() {
        assert!(wrap(&[0u8; 32], b"").is_err());
        assert!(wrap(&[0u8; 20], b"x").is_err());
        assert!(unwrap(&[0u8; 32], &[0u8; 12]).is_err());
    }
}
