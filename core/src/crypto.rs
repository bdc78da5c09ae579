//! Crypto collaborator (§6.3): `hash`, `hmac`, `rsa_oaep_*`, `rsa_sha1_*`,
//! `gzip_*`. Each primitive is named by algorithm; this module is the one
//! place that names `sha1`/`rsa`/`flate2` concretely so a different
//! backend can be swapped in behind the same free functions.

use crate::id::Id;
use anyhow::{Context, Result};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use hmac::{Hmac, Mac};
use rsa::{BigUint, PaddingScheme, PublicKey, PublicKeyParts, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::convert::TryInto;
use std::io::Read;

type HmacSha1 = Hmac<Sha1>;

/// `hash(bytes) -> 20-byte id` (§6.3). Content-addressing digest; a
/// collision here is a storage-invariant violation (§3 invariant 1), not a
/// security property the protocol otherwise depends on.
pub fn hash(bytes: &[u8]) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    Id::new(digest.into())
}

/// The chained HMAC described in §4.1: each authenticated frame's MAC
/// input is `chain_val || frame_bytes`, and the resulting tag both
/// authenticates the frame and becomes `chain_val` for the next one.
/// Mirrors the original's `chained_hmac` (`hmac.cc`): one instance per
/// direction, `active` until key agreement completes.
#[derive(Clone)]
pub struct ChainedHmac {
    key: [u8; 20],
    chain_val: [u8; 20],
    active: bool,
}

impl ChainedHmac {
    /// A fresh chain keyed with the fixed pre-agreement constant (all
    /// zero bytes), inactive until `set_key` installs the real session key.
    pub fn new_inactive() -> Self {
        Self {
            key: [0u8; 20],
            chain_val: [0u8; 20],
            active: false,
        }
    }

    pub fn set_key(&mut self, key: [u8; 20]) {
        self.key = key;
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Process `frame_bytes`, returning the new chain value (also the MAC
    /// tag for this frame). Panics if called while inactive; callers must
    /// check `is_active` first, matching the `I(active)` assertion in the
    /// original.
    pub fn process(&mut self, frame_bytes: &[u8]) -> [u8; 20] {
        assert!(self.active, "chained hmac processed while inactive");
        let mut mac = HmacSha1::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&self.chain_val);
        mac.update(frame_bytes);
        let tag: [u8; 20] = mac.finalize().into_bytes().into();
        self.chain_val = tag;
        tag
    }
}

/// An RSA keypair used for both `rsa_oaep_*` key-exchange and `rsa_sha1_*`
/// signing, matching the single-keypair-per-identity model the original
/// protocol assumes (§4.2 auth path: one key both encrypts the session MAC
/// key and signs the server's nonce).
pub struct RsaKeypair {
    private: RsaPrivateKey,
}

impl RsaKeypair {
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = rand_core_compat::OsRngCompat;
        let private = RsaPrivateKey::new(&mut rng, bits).context("generating RSA keypair")?;
        Ok(Self { private })
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        Self { private }
    }

    pub fn public(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private)
    }

    /// Stable identifier for this key: the content hash of its encoded
    /// public key bytes.
    pub fn key_id(&self) -> Id {
        hash(&encode_public_key(&self.public()))
    }

    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        rsa_oaep_decrypt(&self.private, ciphertext)
    }

    pub fn sign_sha1(&self, message: &[u8]) -> Result<Vec<u8>> {
        rsa_sha1_sign(&self.private, message)
    }
}

/// Encode an RSA public key as `len(n) ++ n_be ++ len(e) ++ e_be`, each
/// length a 4-byte big-endian prefix. Deliberately not a standard
/// ASN.1/PKCS encoding: no byte-exact compatibility with any reference
/// format is required (§1 Non-goals), only that both ends of this
/// implementation agree, so the simplest unambiguous framing suffices.
pub fn encode_public_key(key: &RsaPublicKey) -> Vec<u8> {
    let n = key.n().to_bytes_be();
    let e = key.e().to_bytes_be();
    let mut out = Vec::with_capacity(8 + n.len() + e.len());
    out.extend_from_slice(&(n.len() as u32).to_be_bytes());
    out.extend_from_slice(&n);
    out.extend_from_slice(&(e.len() as u32).to_be_bytes());
    out.extend_from_slice(&e);
    out
}

pub fn decode_public_key(bytes: &[u8]) -> Result<RsaPublicKey> {
    if bytes.len() < 8 {
        anyhow::bail!("public key encoding truncated");
    }
    let n_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut pos = 4;
    anyhow::ensure!(bytes.len() >= pos + n_len + 4, "public key encoding truncated");
    let n = BigUint::from_bytes_be(&bytes[pos..pos + n_len]);
    pos += n_len;
    let e_len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    anyhow::ensure!(bytes.len() >= pos + e_len, "public key encoding truncated");
    let e = BigUint::from_bytes_be(&bytes[pos..pos + e_len]);
    RsaPublicKey::new(n, e).context("reconstructing RSA public key")
}

pub fn rsa_oaep_encrypt(pubkey: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand_core_compat::OsRngCompat;
    pubkey
        .encrypt(&mut rng, PaddingScheme::new_oaep::<Sha1>(), plaintext)
        .context("rsa-oaep encrypt")
}

pub fn rsa_oaep_decrypt(privkey: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    privkey
        .decrypt(PaddingScheme::new_oaep::<Sha1>(), ciphertext)
        .context("rsa-oaep decrypt")
}

pub fn rsa_sha1_sign(privkey: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>> {
    let digest = {
        let mut hasher = Sha1::new();
        hasher.update(message);
        hasher.finalize()
    };
    let padding = PaddingScheme::new_pkcs1v15_sign(Some(rsa::Hash::SHA1));
    privkey.sign(padding, &digest).context("rsa-sha1 sign")
}

pub fn rsa_sha1_verify(pubkey: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let digest = {
        let mut hasher = Sha1::new();
        hasher.update(message);
        hasher.finalize()
    };
    let padding = PaddingScheme::new_pkcs1v15_sign(Some(rsa::Hash::SHA1));
    pubkey
        .verify(padding, &digest, signature)
        .context("rsa-sha1 verify")
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).context("gzip compress")?;
    Ok(out)
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).context("gzip decompress")?;
    Ok(out)
}

/// `rsa` 0.6 wants a `rand_core` 0.6 `RngCore + CryptoRng`. `getrandom` is
/// already the project's source of randomness (nonces, keys); this adapter
/// avoids pulling in the `rand` crate just for its `OsRng` type.
mod rand_core_compat {
    pub struct OsRngCompat;

    impl rand_core::RngCore for OsRngCompat {
        fn next_u32(&mut self) -> u32 {
            let mut buf = [0u8; 4];
            getrandom::getrandom(&mut buf).expect("getrandom");
            u32::from_ne_bytes(buf)
        }

        fn next_u64(&mut self) -> u64 {
            let mut buf = [0u8; 8];
            getrandom::getrandom(&mut buf).expect("getrandom");
            u64::from_ne_bytes(buf)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            getrandom::getrandom(dest).expect("getrandom");
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            getrandom::getrandom(dest).map_err(rand_core::Error::new)
        }
    }

    impl rand_core::CryptoRng for OsRngCompat {}
}

/// Fill `dest` with fresh random bytes, used for session nonces and HMAC
/// key material.
pub fn random_bytes(dest: &mut [u8]) {
    getrandom::getrandom(dest).expect("getrandom");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"hello"), hash(b"hello"));
        assert_ne!(hash(b"hello"), hash(b"world"));
    }

    #[test]
    fn chained_hmac_diverges_on_reorder() {
        let key = [7u8; 20];
        let mut a = ChainedHmac::new_inactive();
        a.set_key(key);
        let mut b = a.clone();

        let f1 = b"frame-one";
        let f2 = b"frame-two";

        let tag_a1 = a.process(f1);
        let tag_a2 = a.process(f2);

        // swap order on b: chain breaks.
        let tag_b1 = b.process(f2);
        let tag_b2 = b.process(f1);

        assert_ne!(tag_a1, tag_b1);
        assert_ne!(tag_a2, tag_b2);
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let compressed = gzip_compress(&data).unwrap();
        let decompressed = gzip_decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn rsa_oaep_round_trips() {
        let keypair = RsaKeypair::generate(1024).unwrap();
        let plaintext = b"session hmac key material!!";
        let ciphertext = rsa_oaep_encrypt(&keypair.public(), plaintext).unwrap();
        let decrypted = keypair.decrypt_oaep(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rsa_sha1_sign_verify_round_trips() {
        let keypair = RsaKeypair::generate(1024).unwrap();
        let message = b"server nonce echoed back";
        let sig = keypair.sign_sha1(message).unwrap();
        rsa_sha1_verify(&keypair.public(), message, &sig).unwrap();
        assert!(rsa_sha1_verify(&keypair.public(), b"tampered", &sig).is_err());
    }

    #[test]
    fn public_key_encoding_round_trips() {
        let keypair = RsaKeypair::generate(1024).unwrap();
        let bytes = encode_public_key(&keypair.public());
        let decoded = decode_public_key(&bytes).unwrap();
        assert_eq!(decoded.n(), keypair.public().n());
        assert_eq!(decoded.e(), keypair.public().e());
    }
}
