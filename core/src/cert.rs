//! Cert records (§3: "cert: signed assertion about a revision"):
//! `(revision_id, name, value, signer, signature)`, identified by the hash
//! of all five fields (§3, §6.1's per-category bullet). Certs travel on the
//! wire as an ordinary `Data` blob in category [`crate::ItemCategory::Cert`]
//! (§4.4); this module is only the encoding the blob bytes carry and the
//! signed-message convention a verifier needs to check it, not a new wire
//! command.
//!
//! Signature verification itself (§3 invariant 3: "every cert verifies
//! against the public key identified by its signer field", §4.4 receive
//! policy: "a received cert is additionally signature-verified") needs a
//! [`crate::Keystore`]-like lookup this crate has no business owning
//! (§1 keeps keystore layout out of scope) — [`Cert::signed_message`] and
//! [`crate::rsa_sha1_verify`] are the two halves a caller combines.

use crate::id::{Id, ID_LEN};
use crate::varint;
use anyhow::{bail, ensure, Result};
use std::convert::TryFrom;

/// A decoded cert record. The wire blob for a `Data(Cert, id, ...)` frame
/// is exactly [`Cert::encode`]'s output, and `id` is `hash` of that same
/// encoding (ordinary content-addressing, §3 invariant 1 — no special case
/// for certs there).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cert {
    pub revision_id: Id,
    pub name: String,
    pub value: Vec<u8>,
    pub signer: Id,
    pub signature: Vec<u8>,
}

fn write_vstring(s: &str, out: &mut Vec<u8>) {
    varint::encode(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn write_vbytes(bytes: &[u8], out: &mut Vec<u8>) {
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

impl Cert {
    /// The bytes a signer signs and a verifier checks the signature
    /// against: every field except the signature itself (signing one's
    /// own signature is circular; the original's `cert::signable_text`
    /// draws the same line).
    pub fn signed_message(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.revision_id.as_bytes());
        write_vstring(&self.name, &mut out);
        write_vbytes(&self.value, &mut out);
        out.extend_from_slice(self.signer.as_bytes());
        out
    }

    /// The full wire encoding, including the signature: `signed_message()`
    /// followed by a length-prefixed signature. This is what a `Data(Cert,
    /// ...)` frame carries as its blob, and `hash` of it is the cert's id
    /// (§3: "identified by the hash of (revision-id, name, value, signer,
    /// signature)" — all five fields, signature included).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.signed_message();
        write_vbytes(&self.signature, &mut out);
        out
    }

    /// This cert's content-addressed id: `hash(self.encode())`.
    pub fn id(&self) -> Id {
        crate::crypto::hash(&self.encode())
    }

    /// Parse a cert blob as produced by [`Cert::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut rest = bytes;
        ensure!(rest.len() >= ID_LEN, "cert blob truncated: revision_id");
        let (revision_id_bytes, tail) = rest.split_at(ID_LEN);
        let revision_id = Id::try_from(revision_id_bytes)?;
        rest = tail;

        let name = read_vstring(&mut rest)?;
        let value = read_vbytes(&mut rest)?;

        ensure!(rest.len() >= ID_LEN, "cert blob truncated: signer");
        let (signer_bytes, tail) = rest.split_at(ID_LEN);
        let signer = Id::try_from(signer_bytes)?;
        rest = tail;

        let signature = read_vbytes(&mut rest)?;
        ensure!(rest.is_empty(), "cert blob has trailing bytes");

        Ok(Cert {
            revision_id,
            name,
            value,
            signer,
            signature,
        })
    }
}

fn read_vbytes(rest: &mut &[u8]) -> Result<Vec<u8>> {
    let len = varint::decode(rest)?.ok_or_else(|| anyhow::anyhow!("truncated varint length"))?
        as usize;
    if rest.len() < len {
        bail!("truncated bytes field: wanted {}, have {}", len, rest.len());
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head.to_vec())
}

fn read_vstring(rest: &mut &[u8]) -> Result<String> {
    let bytes = read_vbytes(rest)?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Cert {
        Cert {
            revision_id: Id::new([7u8; ID_LEN]),
            name: "branch".to_string(),
            value: b"net.venge.monotone".to_vec(),
            signer: Id::new([9u8; ID_LEN]),
            signature: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let cert = sample();
        let blob = cert.encode();
        let decoded = Cert::decode(&blob).unwrap();
        assert_eq!(decoded, cert);
    }

    #[test]
    fn id_is_content_addressed() {
        let cert = sample();
        assert_eq!(cert.id(), crate::crypto::hash(&cert.encode()));
    }

    #[test]
    fn signed_message_excludes_the_signature() {
        let mut a = sample();
        let b = {
            let mut c = sample();
            c.signature = vec![9, 9, 9];
            c
        };
        a.signature = vec![1];
        assert_eq!(a.signed_message(), b.signed_message());
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let cert = sample();
        let blob = cert.encode();
        assert!(Cert::decode(&blob[..blob.len() - 1]).is_err());
    }
}
