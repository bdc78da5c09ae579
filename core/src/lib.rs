//! Netsync core: frame codec, session crypto, merkle-tree set
//! reconciliation and delta-chain storage for a peer-to-peer
//! synchronization protocol.
//!
//! - [`frame`] — length-prefixed, HMAC-chained command frames on the wire.
//! - [`crypto`] — the hash/HMAC/RSA/gzip primitives frames and sessions build on.
//! - [`merkle`] — set reconciliation between two peers' item sets.
//! - [`store`] — the delta-chain storage abstraction and its reference backend.
//! - [`id`] — content-addressable identifiers and the item category enum.
//! - [`cert`] — the signed-assertion record carried in `Cert`-category blobs.
//! - [`error`] — the protocol's wire-visible error taxonomy.
#![warn(missing_docs)]

mod cert;
mod crypto;
mod error;
mod frame;
mod id;
mod merkle;
mod store;
mod varint;

pub use crate::cert::Cert;
pub use crate::crypto::{
    decode_public_key, encode_public_key, gzip_compress, gzip_decompress, hash, random_bytes,
    rsa_oaep_decrypt, rsa_oaep_encrypt, rsa_sha1_sign, rsa_sha1_verify, ChainedHmac, RsaKeypair,
};
pub use crate::error::NetsyncError;
pub use crate::frame::{
    Command, Frame, FrameCodec, MerkleNodeWire, Role, RefineKind, SlotWire, DEFAULT_MAX_PAYLOAD,
};
pub use crate::id::{Id, ItemCategory, ID_LEN};
pub use crate::merkle::{Refiner, RefinerMessage, Voice};
pub use crate::store::{apply_delta, bump_epoch, diff, DeltaStore, InMemoryStore};
