//! The transfer engine (§4.4): once a refiner has computed its send-set,
//! this is what turns those ids into `Data`/`Delta` frames (and, on the
//! receiving end, turns incoming ones back into store entries).
//!
//! Grounded on `netsync_core::store::DeltaStore` for the actual
//! content, and on the same send/receive split `tlfs`'s `src/sync.rs`
//! draws between `Command::Broadcast` (push our own causal) and
//! `poll_backend` (ingest what arrived) — generalized here from one
//! CRDT causal per document to one queued id per item category.

use std::collections::{HashSet, VecDeque};

use netsync_core::{
    apply_delta, gzip_compress, gzip_decompress, hash, Command, DeltaStore, Id, ItemCategory,
    NetsyncError,
};

use crate::config::Config;

/// Discovers the file/manifest ids a revision's edges reference, so the
/// transfer engine can follow up a sent/received revision with its
/// content (§4.4: "the sender follows up with the file and manifest
/// content implied by the revision's edges"). Parsing a revision's own
/// serialization is a workspace/roster concern and explicitly out of
/// scope (§1); this is the seam an embedder fills in.
pub trait RevisionIndex {
    /// Ids (file and/or manifest content, both category `File` on the
    /// wire, §3) that `revision_blob` references.
    fn referenced_content(&self, revision_blob: &[u8]) -> Vec<Id>;
}

/// An index that reports no dependent content; revisions travel with no
/// automatic file/manifest follow-up. The default for embedders that
/// either don't store file content at all (a pure metadata peer) or that
/// queue file content themselves via [`TransferEngine::queue_send`].
pub struct NoRevisionIndex;

impl RevisionIndex for NoRevisionIndex {
    fn referenced_content(&self, _revision_blob: &[u8]) -> Vec<Id> {
        Vec::new()
    }
}

/// Per-category bookkeeping driving what this side still owes its peer,
/// and what it has already told (or been told) the peer has.
#[derive(Default)]
struct CategoryQueue {
    to_send: VecDeque<Id>,
    peer_has: HashSet<Id>,
    /// Every id ever handed to [`TransferEngine::queue_send`] for this
    /// category, so the same file/manifest id referenced by more than one
    /// revision is only queued (and sent) once (§4.4: "the sender may
    /// coalesce file content across multiple revisions").
    queued_ever: HashSet<Id>,
    sent: u64,
    received: u64,
}

/// Streams content implied by a refiner's send-set, and ingests content
/// the peer sends (§4.4). One instance per session, one [`CategoryQueue`]
/// per [`ItemCategory`].
pub struct TransferEngine {
    queues: [CategoryQueue; 5],
    out_bytes_inflight: u64,
    in_bytes_inflight: u64,
}

fn slot(category: ItemCategory) -> usize {
    match category {
        ItemCategory::Revision => 0,
        ItemCategory::File => 1,
        ItemCategory::Cert => 2,
        ItemCategory::Key => 3,
        ItemCategory::Epoch => 4,
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self {
            queues: Default::default(),
            out_bytes_inflight: 0,
            in_bytes_inflight: 0,
        }
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, category: ItemCategory) -> &CategoryQueue {
        &self.queues[slot(category)]
    }

    fn queue_mut(&mut self, category: ItemCategory) -> &mut CategoryQueue {
        &mut self.queues[slot(category)]
    }

    /// Enqueue `ids` (a refiner's send-set, or file/manifest content
    /// discovered via a [`RevisionIndex`]) for transmission. Ids already
    /// queued (in this call or an earlier one) are silently skipped.
    pub fn queue_send(&mut self, category: ItemCategory, ids: impl IntoIterator<Item = Id>) {
        let q = self.queue_mut(category);
        for id in ids {
            if q.queued_ever.insert(id) {
                q.to_send.push_back(id);
            }
        }
    }

    /// Record that the peer is known to already have `id` (from
    /// refinement's "peer-has" set, §4.3), so a later `Delta` against it
    /// is legal to send (§4.4 ordering guarantee).
    pub fn note_peer_has(&mut self, category: ItemCategory, id: Id) {
        self.queue_mut(category).peer_has.insert(id);
    }

    /// How many items have been sent in `category` so far.
    pub fn items_sent(&self, category: ItemCategory) -> u64 {
        self.queue(category).sent
    }

    /// How many items have been received in `category` so far.
    pub fn items_received(&self, category: ItemCategory) -> u64 {
        self.queue(category).received
    }

    /// How many items are still queued to send in `category`.
    pub fn pending_send_count(&self, category: ItemCategory) -> usize {
        self.queue(category).to_send.len()
    }

    /// Whether any category still has queued, unsent items.
    pub fn has_pending_sends(&self) -> bool {
        self.queues.iter().any(|q| !q.to_send.is_empty())
    }

    /// Soft cap on bytes queued for output before the session stops
    /// dequeuing new sends (§4.4 back-pressure).
    pub fn send_buffer_full(&self, cfg: &Config) -> bool {
        self.out_bytes_inflight >= cfg.backpressure_soft_cap
    }

    /// Soft cap on decoded-but-unprocessed inbound bytes before the
    /// session stops decoding new frames (§4.4 back-pressure).
    pub fn recv_buffer_full(&self, cfg: &Config) -> bool {
        self.in_bytes_inflight >= cfg.backpressure_soft_cap
    }

    /// Release back-pressure credit for bytes a prior `next_send_command`
    /// queued, once the reactor has actually written them to the socket.
    pub fn note_flushed(&mut self, bytes: u64) {
        self.out_bytes_inflight = self.out_bytes_inflight.saturating_sub(bytes);
    }

    /// Release back-pressure credit for bytes a prior `ingest_data`/
    /// `ingest_delta` counted as inflight, once their content has actually
    /// been written to the store (§4.4: the cap bounds decoded-but-
    /// unprocessed input, not total bytes ever received).
    fn note_consumed(&mut self, bytes: u64) {
        self.in_bytes_inflight = self.in_bytes_inflight.saturating_sub(bytes);
    }

    /// Pop and build one `Data`/`Delta` command for `category`, or `None`
    /// if nothing is queued. The store decides (via `pick_delta_pair`)
    /// whether a delta against something the peer already has is cheaper
    /// than sending the full blob (§4.4 send policy, §4.5).
    pub fn next_send_command(
        &mut self,
        store: &dyn DeltaStore,
        cfg: &Config,
        category: ItemCategory,
    ) -> Result<Option<Command>, NetsyncError> {
        if self.send_buffer_full(cfg) {
            return Ok(None);
        }
        let id = match self.queue_mut(category).to_send.pop_front() {
            Some(id) => id,
            None => return Ok(None),
        };
        let blob = store.get(category, id).map_err(NetsyncError::Store)?;

        // Only file/manifest/roster content is ever sent as a delta
        // (§4.4 send policy): epoch, key, cert and revision items are
        // always `Data`, so a fresh key record is never expressed as an
        // edit against some unrelated, earlier key blob.
        let delta_base = if category == ItemCategory::File {
            store.pick_delta_pair(category, id)
        } else {
            None
        };
        let command = match delta_base {
            Some(base_id) if self.queue(category).peer_has.contains(&base_id) => {
                let base_blob = store.get(category, base_id).map_err(NetsyncError::Store)?;
                let delta = netsync_core::diff(&base_blob, &blob);
                let (compressed, payload) = maybe_compress(&delta, cfg)?;
                Command::Delta {
                    category,
                    base_id,
                    new_id: id,
                    compressed,
                    delta: payload,
                }
            }
            _ => {
                let (compressed, payload) = maybe_compress(&blob, cfg)?;
                Command::Data {
                    category,
                    id,
                    compressed,
                    blob: payload,
                }
            }
        };

        let q = self.queue_mut(category);
        q.sent += 1;
        q.peer_has.insert(id);
        self.out_bytes_inflight += wire_size_estimate(&command);
        Ok(Some(command))
    }

    /// Ingest an incoming `Data` frame: verify content-addressing, store
    /// it, and record it as material the peer (now) knows we have too
    /// (§4.4 receive policy).
    pub fn ingest_data(
        &mut self,
        store: &mut dyn DeltaStore,
        category: ItemCategory,
        id: Id,
        compressed: bool,
        blob: Vec<u8>,
    ) -> Result<Vec<u8>, NetsyncError> {
        let plain = if compressed {
            gzip_decompress(&blob).map_err(NetsyncError::Store)?
        } else {
            blob
        };
        self.in_bytes_inflight += plain.len() as u64;
        if hash(&plain) != id {
            self.note_consumed(plain.len() as u64);
            return Err(NetsyncError::BadEncoding(format!(
                "data hash mismatch for {} in category {}",
                id, category
            )));
        }
        let store_result = store.put_full(category, id, plain.clone());
        self.note_consumed(plain.len() as u64);
        store_result.map_err(NetsyncError::Store)?;
        let q = self.queue_mut(category);
        q.received += 1;
        q.peer_has.insert(id);
        Ok(plain)
    }

    /// Ingest an incoming `Delta` frame: the base must already be
    /// reconstructible locally (§4.4 ordering guarantee: "a base_id
    /// referenced by a Delta has already been sent or was already
    /// known").
    pub fn ingest_delta(
        &mut self,
        store: &mut dyn DeltaStore,
        category: ItemCategory,
        base_id: Id,
        new_id: Id,
        compressed: bool,
        delta: Vec<u8>,
    ) -> Result<Vec<u8>, NetsyncError> {
        if !store.exists(category, base_id) {
            return Err(NetsyncError::BadCommand(
                "received",
                format!(
                    "delta base {} not present for category {}",
                    base_id, category
                ),
            ));
        }
        let plain_delta = if compressed {
            gzip_decompress(&delta).map_err(NetsyncError::Store)?
        } else {
            delta
        };
        self.in_bytes_inflight += plain_delta.len() as u64;
        let put_result = store.put_delta(category, base_id, new_id, plain_delta.clone());
        self.note_consumed(plain_delta.len() as u64);
        put_result.map_err(NetsyncError::Store)?;
        let reconstructed = store.get(category, new_id).map_err(NetsyncError::Store)?;
        if hash(&reconstructed) != new_id {
            return Err(NetsyncError::BadEncoding(format!(
                "reconstructed delta hash mismatch for {} in category {}",
                new_id, category
            )));
        }
        let q = self.queue_mut(category);
        q.received += 1;
        q.peer_has.insert(new_id);
        Ok(reconstructed)
    }
}

fn maybe_compress(bytes: &[u8], cfg: &Config) -> Result<(bool, Vec<u8>), NetsyncError> {
    if bytes.len() >= cfg.gzip_threshold {
        Ok((true, gzip_compress(bytes).map_err(NetsyncError::Store)?))
    } else {
        Ok((false, bytes.to_vec()))
    }
}

fn wire_size_estimate(command: &Command) -> u64 {
    match command {
        Command::Data { blob, .. } => blob.len() as u64,
        Command::Delta { delta, .. } => delta.len() as u64,
        _ => 0,
    }
}

/// Applies a received `Delta` purely in memory, without touching a
/// store — used by tests that want to check §8 Scenario 3's bytewise
/// equality claim directly.
pub fn reconstruct(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, NetsyncError> {
    apply_delta(base, delta).map_err(NetsyncError::Store)
}
