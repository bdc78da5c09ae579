//! Merkle-tree set reconciliation (§4.3): a 16-way trie over id prefixes,
//! and the query/response refinement protocol that lets two peers learn
//! the symmetric difference of their item sets without exchanging them.
//!
//! Grounded directly on the original's `refiner.cc`: `note_local_item`,
//! `calculate_items_to_send` (`std::set_difference`), the asymmetric
//! leaf/subtree tie-break rules in `process_refinement_command`, and the
//! `queries_in_flight` bookkeeping that drives the client's `Done`
//! transition. Unlike the original, slot contents are derived on demand
//! from a sorted set of ids rather than kept in an incrementally
//! maintained trie table — `BTreeSet::range` over a 20-byte id gives the
//! same prefix-bucketing a hand-maintained trie would, without a
//! parallel reindexing step (`reindex_local_items` in the original has no
//! counterpart here: there is nothing to reindex).

use crate::crypto::hash;
use crate::frame::{MerkleNodeWire, RefineKind, SlotWire};
use crate::id::{Id, ItemCategory, ID_LEN};
use std::collections::BTreeSet;

/// Which side of a refinement a [`Refiner`] plays. The client always
/// initiates (§4.3: "the client kicks the process off") and is the side
/// that ultimately sends the first `Done`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Voice {
    Client,
    Server,
}

/// One message a [`Refiner`] wants sent to the peer, in response to
/// `begin_refinement`/`process_refinement`/`process_done`.
#[derive(Clone, Debug, PartialEq)]
pub enum RefinerMessage {
    Refine { kind: RefineKind, node: MerkleNodeWire },
    Done { n_items: u64 },
}

fn pack_nibbles(nibbles: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((nibbles.len() + 1) / 2);
    for pair in nibbles.chunks(2) {
        let hi = pair[0];
        let lo = pair.get(1).copied().unwrap_or(0);
        out.push((hi << 4) | lo);
    }
    out
}

fn unpack_nibbles(bytes: &[u8], level: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(level);
    for i in 0..level {
        let byte = bytes[i / 2];
        out.push(if i % 2 == 0 { byte >> 4 } else { byte & 0x0f });
    }
    out
}

/// Inclusive `(low, high)` bounds on the 20-byte id space occupied by
/// everything sharing `nibbles` as a prefix.
fn bounds(nibbles: &[u8]) -> (Id, Id) {
    let mut low = [0u8; ID_LEN];
    let mut high = [0xffu8; ID_LEN];
    for i in 0..ID_LEN {
        let hi = nibbles.get(i * 2).copied();
        let lo = nibbles.get(i * 2 + 1).copied();
        low[i] = (hi.unwrap_or(0) << 4) | lo.unwrap_or(0);
        high[i] = (hi.unwrap_or(0xf) << 4) | lo.unwrap_or(0xf);
    }
    (Id::new(low), Id::new(high))
}

fn subtree_digest<'a>(ids: impl Iterator<Item = &'a Id>) -> Id {
    let mut bytes = Vec::new();
    for id in ids {
        bytes.extend_from_slice(id.as_bytes());
    }
    hash(&bytes)
}

/// Reconciles one item category's local set against a peer's, over a
/// sequence of `Refine`/`Done` exchanges (§4.3/§4.2).
pub struct Refiner {
    category: ItemCategory,
    voice: Voice,
    local_items: BTreeSet<Id>,
    peer_items: BTreeSet<Id>,
    queries_in_flight: u64,
    calculated: bool,
    items_to_send: BTreeSet<Id>,
    items_to_receive: u64,
    done: bool,
}

impl Refiner {
    pub fn new(category: ItemCategory, voice: Voice) -> Self {
        Self {
            category,
            voice,
            local_items: BTreeSet::new(),
            peer_items: BTreeSet::new(),
            queries_in_flight: 0,
            calculated: false,
            items_to_send: BTreeSet::new(),
            items_to_receive: 0,
            done: false,
        }
    }

    pub fn note_local_item(&mut self, id: Id) {
        self.local_items.insert(id);
    }

    pub fn category(&self) -> ItemCategory {
        self.category
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn items_to_send(&self) -> &BTreeSet<Id> {
        &self.items_to_send
    }

    pub fn items_to_receive(&self) -> u64 {
        self.items_to_receive
    }

    fn node_for(&self, level: u8, nibbles: &[u8]) -> MerkleNodeWire {
        let mut slots: [SlotWire; 16] = Default::default();
        for (slot, entry) in slots.iter_mut().enumerate() {
            let mut child = nibbles.to_vec();
            child.push(slot as u8);
            let (lo, hi) = bounds(&child);
            let mut range = self.local_items.range(lo..=hi);
            *entry = match (range.next(), range.next()) {
                (None, _) => SlotWire::Empty,
                (Some(id), None) => SlotWire::Leaf(*id),
                (Some(_), Some(_)) => {
                    let digest = subtree_digest(self.local_items.range(lo..=hi));
                    SlotWire::Subtree(digest)
                }
            };
        }
        MerkleNodeWire {
            level,
            prefix_bits: pack_nibbles(nibbles),
            category: self.category,
            slots,
        }
    }

    /// Kick off refinement by queuing a query on the root node (§4.3:
    /// "the client kicks the process off by sending a query refinement
    /// for the root node").
    pub fn begin_refinement(&mut self) -> Vec<RefinerMessage> {
        let root = self.node_for(0, &[]);
        self.queries_in_flight += 1;
        vec![RefinerMessage::Refine {
            kind: RefineKind::Query,
            node: root,
        }]
    }

    fn calculate_items_to_send(&mut self) {
        if self.calculated {
            return;
        }
        self.items_to_send = self
            .local_items
            .difference(&self.peer_items)
            .copied()
            .collect();
        self.calculated = true;
    }

    /// Handle an incoming `Refine` frame, returning whatever messages
    /// (subqueries, a response, and/or a trailing `Done`) it provokes.
    pub fn process_refinement(
        &mut self,
        kind: RefineKind,
        their_node: MerkleNodeWire,
    ) -> Vec<RefinerMessage> {
        let their_prefix = unpack_nibbles(&their_node.prefix_bits, their_node.level as usize);
        let our_node = self.node_for(their_node.level, &their_prefix);
        let mut out = Vec::new();

        for slot in 0..16usize {
            if let SlotWire::Leaf(their_id) = their_node.slots[slot] {
                self.peer_items.insert(their_id);
            }

            if kind == RefineKind::Query {
                match (&their_node.slots[slot], &our_node.slots[slot]) {
                    (SlotWire::Leaf(_), SlotWire::Subtree(_)) => {
                        let mut child_prefix = their_prefix.clone();
                        child_prefix.push(slot as u8);
                        let subnode = self.node_for(their_node.level + 1, &child_prefix);
                        out.push(RefinerMessage::Refine {
                            kind: RefineKind::Query,
                            node: subnode,
                        });
                        self.queries_in_flight += 1;
                    }
                    (SlotWire::Subtree(_), SlotWire::Leaf(our_id)) => {
                        let our_id = *our_id;
                        let subslot = our_id.nibble(their_node.level as usize + 1);
                        let mut child_prefix = their_prefix.clone();
                        child_prefix.push(slot as u8);
                        let mut synth_slots: [SlotWire; 16] = Default::default();
                        synth_slots[subslot as usize] = SlotWire::Leaf(our_id);
                        let synth = MerkleNodeWire {
                            level: their_node.level + 1,
                            prefix_bits: pack_nibbles(&child_prefix),
                            category: self.category,
                            slots: synth_slots,
                        };
                        out.push(RefinerMessage::Refine {
                            kind: RefineKind::Query,
                            node: synth,
                        });
                        self.queries_in_flight += 1;
                    }
                    _ => {}
                }
            }

            if let (SlotWire::Subtree(their_hash), SlotWire::Subtree(our_hash)) =
                (&their_node.slots[slot], &our_node.slots[slot])
            {
                if their_hash == our_hash {
                    let mut child_prefix = their_prefix.clone();
                    child_prefix.push(slot as u8);
                    let (lo, hi) = bounds(&child_prefix);
                    let shared: Vec<Id> = self.local_items.range(lo..=hi).copied().collect();
                    self.peer_items.extend(shared);
                } else if kind == RefineKind::Query {
                    let mut child_prefix = their_prefix.clone();
                    child_prefix.push(slot as u8);
                    let subnode = self.node_for(their_node.level + 1, &child_prefix);
                    out.push(RefinerMessage::Refine {
                        kind: RefineKind::Query,
                        node: subnode,
                    });
                    self.queries_in_flight += 1;
                }
            }
        }

        match kind {
            RefineKind::Response => {
                assert!(self.queries_in_flight > 0, "underflow on query-in-flight counter");
                self.queries_in_flight -= 1;
                if self.voice == Voice::Client && self.queries_in_flight == 0 {
                    self.calculate_items_to_send();
                    out.push(RefinerMessage::Done {
                        n_items: self.items_to_send.len() as u64,
                    });
                }
            }
            RefineKind::Query => {
                out.push(RefinerMessage::Refine {
                    kind: RefineKind::Response,
                    node: our_node,
                });
            }
        }

        out
    }

    /// Handle an incoming `Done` frame. The server echoes its own `Done`
    /// (§4.3: "when the server receives a done command, it echoes it
    /// back"); the client just finalizes.
    pub fn process_done(&mut self, n_items: u64) -> Vec<RefinerMessage> {
        self.calculate_items_to_send();
        self.items_to_receive = n_items;
        self.done = true;
        tracing::debug!(
            category = ?self.category,
            to_send = self.items_to_send.len(),
            to_receive = n_items,
            "refinement done"
        );
        match self.voice {
            Voice::Server => vec![RefinerMessage::Done {
                n_items: self.items_to_send.len() as u64,
            }],
            Voice::Client => vec![],
        }
    }
}
