//! The session state machine (§4.2): greeting, authentication,
//! refinement/transfer ("working"), and the three-phase `Bye` shutdown
//! handshake, for one peer relationship.
//!
//! A [`Session`] owns its [`FrameCodec`], its input/output byte buffers,
//! one [`Refiner`] per refined category, and a [`TransferEngine`] — the
//! grouping §2 assigns it. It does no I/O itself; [`crate::reactor`]
//! feeds it bytes and drains its output, the same split `tlfs`'s
//! `Sdk::new` draws between the `Swarm` (I/O) and the `Behaviour` (state
//! machine) it polls.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use netsync_core::{
    decode_public_key, encode_public_key, random_bytes, rsa_oaep_encrypt, rsa_sha1_verify, Cert,
    Command, DeltaStore, Frame, FrameCodec, Id, ItemCategory, NetsyncError, RefineKind, Refiner,
    RefinerMessage, Role, Voice, ID_LEN,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::Config;
use crate::keystore::Keystore;
use crate::policy::Policy;
use crate::transfer::{NoRevisionIndex, RevisionIndex, TransferEngine};

/// §4.2's named states, plus `ErrorFlush` for the "ignore further input,
/// finish draining, close" mode an `Error` frame puts a side into (§4.2
/// "Error frames").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Greeted,
    Authenticating,
    Working,
    Shutdown,
    Confirmed,
    ErrorFlush,
}

/// What the caller should do with the session after feeding it a frame
/// or polling it for idle work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Keep going; more frames may arrive or be sent.
    Continue,
    /// The session reached `Confirmed` (or `ErrorFlush` with an empty
    /// outbound buffer); the reactor should close the socket once the
    /// outbound buffer drains.
    Close,
}

fn can_send(voice: Voice, role: Role) -> bool {
    match (voice, role) {
        (_, Role::SourceAndSink) => true,
        (Voice::Client, Role::Source) => true,
        (Voice::Server, Role::Source) => false,
        (Voice::Client, Role::Sink) => false,
        (Voice::Server, Role::Sink) => true,
    }
}

/// One peer relationship (§2, §3 "Session state"). Generic over the
/// store so embedders can plug in a persistent `DeltaStore` without the
/// core depending on any particular database.
pub struct Session<S: DeltaStore> {
    cfg: Config,
    keystore: Rc<dyn Keystore>,
    policy: Rc<dyn Policy>,
    revision_index: Rc<dyn RevisionIndex>,
    store: Rc<RefCell<S>>,

    codec: FrameCodec,
    inbound: BytesMut,
    outbound: BytesMut,

    voice: Voice,
    state: SessionState,
    role: Role,
    include: String,
    exclude: String,
    peer_key_id: Option<Id>,

    server_nonce: [u8; ID_LEN],
    pending_session_key: Option<[u8; ID_LEN]>,

    refiners: HashMap<ItemCategory, Refiner>,
    done_sent: HashSet<ItemCategory>,
    done_received: HashSet<ItemCategory>,
    transfer: TransferEngine,

    bytes_in: u64,
    bytes_out: u64,
    last_io: Instant,

    bye_sent: Option<u8>,
    bye_received: Option<u8>,
}

impl<S: DeltaStore> Session<S> {
    fn new(
        cfg: Config,
        keystore: Rc<dyn Keystore>,
        policy: Rc<dyn Policy>,
        store: Rc<RefCell<S>>,
        voice: Voice,
        role: Role,
        include: String,
        exclude: String,
        now: Instant,
    ) -> Self {
        Self {
            codec: {
                let mut codec = FrameCodec::new(cfg.max_version, cfg.min_version, cfg.max_version);
                codec.max_payload = cfg.max_payload;
                codec
            },
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            voice,
            state: SessionState::Greeted,
            role,
            include,
            exclude,
            peer_key_id: None,
            server_nonce: [0u8; ID_LEN],
            pending_session_key: None,
            refiners: HashMap::new(),
            done_sent: HashSet::new(),
            done_received: HashSet::new(),
            transfer: TransferEngine::new(),
            bytes_in: 0,
            bytes_out: 0,
            last_io: now,
            bye_sent: None,
            bye_received: None,
            cfg,
            keystore,
            policy,
            revision_index: Rc::new(NoRevisionIndex),
            store,
        }
    }

    /// Start a server-voice session: generates a fresh nonce and queues
    /// the `Hello` frame (§4.2 greeting). The keystore must hold an
    /// identity — the server always identifies itself, even on the
    /// anonymous client path (§4.2: "the server's Hello contains the
    /// server's key name, public key...").
    pub fn server(
        cfg: Config,
        keystore: Rc<dyn Keystore>,
        policy: Rc<dyn Policy>,
        store: Rc<RefCell<S>>,
        now: Instant,
    ) -> Result<Self, NetsyncError> {
        let identity = keystore.identity().ok_or_else(|| {
            NetsyncError::BadCommand("server", "no local identity configured".into())
        })?;
        let mut session = Self::new(
            cfg,
            keystore.clone(),
            policy,
            store,
            Voice::Server,
            Role::SourceAndSink,
            String::new(),
            String::new(),
            now,
        );
        random_bytes(&mut session.server_nonce);
        let hello = Command::Hello {
            server_key_name: identity.key_id().to_string(),
            server_pubkey: encode_public_key(&identity.public()),
            nonce: session.server_nonce,
        };
        session.send(hello);
        session.state = SessionState::Greeted;
        Ok(session)
    }

    /// Start a client-voice session: sends nothing until `Hello` arrives.
    pub fn client(
        cfg: Config,
        keystore: Rc<dyn Keystore>,
        policy: Rc<dyn Policy>,
        store: Rc<RefCell<S>>,
        role: Role,
        include: String,
        exclude: String,
        now: Instant,
    ) -> Self {
        Self::new(cfg, keystore, policy, store, Voice::Client, role, include, exclude, now)
    }

    /// Inject a [`RevisionIndex`] so revisions this side sends/receives
    /// pull in their referenced file/manifest content automatically
    /// (§4.4). Optional: without one, revisions travel alone and an
    /// embedder queues file content itself via direct access to the
    /// store.
    pub fn with_revision_index(mut self, index: Rc<dyn RevisionIndex>) -> Self {
        self.revision_index = index;
        self
    }

    /// The current point in the §4.2 state machine.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Which side of the exchange this session plays (§3/GLOSSARY).
    pub fn voice(&self) -> Voice {
        self.voice
    }

    /// When [`Session::feed`] or [`Session::note_flushed`] last ran, for the
    /// reactor's idle-eviction check (§5).
    pub fn last_io(&self) -> Instant {
        self.last_io
    }

    /// Total bytes fed in via [`Session::feed`] over the session's lifetime.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes flushed out via [`Session::note_flushed`] over the
    /// session's lifetime.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// How many items in `category` this side has sent so far.
    pub fn items_sent(&self, category: ItemCategory) -> u64 {
        self.transfer.items_sent(category)
    }

    /// How many items in `category` this side has received so far.
    pub fn items_received(&self, category: ItemCategory) -> u64 {
        self.transfer.items_received(category)
    }

    /// Whether this session still has content queued to send, in any
    /// category. The reactor uses this to keep calling [`Session::pump_sends`]
    /// on its own — sends aren't only a reaction to inbound frames (§4.6
    /// step 4: "on writable fd: flush as much as the socket accepts").
    pub fn has_pending_sends(&self) -> bool {
        self.transfer.has_pending_sends()
    }

    /// Append freshly-read socket bytes to the session's inbound buffer.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) {
        self.inbound.extend_from_slice(bytes);
        self.bytes_in += bytes.len() as u64;
        self.last_io = now;
    }

    /// Bytes ready to be written to the socket. The reactor calls
    /// [`Session::note_flushed`] once it has actually written them.
    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    /// Record that the reactor actually wrote `n` bytes of [`Session::outbound`]
    /// to the socket, dropping them from the buffer.
    pub fn note_flushed(&mut self, n: usize, now: Instant) {
        Buf::advance(&mut self.outbound, n);
        self.bytes_out += n as u64;
        self.last_io = now;
        self.transfer.note_flushed(n as u64);
    }

    fn send(&mut self, command: Command) {
        // Infallible per the frame codec's contract (§4.1); a full
        // outbound buffer is a back-pressure concern the transfer engine
        // already applies before queuing sends, not an encode-time one.
        self.codec
            .encode(command, &mut self.outbound)
            .expect("frame encoding is infallible");
    }

    fn fail(&mut self, err: NetsyncError) {
        let msg = err.to_wire_message();
        self.send(Command::Error { msg });
        self.state = SessionState::ErrorFlush;
    }

    /// Try to decode one frame from the inbound buffer. `Ok(None)` means
    /// wait for more bytes; a decode error is itself a fatal, wire-visible
    /// condition (§4.1/§7) and is folded into the same error-flush path
    /// `process` uses for in-band protocol violations.
    pub fn poll(&mut self) -> Result<Disposition, NetsyncError> {
        loop {
            if self.state == SessionState::ErrorFlush || self.state == SessionState::Confirmed {
                return Ok(if self.outbound.is_empty() {
                    Disposition::Close
                } else {
                    Disposition::Continue
                });
            }
            if self.transfer.recv_buffer_full(&self.cfg) {
                return Ok(Disposition::Continue);
            }
            let frame = match self.codec.decode(&mut self.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(Disposition::Continue),
                Err(err) => {
                    self.fail(err);
                    return Ok(Disposition::Continue);
                }
            };
            self.process(frame);
            self.pump_sends();
        }
    }

    /// Each frame is processed inside its own transaction boundary (§4.6,
    /// §7): a dispatch that errors out rolls back whatever store writes it
    /// already made (e.g. `handle_delta`'s `put_delta` running before the
    /// reconstructed-hash check fails, §4.4) rather than leaving a partial,
    /// inconsistent write behind (§3 invariant 4, §8 property 5).
    fn process(&mut self, frame: Frame) {
        self.store.borrow_mut().begin_transaction();
        match self.dispatch(frame) {
            Ok(()) => self.store.borrow_mut().commit(),
            Err(err) => {
                self.store.borrow_mut().rollback();
                self.fail(err);
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), NetsyncError> {
        if let Command::Error { msg } = &frame.command {
            tracing::warn!(peer_error = %msg, "peer sent Error frame");
            self.state = SessionState::ErrorFlush;
            return Ok(());
        }

        // A client that has already sent its own Bye(0) is only
        // half-closed: it's done sending, but the server may still be
        // draining its own queue before replying Bye(1) (§4.2, and the
        // drain-before-reply behavior in `maybe_shutdown`). Refine/Done/
        // Data/Delta frames can legitimately keep arriving until then, so
        // a client in `Shutdown` still accepts them exactly as it would
        // in `Working`. The server never needs this forbearance: by the
        // time it reaches `Shutdown` it has both drained its own queue
        // and seen the client's Bye(0), so the client has nothing left
        // to send it.
        let accepts_working_frames = self.state == SessionState::Working
            || (self.state == SessionState::Shutdown && self.voice == Voice::Client);

        match (self.state, self.voice, &frame.command) {
            (SessionState::Greeted, Voice::Client, Command::Hello { .. }) => {
                self.handle_hello(frame.command)
            }
            (SessionState::Greeted, Voice::Server, Command::Anonymous { .. }) => {
                self.handle_anonymous(frame.command)
            }
            (SessionState::Greeted, Voice::Server, Command::Auth { .. }) => {
                self.handle_auth(frame.command)
            }
            (SessionState::Authenticating, Voice::Client, Command::Confirm) => {
                if let Some(key) = self.pending_session_key.take() {
                    self.codec.install_session_key(key);
                }
                self.enter_working();
                Ok(())
            }
            (_, _, Command::Refine { kind, node }) if accepts_working_frames => {
                self.handle_refine(*kind, node.clone())
            }
            (_, _, Command::Done { category, n_items }) if accepts_working_frames => {
                self.handle_done(*category, *n_items)
            }
            (_, _, Command::Data { category, id, compressed, blob }) if accepts_working_frames => {
                self.handle_data(*category, *id, *compressed, blob.clone())
            }
            (_, _, Command::Delta { category, base_id, new_id, compressed, delta }) if accepts_working_frames => {
                self.handle_delta(*category, *base_id, *new_id, *compressed, delta.clone())
            }
            (SessionState::Working, Voice::Server, Command::Bye { phase: 0 }) => {
                // Only the client initiates shutdown (§4.2). The server
                // doesn't reply with Bye(1) yet if it still has queued
                // sends of its own — it must finish draining first
                // (§4.2 "having drained its own outgoing queue"); that
                // happens in `pump_sends`/`maybe_shutdown` once the
                // transfer engine's queues empty out.
                self.bye_received = Some(0);
                self.maybe_shutdown();
                Ok(())
            }
            (SessionState::Shutdown, Voice::Client, Command::Bye { phase: 1 }) => {
                self.bye_received = Some(1);
                self.send(Command::Bye { phase: 2 });
                self.bye_sent = Some(2);
                self.state = SessionState::Confirmed;
                Ok(())
            }
            (SessionState::Shutdown, Voice::Server, Command::Bye { phase: 2 }) => {
                self.bye_received = Some(2);
                self.state = SessionState::Confirmed;
                Ok(())
            }
            (_, _, Command::Bye { phase }) => Err(NetsyncError::BadCommand(
                "bye",
                format!("phase {} not valid from state {:?}", phase, self.state),
            )),
            (SessionState::Working, _, Command::Automate { .. })
            | (SessionState::Working, _, Command::AutomateCmd { .. })
            | (SessionState::Working, _, Command::AutomatePacket { .. }) => {
                // Automate query language passthrough: out of scope
                // (§1); the wire command is recognized so an extended
                // peer doesn't trip BadCode, but nothing is served.
                self.send(Command::Error {
                    msg: NetsyncError::NoTransfer("automate").to_wire_message(),
                });
                Ok(())
            }
            (_, _, Command::Usher { .. }) => {
                self.send(Command::UsherReply { payload: Vec::new() });
                Ok(())
            }
            (state, voice, command) => Err(NetsyncError::BadCommand(
                "unexpected",
                format!("{:?} in state {:?} (voice {:?})", command.code(), state, voice),
            )),
        }
    }

    fn handle_hello(&mut self, command: Command) -> Result<(), NetsyncError> {
        let (server_pubkey, nonce) = match command {
            Command::Hello { server_pubkey, nonce, .. } => (server_pubkey, nonce),
            _ => unreachable!(),
        };
        let pubkey = decode_public_key(&server_pubkey)
            .map_err(|e| NetsyncError::FailedIdentification("hello", e.to_string()))?;
        self.server_nonce = nonce;

        let mut session_key = [0u8; ID_LEN];
        random_bytes(&mut session_key);
        let encrypted = rsa_oaep_encrypt(&pubkey, &session_key)
            .map_err(|e| NetsyncError::FailedIdentification("hello", e.to_string()))?;
        self.pending_session_key = Some(session_key);

        let command = if let Some(identity) = self.keystore.identity() {
            let signature = identity
                .sign_sha1(&nonce)
                .map_err(|e| NetsyncError::FailedIdentification("auth", e.to_string()))?;
            Command::Auth {
                role: self.role,
                include: self.include.clone(),
                exclude: self.exclude.clone(),
                client_key_id: identity.key_id(),
                nonce_echo: nonce,
                rsa_oaep_key: encrypted,
                signature,
            }
        } else {
            Command::Anonymous {
                role: self.role,
                include: self.include.clone(),
                exclude: self.exclude.clone(),
                rsa_oaep_key: encrypted,
            }
        };
        self.send(command);
        self.state = SessionState::Authenticating;
        Ok(())
    }

    fn accept_session_key(
        &mut self,
        role: Role,
        include: String,
        exclude: String,
        peer_key_id: Option<Id>,
        rsa_oaep_key: &[u8],
    ) -> Result<(), NetsyncError> {
        if !self.policy.permit_role(peer_key_id, role, &include, &exclude) {
            return Err(NetsyncError::RoleMismatch("auth"));
        }
        let identity = self
            .keystore
            .identity()
            .expect("server() requires an identity");
        let plain = identity
            .decrypt_oaep(rsa_oaep_key)
            .map_err(|e| NetsyncError::FailedIdentification("auth", e.to_string()))?;
        if plain.len() != ID_LEN {
            return Err(NetsyncError::BadEncoding(
                "decrypted session key material has the wrong length".into(),
            ));
        }
        let mut key = [0u8; ID_LEN];
        key.copy_from_slice(&plain);
        self.role = role;
        self.include = include;
        self.exclude = exclude;
        self.peer_key_id = peer_key_id;
        // `Confirm` itself goes out unauthenticated, same as the client reads
        // it before installing its own key (line 354-357) — both read/write
        // chains start from zero on the first frame *after* Confirm.
        self.send(Command::Confirm);
        self.codec.install_session_key(key);
        self.enter_working();
        Ok(())
    }

    fn handle_anonymous(&mut self, command: Command) -> Result<(), NetsyncError> {
        let (role, include, exclude, rsa_oaep_key) = match command {
            Command::Anonymous { role, include, exclude, rsa_oaep_key } => {
                (role, include, exclude, rsa_oaep_key)
            }
            _ => unreachable!(),
        };
        self.accept_session_key(role, include, exclude, None, &rsa_oaep_key)
    }

    fn handle_auth(&mut self, command: Command) -> Result<(), NetsyncError> {
        let (role, include, exclude, client_key_id, nonce_echo, rsa_oaep_key, signature) =
            match command {
                Command::Auth {
                    role,
                    include,
                    exclude,
                    client_key_id,
                    nonce_echo,
                    rsa_oaep_key,
                    signature,
                } => (role, include, exclude, client_key_id, nonce_echo, rsa_oaep_key, signature),
                _ => unreachable!(),
            };
        if nonce_echo != self.server_nonce {
            return Err(NetsyncError::FailedIdentification(
                "auth",
                "nonce echo does not match".into(),
            ));
        }
        let client_pubkey = self.keystore.public_key(client_key_id).ok_or_else(|| {
            NetsyncError::UnknownKey("auth", client_key_id.to_string())
        })?;
        rsa_sha1_verify(&client_pubkey, &nonce_echo, &signature)
            .map_err(|e| NetsyncError::FailedIdentification("auth", e.to_string()))?;
        self.accept_session_key(role, include, exclude, Some(client_key_id), &rsa_oaep_key)
    }

    fn enter_working(&mut self) {
        self.state = SessionState::Working;
        let store = self.store.borrow();
        for category in ItemCategory::REFINED {
            let mut refiner = Refiner::new(category, self.voice);
            for id in store.ids_in_category(category) {
                if self.policy.in_scope(&id.to_string()) {
                    refiner.note_local_item(id);
                }
            }
            self.refiners.insert(category, refiner);
        }
        drop(store);
        if self.voice == Voice::Client {
            let categories: Vec<ItemCategory> = self.refiners.keys().copied().collect();
            for category in categories {
                let messages = self.refiners.get_mut(&category).unwrap().begin_refinement();
                self.emit_refiner_messages(category, messages);
            }
        }
    }

    fn emit_refiner_messages(&mut self, category: ItemCategory, messages: Vec<RefinerMessage>) {
        for message in messages {
            match message {
                RefinerMessage::Refine { kind, node } => {
                    self.send(Command::Refine { kind, node });
                }
                RefinerMessage::Done { n_items } => {
                    self.done_sent.insert(category);
                    self.send(Command::Done { category, n_items });
                }
            }
        }
    }

    fn handle_refine(
        &mut self,
        kind: RefineKind,
        node: netsync_core::MerkleNodeWire,
    ) -> Result<(), NetsyncError> {
        let category = node.category;
        let refiner = self.refiners.get_mut(&category).ok_or_else(|| {
            NetsyncError::BadCommand("refine", format!("no refiner for category {}", category))
        })?;
        let messages = refiner.process_refinement(kind, node);
        self.emit_refiner_messages(category, messages);
        Ok(())
    }

    fn handle_done(&mut self, category: ItemCategory, n_items: u64) -> Result<(), NetsyncError> {
        self.done_received.insert(category);
        let refiner = self.refiners.get_mut(&category).ok_or_else(|| {
            NetsyncError::BadCommand("done", format!("no refiner for category {}", category))
        })?;
        let messages = refiner.process_done(n_items);
        self.emit_refiner_messages(category, messages);
        self.queue_sends_for(category);
        self.maybe_shutdown();
        Ok(())
    }

    fn queue_sends_for(&mut self, category: ItemCategory) {
        let refiner = match self.refiners.get(&category) {
            Some(r) if r.is_done() => r,
            _ => return,
        };
        if !can_send(self.voice, self.role) {
            return;
        }
        let ids: Vec<Id> = refiner.items_to_send().iter().copied().collect();
        self.transfer.queue_send(category, ids);
    }

    fn handle_data(
        &mut self,
        category: ItemCategory,
        id: Id,
        compressed: bool,
        blob: Vec<u8>,
    ) -> Result<(), NetsyncError> {
        // Receiving a revision does not, by itself, queue anything for
        // this side to send: the sender is the one with the file/manifest
        // content on hand, and follows up on its own initiative once the
        // revision has left (§4.4, handled in `pump_sends`). This side
        // just waits for that follow-up traffic.
        let mut store = self.store.borrow_mut();
        let plain = self.transfer.ingest_data(&mut *store, category, id, compressed, blob)?;
        drop(store);
        if category == ItemCategory::Cert {
            self.verify_incoming_cert(&plain)?;
        }
        self.maybe_shutdown();
        Ok(())
    }

    /// §3 invariant 3 / §4.4 receive policy: "a received cert is
    /// additionally signature-verified; failure is a protocol error."
    /// Content-addressing (the blob's hash matching the frame's id) was
    /// already checked by `ingest_data`; this checks the cert's own
    /// signature against the public key its `signer` field names.
    fn verify_incoming_cert(&self, blob: &[u8]) -> Result<(), NetsyncError> {
        let cert = Cert::decode(blob)
            .map_err(|e| NetsyncError::BadEncoding(format!("malformed cert: {}", e)))?;
        let signer_key = self.keystore.public_key(cert.signer).ok_or_else(|| {
            NetsyncError::UnknownKey("cert", cert.signer.to_string())
        })?;
        rsa_sha1_verify(&signer_key, &cert.signed_message(), &cert.signature)
            .map_err(|e| NetsyncError::FailedIdentification("cert", e.to_string()))
    }

    fn handle_delta(
        &mut self,
        category: ItemCategory,
        base_id: Id,
        new_id: Id,
        compressed: bool,
        delta: Vec<u8>,
    ) -> Result<(), NetsyncError> {
        let mut store = self.store.borrow_mut();
        self.transfer
            .ingest_delta(&mut *store, category, base_id, new_id, compressed, delta)?;
        drop(store);
        self.maybe_shutdown();
        Ok(())
    }

    /// Send one queued `Data`/`Delta` command per refined-and-complete
    /// category per call, respecting back-pressure (§4.4). The reactor
    /// calls this after every processed frame and on idle ticks so sends
    /// interleave with incoming traffic rather than blocking on it.
    pub fn pump_sends(&mut self) {
        if self.state != SessionState::Working {
            return;
        }
        let categories: Vec<ItemCategory> =
            [ItemCategory::Revision, ItemCategory::File, ItemCategory::Cert, ItemCategory::Key, ItemCategory::Epoch]
                .into_iter()
                .collect();
        for category in categories {
            if self.transfer.send_buffer_full(&self.cfg) {
                break;
            }
            let store = self.store.borrow();
            match self.transfer.next_send_command(&*store, &self.cfg, category) {
                Ok(Some(command)) => {
                    // A revision that just left queues its referenced
                    // file/manifest content behind it (§4.4: "the sender
                    // follows up with the file and manifest content
                    // implied by the revision's edges"). Queued here,
                    // on the sending side, right after the revision
                    // itself is sent — never on the receiving side,
                    // which has no content to offer.
                    if category == ItemCategory::Revision {
                        let sent_id = match &command {
                            Command::Data { id, .. } => Some(*id),
                            Command::Delta { new_id, .. } => Some(*new_id),
                            _ => None,
                        };
                        let plain = sent_id.and_then(|id| store.get(category, id).ok());
                        drop(store);
                        if let Some(plain) = plain {
                            let referenced = self.revision_index.referenced_content(&plain);
                            self.transfer.queue_send(ItemCategory::File, referenced);
                        }
                    } else {
                        drop(store);
                    }
                    self.send(command);
                }
                Ok(None) => {}
                Err(err) => {
                    drop(store);
                    self.fail(err);
                    return;
                }
            }
        }
        self.maybe_shutdown();
    }

    fn refinement_complete(&self) -> bool {
        ItemCategory::REFINED
            .iter()
            .all(|c| self.done_sent.contains(c) && self.done_received.contains(c))
    }

    /// Drives the shutdown-handshake side of §4.2 whenever new work
    /// finishes. Each voice only watches its own half:
    /// - the client sends `Bye(0)` once refinement is complete and it has
    ///   nothing left queued to send;
    /// - the server, once it has received `Bye(0)`, waits until its own
    ///   queue is equally drained before replying `Bye(1)` — otherwise a
    ///   server with file/manifest content still in flight when the
    ///   client finishes would have that content silently dropped the
    ///   instant it entered `Shutdown`.
    fn maybe_shutdown(&mut self) {
        if self.state != SessionState::Working || self.bye_sent.is_some() {
            return;
        }
        match self.voice {
            Voice::Client => {
                if self.refinement_complete() && !self.transfer.has_pending_sends() {
                    self.send(Command::Bye { phase: 0 });
                    self.bye_sent = Some(0);
                    self.state = SessionState::Shutdown;
                }
            }
            Voice::Server => {
                if self.bye_received == Some(0) && !self.transfer.has_pending_sends() {
                    self.send(Command::Bye { phase: 1 });
                    self.bye_sent = Some(1);
                    self.state = SessionState::Shutdown;
                }
            }
        }
    }

    /// Whether this session has been idle (no bytes in either direction)
    /// longer than the configured eviction timeout (§5).
    pub fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_io) >= self.cfg.idle_timeout
    }

    /// Force the session into the error-flush path without sending a
    /// wire `Error` frame, matching §5's "idle timeout disconnects do
    /// not produce an Error frame".
    pub fn disconnect_silently(&mut self) {
        self.outbound.clear();
        self.state = SessionState::ErrorFlush;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::InMemoryKeystore;
    use crate::policy::AllowAll;
    use netsync_core::{hash as core_hash, InMemoryStore, RsaKeypair};
    use std::rc::Rc;
    use std::time::Duration;

    fn drive(
        client: &mut Session<InMemoryStore>,
        server: &mut Session<InMemoryStore>,
    ) {
        let now = Instant::now();
        for _ in 0..200 {
            let mut progressed = false;
            let from_client: Vec<u8> = client.outbound().to_vec();
            if !from_client.is_empty() {
                server.feed(&from_client, now);
                client.note_flushed(from_client.len(), now);
                progressed = true;
            }
            let from_server: Vec<u8> = server.outbound().to_vec();
            if !from_server.is_empty() {
                client.feed(&from_server, now);
                server.note_flushed(from_server.len(), now);
                progressed = true;
            }
            client.poll().unwrap();
            server.poll().unwrap();
            client.pump_sends();
            server.pump_sends();
            if !progressed
                && client.outbound().is_empty()
                && server.outbound().is_empty()
                && client.state() == SessionState::Confirmed
                && server.state() == SessionState::Confirmed
            {
                break;
            }
        }
    }

    fn anonymous_pair(
        client_store: InMemoryStore,
        server_store: InMemoryStore,
    ) -> (Session<InMemoryStore>, Session<InMemoryStore>) {
        let server_identity = RsaKeypair::generate(1024).unwrap();
        let server_keystore: Rc<dyn Keystore> =
            Rc::new(InMemoryKeystore::with_identity(server_identity));
        let client_keystore: Rc<dyn Keystore> = Rc::new(InMemoryKeystore::new());
        let policy: Rc<dyn Policy> = Rc::new(AllowAll);
        let now = Instant::now();

        let server = Session::server(
            Config::default(),
            server_keystore,
            policy.clone(),
            Rc::new(RefCell::new(server_store)),
            now,
        )
        .unwrap();
        let client = Session::client(
            Config::default(),
            client_keystore,
            policy,
            Rc::new(RefCell::new(client_store)),
            Role::SourceAndSink,
            "*".to_string(),
            "".to_string(),
            now,
        );
        (client, server)
    }

    #[test]
    fn empty_pull_produces_no_data_frames() {
        let (mut client, mut server) = anonymous_pair(InMemoryStore::new(), InMemoryStore::new());
        drive(&mut client, &mut server);
        assert_eq!(client.state(), SessionState::Confirmed);
        assert_eq!(server.state(), SessionState::Confirmed);
        for category in ItemCategory::REFINED {
            assert_eq!(client.items_sent(category), 0);
            assert_eq!(server.items_sent(category), 0);
        }
    }

    #[test]
    fn one_revision_push_reaches_the_server() {
        let mut client_store = InMemoryStore::new();
        let revision_blob = b"revision bytes".to_vec();
        let revision_id = core_hash(&revision_blob);
        client_store
            .put_full(ItemCategory::Revision, revision_id, revision_blob.clone())
            .unwrap();

        let (mut client, mut server) = anonymous_pair(client_store, InMemoryStore::new());
        drive(&mut client, &mut server);

        assert_eq!(client.state(), SessionState::Confirmed);
        assert_eq!(server.state(), SessionState::Confirmed);
        assert_eq!(client.items_sent(ItemCategory::Revision), 1);
        assert_eq!(server.items_received(ItemCategory::Revision), 1);
    }

    #[test]
    fn well_signed_cert_is_accepted() {
        let signer = RsaKeypair::generate(1024).unwrap();
        let cert = netsync_core::Cert {
            revision_id: core_hash(b"some revision"),
            name: "branch".to_string(),
            value: b"net.venge.netsync".to_vec(),
            signer: signer.key_id(),
            signature: signer.sign_sha1(&netsync_core::Cert {
                revision_id: core_hash(b"some revision"),
                name: "branch".to_string(),
                value: b"net.venge.netsync".to_vec(),
                signer: signer.key_id(),
                signature: Vec::new(),
            }.signed_message()).unwrap(),
        };
        let cert_id = cert.id();

        let mut client_store = InMemoryStore::new();
        client_store
            .put_full(ItemCategory::Cert, cert_id, cert.encode())
            .unwrap();

        let server_identity = RsaKeypair::generate(1024).unwrap();
        let mut server_keystore = InMemoryKeystore::with_identity(server_identity);
        server_keystore.trust_peer(signer.key_id(), signer.public());
        let server_keystore: Rc<dyn Keystore> = Rc::new(server_keystore);
        let client_keystore: Rc<dyn Keystore> = Rc::new(InMemoryKeystore::new());
        let policy: Rc<dyn Policy> = Rc::new(AllowAll);
        let now = Instant::now();

        let mut server = Session::server(
            Config::default(),
            server_keystore,
            policy.clone(),
            Rc::new(RefCell::new(InMemoryStore::new())),
            now,
        )
        .unwrap();
        let mut client = Session::client(
            Config::default(),
            client_keystore,
            policy,
            Rc::new(RefCell::new(client_store)),
            Role::SourceAndSink,
            "*".to_string(),
            "".to_string(),
            now,
        );

        drive(&mut client, &mut server);

        assert_eq!(server.state(), SessionState::Confirmed);
        assert_eq!(server.items_received(ItemCategory::Cert), 1);
    }

    #[test]
    fn cert_with_bad_signature_is_rejected() {
        let signer = RsaKeypair::generate(1024).unwrap();
        let impostor = RsaKeypair::generate(1024).unwrap();
        let cert = netsync_core::Cert {
            revision_id: core_hash(b"some revision"),
            name: "branch".to_string(),
            value: b"net.venge.netsync".to_vec(),
            signer: signer.key_id(),
            // Signed by the wrong key: the signature won't verify against
            // the public key the `signer` field names.
            signature: impostor
                .sign_sha1(
                    &netsync_core::Cert {
                        revision_id: core_hash(b"some revision"),
                        name: "branch".to_string(),
                        value: b"net.venge.netsync".to_vec(),
                        signer: signer.key_id(),
                        signature: Vec::new(),
                    }
                    .signed_message(),
                )
                .unwrap(),
        };
        let cert_id = cert.id();

        let mut client_store = InMemoryStore::new();
        client_store
            .put_full(ItemCategory::Cert, cert_id, cert.encode())
            .unwrap();

        let server_identity = RsaKeypair::generate(1024).unwrap();
        let mut server_keystore = InMemoryKeystore::with_identity(server_identity);
        server_keystore.trust_peer(signer.key_id(), signer.public());
        let server_keystore: Rc<dyn Keystore> = Rc::new(server_keystore);
        let client_keystore: Rc<dyn Keystore> = Rc::new(InMemoryKeystore::new());
        let policy: Rc<dyn Policy> = Rc::new(AllowAll);
        let now = Instant::now();

        let mut server = Session::server(
            Config::default(),
            server_keystore,
            policy.clone(),
            Rc::new(RefCell::new(InMemoryStore::new())),
            now,
        )
        .unwrap();
        let mut client = Session::client(
            Config::default(),
            client_keystore,
            policy,
            Rc::new(RefCell::new(client_store)),
            Role::SourceAndSink,
            "*".to_string(),
            "".to_string(),
            now,
        );

        drive(&mut client, &mut server);

        assert_eq!(server.state(), SessionState::ErrorFlush);
        assert_eq!(server.items_received(ItemCategory::Cert), 0);
    }

    #[test]
    fn identical_sets_send_nothing_but_still_confirm() {
        let mut store = InMemoryStore::new();
        let blob = b"shared revision".to_vec();
        let id = core_hash(&blob);
        store.put_full(ItemCategory::Revision, id, blob).unwrap();
        let client_store = {
            let mut s = InMemoryStore::new();
            s.put_full(ItemCategory::Revision, id, b"shared revision".to_vec()).unwrap();
            s
        };
        let server_store = {
            let mut s = InMemoryStore::new();
            s.put_full(ItemCategory::Revision, id, b"shared revision".to_vec()).unwrap();
            s
        };
        let (mut client, mut server) = anonymous_pair(client_store, server_store);
        drive(&mut client, &mut server);
        assert_eq!(client.items_sent(ItemCategory::Revision), 0);
        assert_eq!(server.items_sent(ItemCategory::Revision), 0);
    }

    #[test]
    fn mac_corruption_is_rejected_and_neither_side_commits() {
        // §8 Scenario 4: a single bit flipped in transit, once the chained
        // MAC is active, must fail the receiver's check cleanly rather than
        // silently corrupt its store.
        let mut client_store = InMemoryStore::new();
        let revision_blob = b"revision bytes".to_vec();
        let revision_id = core_hash(&revision_blob);
        client_store
            .put_full(ItemCategory::Revision, revision_id, revision_blob)
            .unwrap();

        let (mut client, mut server) = anonymous_pair(client_store, InMemoryStore::new());
        let now = Instant::now();
        let mut corrupted_once = false;

        for _ in 0..200 {
            let from_client: Vec<u8> = client.outbound().to_vec();
            if !from_client.is_empty() {
                client.note_flushed(from_client.len(), now);
                // Wait until the handshake has installed a synchronized MAC
                // chain on both sides (client reaches `Working`), then tamper
                // with the very next frame the client emits.
                if client.state() == SessionState::Working && !corrupted_once {
                    corrupted_once = true;
                    let mut tampered = from_client.clone();
                    let last = tampered.len() - 1;
                    tampered[last] ^= 0x01;
                    server.feed(&tampered, now);
                } else {
                    server.feed(&from_client, now);
                }
            }
            let from_server: Vec<u8> = server.outbound().to_vec();
            if !from_server.is_empty() {
                server.note_flushed(from_server.len(), now);
                client.feed(&from_server, now);
            }
            let _ = client.poll();
            let _ = server.poll();
            client.pump_sends();
            server.pump_sends();
            if server.state() == SessionState::ErrorFlush {
                break;
            }
        }

        assert_eq!(server.state(), SessionState::ErrorFlush);
        assert_eq!(server.items_received(ItemCategory::Revision), 0);
    }

    #[test]
    fn idle_session_reports_idle_after_the_configured_timeout() {
        let (client, _server) = anonymous_pair(InMemoryStore::new(), InMemoryStore::new());
        let start = client.last_io();
        assert!(!client.is_idle(start));
        let well_past_timeout = start + Config::default().idle_timeout + Duration::from_secs(1);
        assert!(client.is_idle(well_past_timeout));
    }

    #[test]
    fn idle_eviction_closes_without_an_error_frame() {
        // §8 Scenario 5: eviction is a silent close, not a wire-visible
        // Error — the peer observes an unclean disconnect, nothing more.
        let (mut client, _server) = anonymous_pair(InMemoryStore::new(), InMemoryStore::new());
        client.disconnect_silently();
        assert_eq!(client.state(), SessionState::ErrorFlush);
        assert!(client.outbound().is_empty());
    }

    #[test]
    fn role_mismatch_is_rejected() {
        struct DenySource;
        impl Policy for DenySource {
            fn permit_role(&self, _peer_key: Option<Id>, role: Role, _include: &str, _exclude: &str) -> bool {
                !matches!(role, Role::Source)
            }
            fn in_scope(&self, _name: &str) -> bool {
                true
            }
        }

        let server_identity = RsaKeypair::generate(1024).unwrap();
        let server_keystore: Rc<dyn Keystore> =
            Rc::new(InMemoryKeystore::with_identity(server_identity));
        let client_keystore: Rc<dyn Keystore> = Rc::new(InMemoryKeystore::new());
        let now = Instant::now();

        let mut server = Session::server(
            Config::default(),
            server_keystore,
            Rc::new(DenySource),
            Rc::new(RefCell::new(InMemoryStore::new())),
            now,
        )
        .unwrap();
        let mut client = Session::client(
            Config::default(),
            client_keystore,
            Rc::new(AllowAll),
            Rc::new(RefCell::new(InMemoryStore::new())),
            Role::Source,
            "*".to_string(),
            "".to_string(),
            now,
        );

        let from_server = server.outbound().to_vec();
        client.feed(&from_server, now);
        server.note_flushed(from_server.len(), now);
        client.poll().unwrap();

        let from_client = client.outbound().to_vec();
        server.feed(&from_client, now);
        client.note_flushed(from_client.len(), now);
        server.poll().unwrap();

        assert_eq!(server.state(), SessionState::ErrorFlush);
    }
}
