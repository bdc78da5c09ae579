//! Netsync: a peer-to-peer synchronization endpoint built on
//! [`netsync_core`]'s frame codec, merkle refiner and delta store.
//!
//! This crate supplies the collaborators `netsync_core` leaves abstract
//! (keystore, policy, transfer engine), the connection state machine that
//! drives them ([`session`]), and the single-threaded reactor that owns a
//! TCP listener and a set of sessions ([`reactor`]).
//!
//! Embedding applications typically only need [`Config`], a [`Keystore`]
//! and [`Policy`] implementation, a [`netsync_core::DeltaStore`]
//! implementation, and [`reactor::Reactor`].
#![deny(missing_docs)]

pub mod config;
pub mod keystore;
pub mod policy;
pub mod reactor;
pub mod session;
pub mod transfer;

pub use crate::config::Config;
pub use crate::keystore::{InMemoryKeystore, Keystore};
pub use crate::policy::{AllowAll, GlobPolicy, Policy};
pub use crate::reactor::{drive_session, PeerAddress, Reactor};
pub use crate::session::{Disposition, Session, SessionState};
pub use crate::transfer::{NoRevisionIndex, RevisionIndex, TransferEngine};

pub use netsync_core::{
    Command, DeltaStore, Frame, FrameCodec, Id, InMemoryStore, ItemCategory, NetsyncError,
    Role, RsaKeypair, Voice,
};
