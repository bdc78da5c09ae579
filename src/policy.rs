//! The policy collaborator (§6.3): governs whether a peer's requested
//! role and include/exclude globs are permitted. Policy *bodies*
//! (the rules an operator writes) are out of scope (§1); this is the
//! interface a session calls into plus a permissive default.

use globset::{Glob, GlobSet, GlobSetBuilder};
use netsync_core::{Id, Role};

/// Decides whether a peer may open a session with a given role and
/// glob selection, and whether a specific branch/key is in scope once
/// connected.
pub trait Policy: Send + Sync {
    /// Called once at `Anonymous`/`Auth` time (§4.2).
    fn permit_role(&self, peer_key: Option<Id>, role: Role, include: &str, exclude: &str) -> bool;

    /// Called per branch-name-like item during refinement to decide
    /// whether it falls within the negotiated include/exclude globs.
    fn in_scope(&self, name: &str) -> bool;
}

/// Grants every role to every peer and scopes nothing out — the
/// permissive default an embedder overrides with real rules.
pub struct AllowAll;

impl Policy for AllowAll {
    fn permit_role(&self, _peer_key: Option<Id>, _role: Role, _include: &str, _exclude: &str) -> bool {
        true
    }

    fn in_scope(&self, _name: &str) -> bool {
        true
    }
}

/// A policy that applies a single include/exclude glob pair to every
/// peer, ignoring what they ask for (`PeerAddress`'s include/exclude
/// suffix is the usual source of these patterns).
pub struct GlobPolicy {
    include: GlobSet,
    exclude: GlobSet,
}

impl GlobPolicy {
    /// Compile `include`/`exclude` glob pattern lists; fails if any
    /// pattern is malformed.
    pub fn new(include: &[String], exclude: &[String]) -> anyhow::Result<Self> {
        let build = |patterns: &[String]| -> anyhow::Result<GlobSet> {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                builder.add(Glob::new(pattern)?);
            }
            Ok(builder.build()?)
        };
        Ok(Self {
            include: build(include)?,
            exclude: build(exclude)?,
        })
    }
}

impl Policy for GlobPolicy {
    fn permit_role(&self, _peer_key: Option<Id>, _role: Role, _include: &str, _exclude: &str) -> bool {
        true
    }

    fn in_scope(&self, name: &str) -> bool {
        (self.include.is_empty() || self.include.is_match(name)) && !self.exclude.is_match(name)
    }
}
