//! Why a unit was cancelled.
//!
//! A cancelled call reports one of these instead of the raw socket error
//! its forced close produced.

use core::fmt;

/// Who asked for the cancellation.
///
/// Ordered by precedence: when several requests reach the same unit, the
/// recorded reason is the greatest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Application code gave up on the call.
    User,
    /// Server side only: the client hung up while its call was being served.
    PeerGone,
    /// The server is going away.
    Shutdown,
}

impl CancelKind {
    const fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::PeerGone => "peer gone",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A cancel kind plus an optional static note, e.g. which button was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelReason {
    kind: CancelKind,
    note: Option<&'static str>,
}

impl CancelReason {
    /// A reason of `kind` without a note.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self { kind, note: None }
    }

    /// A user cancellation carrying `note`.
    #[must_use]
    pub const fn user(note: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            note: Some(note),
        }
    }

    /// The client behind a served call disconnected.
    #[must_use]
    pub const fn peer_gone() -> Self {
        Self::new(CancelKind::PeerGone)
    }

    /// The server is shutting down.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Merges a later request into this one.
    ///
    /// A higher kind replaces the reason outright. For the same kind the
    /// first note sticks; a note only fills a gap. Returns true if anything
    /// changed.
    pub fn strengthen(&mut self, later: &Self) -> bool {
        if later.kind > self.kind {
            *self = *later;
            return true;
        }
        if later.kind == self.kind && self.note.is_none() && later.note.is_some() {
            self.note = later.note;
            return true;
        }
        false
    }

    /// The kind.
    #[must_use]
    pub const fn kind(&self) -> CancelKind {
        self.kind
    }

    /// The note, if one was given.
    #[must_use]
    pub const fn note(&self) -> Option<&'static str> {
        self.note
    }

    /// True for [`CancelKind::Shutdown`].
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, CancelKind::Shutdown)
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.note {
            Some(note) => write!(f, "{}: {note}", self.kind),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}
