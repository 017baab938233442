//! Transient and dismissible messages shown beside a form

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// An add was refused; clears itself
    AddBlocked,
    /// A relation store call failed; stays until dismissed
    RelationError,
    /// Informational feedback; clears itself
    Info,
}

impl NoticeKind {
    fn expires(&self) -> bool {
        !matches!(self, Self::RelationError)
    }
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub message: String,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

impl Notice {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Queue of notices for one session
#[derive(Debug, Clone)]
pub struct Notices {
    items: Vec<Notice>,
    next_id: u64,
    ttl: Duration,
}

impl Notices {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
            ttl,
        }
    }

    pub fn push(&mut self, kind: NoticeKind, message: impl Into<String>) -> u64 {
        self.push_at(kind, message, Instant::now())
    }

    pub fn push_at(&mut self, kind: NoticeKind, message: impl Into<String>, now: Instant) -> u64 {
        self.prune(now);
        let id = self.next_id;
        self.next_id += 1;
        let expires_at = kind.expires().then(|| now + self.ttl);
        self.items.push(Notice {
            id,
            kind,
            message: message.into(),
            created_at: now,
            expires_at,
        });
        id
    }

    /// Remove a notice. Returns false when it was already gone.
    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|n| n.id != id);
        self.items.len() != before
    }

    /// Drop notices whose delay has passed
    pub fn prune(&mut self, now: Instant) {
        self.items.retain(|n| !n.is_expired_at(now));
    }

    /// Notices still showing now. Expired ones are hidden even before a prune.
    pub fn active(&self) -> Vec<&Notice> {
        self.active_at(Instant::now())
    }

    pub fn active_at(&self, now: Instant) -> Vec<&Notice> {
        self.items.iter().filter(|n| !n.is_expired_at(now)).collect()
    }

    pub fn latest(&self, kind: NoticeKind) -> Option<&Notice> {
        let now = Instant::now();
        self.items
            .iter()
            .rev()
            .find(|n| n.kind == kind && !n.is_expired_at(now))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
