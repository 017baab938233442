//! Synthetic identities for repeating items

/// Allocates item identities for one session.
///
/// Identities are `<session prefix>-<sequence>`; the sequence only moves
/// forward, so an identity is never handed out twice, even across resets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemIdentities {
    prefix: String,
    next: u64,
}

impl ItemIdentities {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 0,
        }
    }

    /// Allocator with a random session prefix
    pub fn random() -> Self {
        Self::new(&uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn allocate(&mut self) -> String {
        let id = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        id
    }

    /// Number of identities handed out so far
    pub fn issued(&self) -> u64 {
        self.next
    }
}

impl Default for ItemIdentities {
    fn default() -> Self {
        Self::random()
    }
}
