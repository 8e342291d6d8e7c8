use serde::{Deserialize, Serialize};

/// Hybrid-logical timestamp: `(tick, client_id)` compared lexicographically.
///
/// The derived `Ord` gives exactly that order - tick first, client id as the
/// tiebreaker - so two clients can never produce equal timestamps for
/// distinct writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub tick: u64,
    pub client_id: String,
}

impl Timestamp {
    pub fn new(tick: u64, client_id: impl Into<String>) -> Self { Self { tick, client_id: client_id.into() } }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}@{}", self.tick, self.client_id) }
}

impl From<(u64, &str)> for Timestamp {
    fn from((tick, client_id): (u64, &str)) -> Self { Self::new(tick, client_id) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_order() {
        let a = Timestamp::new(1, "b");
        let b = Timestamp::new(2, "a");
        let c = Timestamp::new(2, "b");
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }
}
