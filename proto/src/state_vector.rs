use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Timestamp;

/// Causal frontier: for each client id, the greatest tick observed.
///
/// "Everything at or below `tick` from this client has been seen." A client
/// absent from the vector has been seen at no tick at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<String, u64>);

impl StateVector {
    pub fn new() -> Self { Self::default() }

    pub fn tick(&self, client_id: &str) -> Option<u64> { self.0.get(client_id).copied() }

    /// True iff the timestamp is at or below this frontier.
    pub fn includes(&self, timestamp: &Timestamp) -> bool {
        match self.0.get(&timestamp.client_id) {
            Some(tick) => timestamp.tick <= *tick,
            None => false,
        }
    }

    /// Raise the frontier for a client, never lowering it.
    pub fn observe(&mut self, timestamp: &Timestamp) {
        let entry = self.0.entry(timestamp.client_id.clone()).or_insert(timestamp.tick);
        if timestamp.tick > *entry {
            *entry = timestamp.tick;
        }
    }

    pub fn set(&mut self, client_id: impl Into<String>, tick: u64) { self.0.insert(client_id.into(), tick); }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> { self.0.iter() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromIterator<(String, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self { Self(iter.into_iter().collect()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_respects_frontier() {
        let mut sv = StateVector::new();
        sv.set("a", 5);
        assert!(sv.includes(&Timestamp::new(5, "a")));
        assert!(sv.includes(&Timestamp::new(1, "a")));
        assert!(!sv.includes(&Timestamp::new(6, "a")));
        assert!(!sv.includes(&Timestamp::new(1, "b")));
    }

    #[test]
    fn observe_never_lowers() {
        let mut sv = StateVector::new();
        sv.observe(&Timestamp::new(3, "a"));
        sv.observe(&Timestamp::new(1, "a"));
        assert_eq!(sv.tick("a"), Some(3));
    }
}
