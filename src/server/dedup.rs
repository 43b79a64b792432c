//! Duplicate-suppression table for at-most-once writes.

use std::collections::HashMap;

use crate::client::ClientId;
use crate::server::SeqId;

/// Per-server map from client ID -> (last accepted sequence number, reply
/// value of that write). An entry `(s, v)` for client `c` means every write
/// from `c` numbered `<= s` has been applied exactly once, and its reply was
/// `v`.
#[derive(Debug, Default)]
pub struct DedupTable {
    last: HashMap<ClientId, (SeqId, String)>,
}

impl DedupTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        DedupTable {
            last: HashMap::new(),
        }
    }

    /// If the write `(client, seq)` has already been applied, returns the
    /// recorded reply that must be handed back instead of re-applying it.
    pub fn lookup(&self, client: ClientId, seq: SeqId) -> Option<&str> {
        match self.last.get(&client) {
            Some((last_seq, reply)) if seq <= *last_seq => Some(reply),
            _ => None,
        }
    }

    /// Records `(client, seq)` as applied with the given reply.
    pub fn record(&mut self, client: ClientId, seq: SeqId, reply: String) {
        self.last.insert(client, (seq, reply));
    }
}

#[cfg(test)]
mod dedup_tests {
    use super::*;

    #[test]
    fn unseen_client() {
        let table = DedupTable::new();
        assert_eq!(table.lookup(77, 1), None);
        assert_eq!(table.lookup(77, 0), None);
    }

    #[test]
    fn retry_returns_recorded() {
        let mut table = DedupTable::new();
        table.record(77, 3, "a".into());
        assert_eq!(table.lookup(77, 3), Some("a"));
        assert_eq!(table.lookup(77, 2), Some("a"));
        assert_eq!(table.lookup(77, 4), None);
        assert_eq!(table.lookup(78, 3), None);
    }

    #[test]
    fn record_advances() {
        let mut table = DedupTable::new();
        table.record(5, 1, "".into());
        table.record(5, 2, "x".into());
        table.record(6, 1, "y".into());
        assert_eq!(table.lookup(5, 2), Some("x"));
        assert_eq!(table.lookup(5, 1), Some("x"));
        assert_eq!(table.lookup(6, 1), Some("y"));
    }
}
