use shared_types::messages::NonAckMessage;
use shared_types::PeerId;
use std::collections::HashMap;

/// Remembers the last published non-acked counts and reports only changes.
#[derive(Debug, Default)]
pub struct NonAckedCountCache {
    last: HashMap<PeerId, u64>,
}

impl NonAckedCountCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers whose count differs from the previous call, sorted by peer id.
    ///
    /// A peer missing from `counts` is reported once with a zero count.
    pub fn get_updated_values(&mut self, counts: HashMap<PeerId, u64>) -> Vec<NonAckMessage> {
        let mut changed: Vec<NonAckMessage> = self
            .last
            .iter()
            .filter(|(peer_id, last)| **last != 0 && !counts.contains_key(*peer_id))
            .map(|(peer_id, _)| NonAckMessage {
                peer_id: peer_id.clone(),
                count: 0,
            })
            .collect();
        self.last.retain(|peer_id, _| counts.contains_key(peer_id));

        for (peer_id, count) in counts {
            let previous = self.last.insert(peer_id.clone(), count).unwrap_or(0);
            if previous != count {
                changed.push(NonAckMessage { peer_id, count });
            }
        }

        changed.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        changed
    }

    #[must_use]
    pub fn last_count(&self, peer_id: &PeerId) -> Option<u64> {
        self.last.get(peer_id).copied()
    }
}
