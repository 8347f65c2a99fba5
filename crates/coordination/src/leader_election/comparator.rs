use std::cmp::Ordering;
use std::sync::Arc;

use crate::presence::Participant;
use crate::replication::ReplicationCursor;

use super::ElectionState;

/// Orders election candidates; the participant sorting first wins.
///
/// Ties are always broken by participant id.
pub type ParticipantComparator =
    Arc<dyn Fn(&Participant, &Participant) -> Ordering + Send + Sync>;

/// Lowest participant id wins.
#[must_use]
pub fn by_id() -> ParticipantComparator {
    Arc::new(|a, b| a.id.cmp(&b.id))
}

/// Most advanced replication cursor wins, lowest id among equals.
///
/// A participant without a cursor sorts after every participant with one.
#[must_use]
pub fn by_cursor_then_id() -> ParticipantComparator {
    Arc::new(|a, b| {
        let cursor_a = ReplicationCursor::of(&ElectionState::of(a));
        let cursor_b = ReplicationCursor::of(&ElectionState::of(b));

        cursor_b
            .index
            .cmp(&cursor_a.index)
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Sorts `participants` best candidate first.
pub(crate) fn rank(participants: &mut [Participant], comparator: &ParticipantComparator) {
    participants.sort_by(|a, b| comparator(a, b).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};
    use tokio::time::Instant;

    fn participant(id: &str, data: Value) -> Participant {
        Participant {
            id: id.into(),
            state: json!({ "isLeader": false, "data": data }),
            last_seen: Instant::now(),
        }
    }

    fn ids(participants: &[Participant]) -> Vec<&str> {
        participants.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_by_id_prefers_lowest_id() {
        let mut candidates = vec![
            participant("c", Value::Null),
            participant("a", Value::Null),
            participant("b", Value::Null),
        ];

        rank(&mut candidates, &by_id());

        assert_eq!(ids(&candidates), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_by_cursor_prefers_most_advanced() {
        let mut candidates = vec![
            participant("a", json!({ "index": "007" })),
            participant("b", Value::Null),
            participant("c", json!({ "index": "010" })),
            participant("d", json!({ "index": "010" })),
        ];

        rank(&mut candidates, &by_cursor_then_id());

        assert_eq!(ids(&candidates), vec!["c", "d", "a", "b"]);
    }
}
