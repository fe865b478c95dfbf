//! Duplicate sightings of an already-known task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Side-channel counter for re-discovered ids.
///
/// `count` is the number of *extra* sightings: the first re-discovery creates the
/// record with `count = 1`. It is never a queue entry and never tied to a task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub id: TaskId,
    pub target: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DuplicateRecord {
    pub fn first_sighting(id: TaskId, target: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            target: target.into(),
            count: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn record_sighting(&mut self, now: DateTime<Utc>) {
        self.count += 1;
        self.last_seen = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sightings_bump_count_and_last_seen() {
        let t0 = Utc::now();
        let mut rec = DuplicateRecord::first_sighting(TaskId::new("x/1"), "https://x/x/1", t0);
        assert_eq!(rec.count, 1);

        let t1 = t0 + Duration::seconds(5);
        rec.record_sighting(t1);
        assert_eq!(rec.count, 2);
        assert_eq!(rec.first_seen, t0);
        assert_eq!(rec.last_seen, t1);
    }
}
