// Consumer Group Tracker
//
// Keeps the next offset to deliver for every (topic, group) pair.
// Cursors are created lazily at zero and only move forward after a read.
// Delivery is at-least-once: a crash after records are handed out but
// before the advanced cursor is persisted replays them on the next consume.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::log::Offset;
use crate::persist;
use crate::topic::TopicId;

/// File holding every committed cursor, relative to the data directory.
pub const OFFSETS_FILE: &str = "consumer_offsets.json";

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("offset store i/o: {0}")]
    Io(#[from] io::Error),
}

type CursorKey = (TopicId, String);

/// Persisted form of one cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OffsetEntry {
    topic_id: TopicId,
    group: String,
    next_offset: Offset,
}

/// A consumer group's position on one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCursor {
    pub group_id: String,
    pub next_offset: Offset,
}

pub struct ConsumerGroupTracker {
    store: Option<PathBuf>,
    cursors: Mutex<HashMap<CursorKey, Arc<Mutex<Offset>>>>,
    /// Always locked after the cursor map or a cursor, never before.
    state: Mutex<CommitState>,
    /// Version of the last snapshot that reached disk. Held only for the
    /// duration of one offsets file write.
    written: Mutex<u64>,
}

#[derive(Default)]
struct CommitState {
    /// Mirror of every cursor's value, in a stable order for persisting.
    offsets: BTreeMap<CursorKey, Offset>,
    /// Topics purged while this tracker is open. Their cursors are never
    /// committed again.
    retired: HashSet<TopicId>,
    /// Bumped on every change to `offsets`.
    version: u64,
}

impl CommitState {
    fn entries(&self) -> Vec<OffsetEntry> {
        self.offsets
            .iter()
            .map(|((topic_id, group), next_offset)| OffsetEntry {
                topic_id: *topic_id,
                group: group.clone(),
                next_offset: *next_offset,
            })
            .collect()
    }
}

/// Exclusive hold on one group's cursor between resolving the start
/// offset and advancing past what was delivered.
pub struct GroupLease<'a> {
    tracker: &'a ConsumerGroupTracker,
    key: CursorKey,
    cursor: ArcMutexGuard<RawMutex, Offset>,
}

impl GroupLease<'_> {
    /// Offset the next delivery starts at.
    pub fn start(&self) -> Offset {
        *self.cursor
    }

    /// Move the cursor past `delivered` records and persist it.
    ///
    /// The cursor only moves once the new value is durable; on error it
    /// still points at the first undelivered record.
    pub fn advance(mut self, delivered: u64) -> Result<Offset, GroupError> {
        if delivered == 0 {
            return Ok(*self.cursor);
        }
        let next = *self.cursor + delivered;
        self.tracker.commit(&self.key, next)?;
        *self.cursor = next;
        Ok(next)
    }
}

impl ConsumerGroupTracker {
    fn with_state(
        store: Option<PathBuf>,
        cursors: HashMap<CursorKey, Arc<Mutex<Offset>>>,
        offsets: BTreeMap<CursorKey, Offset>,
    ) -> Self {
        Self {
            store,
            cursors: Mutex::new(cursors),
            state: Mutex::new(CommitState {
                offsets,
                ..CommitState::default()
            }),
            written: Mutex::new(0),
        }
    }

    /// Tracker without persistence.
    pub fn in_memory() -> Self {
        Self::with_state(None, HashMap::new(), BTreeMap::new())
    }

    /// Load committed cursors from `<data_dir>/consumer_offsets.json`.
    pub fn open(data_dir: PathBuf) -> Result<Self, GroupError> {
        let path = data_dir.join(OFFSETS_FILE);
        let entries: Vec<OffsetEntry> = persist::read_json(&path)?.unwrap_or_default();

        let mut cursors = HashMap::new();
        let mut offsets = BTreeMap::new();
        for entry in entries {
            let key = (entry.topic_id, entry.group);
            cursors.insert(key.clone(), Arc::new(Mutex::new(entry.next_offset)));
            offsets.insert(key, entry.next_offset);
        }

        info!(path = %path.display(), cursors = offsets.len(), "consumer offsets loaded");
        Ok(Self::with_state(Some(path), cursors, offsets))
    }

    /// Cursor of `(topic, group)`, created at zero on first use. `None`
    /// once the topic's cursors were purged.
    fn cursor(&self, topic: TopicId, group: &str) -> Option<(CursorKey, Arc<Mutex<Offset>>)> {
        let key = (topic, group.to_string());
        let mut cursors = self.cursors.lock();
        if let Some(cursor) = cursors.get(&key) {
            let cursor = Arc::clone(cursor);
            return Some((key, cursor));
        }

        let mut state = self.state.lock();
        if state.retired.contains(&topic) {
            return None;
        }
        debug!(topic_id = %topic, group, "new consumer group");
        state.offsets.insert(key.clone(), 0);
        state.version += 1;
        let cursor = Arc::new(Mutex::new(0));
        cursors.insert(key.clone(), Arc::clone(&cursor));
        Some((key, cursor))
    }

    /// Next offset to deliver to `group`, starting it at zero if unseen.
    pub fn resolve_start(&self, topic: TopicId, group: &str) -> Offset {
        match self.cursor(topic, group) {
            Some((_, cursor)) => *cursor.lock(),
            None => 0,
        }
    }

    /// Advance `group` past `delivered` records. Returns the new cursor,
    /// or zero when the topic's cursors were purged.
    pub fn advance(&self, topic: TopicId, group: &str, delivered: u64) -> Result<Offset, GroupError> {
        match self.lease(topic, group) {
            Some(lease) => lease.advance(delivered),
            None => Ok(0),
        }
    }

    /// Take exclusive ownership of `group`'s cursor until the lease is
    /// advanced or dropped. Other groups are unaffected.
    ///
    /// Returns `None` for a topic whose cursors were purged; a lease taken
    /// before the purge still advances, in memory only.
    pub fn lease(&self, topic: TopicId, group: &str) -> Option<GroupLease<'_>> {
        let (key, cursor) = self.cursor(topic, group)?;
        Some(GroupLease {
            tracker: self,
            key,
            cursor: cursor.lock_arc(),
        })
    }

    /// Record `next` for `key` and make it durable. A failed write takes the
    /// value back out of the mirror so no later snapshot carries it.
    fn commit(&self, key: &CursorKey, next: Offset) -> Result<(), GroupError> {
        let (previous, version) = {
            let mut state = self.state.lock();
            if state.retired.contains(&key.0) {
                return Ok(());
            }
            let previous = state.offsets.insert(key.clone(), next);
            state.version += 1;
            (previous, state.version)
        };

        let Some(path) = &self.store else {
            return Ok(());
        };
        let mut written = self.written.lock();
        if let Err(e) = self.write_snapshot(path, &mut written, version) {
            let mut state = self.state.lock();
            if state.offsets.get(key) == Some(&next) {
                match previous {
                    Some(previous) => state.offsets.insert(key.clone(), previous),
                    None => state.offsets.remove(key),
                };
                state.version += 1;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Write the current offsets unless a snapshot at least as new as
    /// `version` is already on disk. Callers hold `written`.
    fn write_snapshot(
        &self,
        path: &Path,
        written: &mut u64,
        version: u64,
    ) -> Result<(), GroupError> {
        if *written >= version {
            return Ok(());
        }
        let (entries, latest) = {
            let state = self.state.lock();
            (state.entries(), state.version)
        };
        persist::write_json_atomic(path, &entries)?;
        *written = latest;
        Ok(())
    }

    fn flush(&self, version: u64) -> Result<(), GroupError> {
        let Some(path) = &self.store else {
            return Ok(());
        };
        let mut written = self.written.lock();
        self.write_snapshot(path, &mut written, version)
    }

    /// Cursors of every group known on `topic`, sorted by group id.
    pub fn groups(&self, topic: TopicId) -> Vec<GroupCursor> {
        self.state
            .lock()
            .offsets
            .iter()
            .filter(|((topic_id, _), _)| *topic_id == topic)
            .map(|((_, group), next)| GroupCursor {
                group_id: group.clone(),
                next_offset: *next,
            })
            .collect()
    }

    /// Forget every cursor of `topic` and refuse new ones. Leases still
    /// held on it advance in memory only and are never written back.
    pub fn purge_topic(&self, topic: TopicId) -> Result<usize, GroupError> {
        let (purged, version) = {
            let mut cursors = self.cursors.lock();
            cursors.retain(|(topic_id, _), _| *topic_id != topic);

            let mut state = self.state.lock();
            state.retired.insert(topic);
            let before = state.offsets.len();
            state.offsets.retain(|(topic_id, _), _| *topic_id != topic);
            let purged = before - state.offsets.len();
            if purged > 0 {
                state.version += 1;
            }
            (purged, state.version)
        };

        if purged > 0 {
            self.flush(version)?;
        }
        debug!(topic_id = %topic, purged, "consumer groups purged");
        Ok(purged)
    }

    /// Drop cursors of topics outside `live`.
    pub fn retain_topics(&self, live: &HashSet<TopicId>) -> Result<(), GroupError> {
        let (dropped, version) = {
            let mut cursors = self.cursors.lock();
            cursors.retain(|(topic_id, _), _| live.contains(topic_id));

            let mut state = self.state.lock();
            let before = state.offsets.len();
            state.offsets.retain(|(topic_id, _), _| live.contains(topic_id));
            let dropped = before - state.offsets.len();
            if dropped > 0 {
                state.version += 1;
            }
            (dropped, state.version)
        };

        if dropped > 0 {
            info!(dropped, "dropping cursors of unknown topics");
            self.flush(version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn unseen_group_starts_at_zero() {
        let tracker = ConsumerGroupTracker::in_memory();
        let topic = TopicId::new();

        assert_eq!(tracker.resolve_start(topic, "cg1"), 0);
        assert_eq!(tracker.groups(topic).len(), 1);
    }

    #[test]
    fn groups_advance_independently() {
        let tracker = ConsumerGroupTracker::in_memory();
        let topic = TopicId::new();

        assert_eq!(tracker.advance(topic, "cg1", 5).unwrap(), 5);
        assert_eq!(tracker.advance(topic, "cg1", 2).unwrap(), 7);
        assert_eq!(tracker.resolve_start(topic, "cg2"), 0);

        let other = TopicId::new();
        assert_eq!(tracker.resolve_start(other, "cg1"), 0);
    }

    #[test]
    fn dropped_lease_leaves_cursor_untouched() {
        let tracker = ConsumerGroupTracker::in_memory();
        let topic = TopicId::new();
        {
            let lease = tracker.lease(topic, "cg1").unwrap();
            assert_eq!(lease.start(), 0);
        }
        assert_eq!(tracker.resolve_start(topic, "cg1"), 0);
    }

    #[test]
    fn concurrent_leases_never_overlap() {
        let tracker = Arc::new(ConsumerGroupTracker::in_memory());
        let topic = TopicId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| {
                            let lease = tracker.lease(topic, "shared").unwrap();
                            let start = lease.start();
                            lease.advance(3).unwrap();
                            start
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut starts: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        starts.sort_unstable();
        assert_eq!(starts, (0..200).map(|i| i * 3).collect::<Vec<_>>());
    }

    #[test]
    fn purge_only_touches_one_topic() {
        let tracker = ConsumerGroupTracker::in_memory();
        let doomed = TopicId::new();
        let kept = TopicId::new();

        tracker.advance(doomed, "a", 1).unwrap();
        tracker.advance(doomed, "b", 2).unwrap();
        tracker.advance(kept, "a", 3).unwrap();

        assert_eq!(tracker.purge_topic(doomed).unwrap(), 2);
        assert!(tracker.groups(doomed).is_empty());
        assert_eq!(tracker.resolve_start(doomed, "a"), 0);
        assert_eq!(tracker.resolve_start(kept, "a"), 3);
    }

    #[test]
    fn cursors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let topic = TopicId::new();
        let gone = TopicId::new();
        {
            let tracker = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
            tracker.advance(topic, "cg1", 10).unwrap();
            tracker.advance(topic, "cg2", 4).unwrap();
            tracker.advance(gone, "cg1", 1).unwrap();
        }

        let tracker = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(tracker.resolve_start(topic, "cg1"), 10);
        assert_eq!(
            tracker.groups(topic),
            vec![
                GroupCursor {
                    group_id: "cg1".into(),
                    next_offset: 10
                },
                GroupCursor {
                    group_id: "cg2".into(),
                    next_offset: 4
                },
            ]
        );

        tracker.retain_topics(&HashSet::from([topic])).unwrap();
        assert!(tracker.groups(gone).is_empty());

        let reloaded = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        assert!(reloaded.groups(gone).is_empty());
        assert_eq!(reloaded.resolve_start(topic, "cg2"), 4);
    }

    #[test]
    fn failed_write_leaves_cursor_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let topic = TopicId::new();
        let tracker = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        tracker.advance(topic, "cg1", 2).unwrap();

        // the atomic rewrite cannot create its temp file
        let blocker = dir.path().join("consumer_offsets.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(tracker.advance(topic, "cg1", 3).is_err());
        assert_eq!(tracker.resolve_start(topic, "cg1"), 2);
        assert_eq!(tracker.groups(topic)[0].next_offset, 2);

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(tracker.advance(topic, "cg1", 3).unwrap(), 5);
        let reloaded = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reloaded.resolve_start(topic, "cg1"), 5);
    }

    #[test]
    fn lease_outliving_a_purge_is_not_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let topic = TopicId::new();
        let tracker = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        tracker.advance(topic, "cg1", 1).unwrap();

        let lease = tracker.lease(topic, "cg1").unwrap();
        assert_eq!(tracker.purge_topic(topic).unwrap(), 1);
        assert_eq!(lease.advance(1).unwrap(), 2);
        assert!(tracker.groups(topic).is_empty());

        // late lookups of the purged topic get no cursor at all
        assert!(tracker.lease(topic, "cg1").is_none());
        assert_eq!(tracker.advance(topic, "cg2", 4).unwrap(), 0);
        assert!(tracker.groups(topic).is_empty());

        let reloaded = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        assert!(reloaded.groups(topic).is_empty());
    }

    #[test]
    fn concurrent_groups_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let topic = TopicId::new();
        let tracker = Arc::new(ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|g| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..20 {
                        tracker.advance(topic, &format!("group-{g}"), 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reloaded = ConsumerGroupTracker::open(dir.path().to_path_buf()).unwrap();
        let groups = reloaded.groups(topic);
        assert_eq!(groups.len(), 6);
        assert!(groups.iter().all(|g| g.next_offset == 20));
    }
}
