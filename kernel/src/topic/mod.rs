// Topic Directory
//
// Maps topic names to their logs. Lookups share a read lock; create and
// delete take it exclusively, so no lookup ever sees a half-deleted topic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::groups::{ConsumerGroupTracker, GroupError};
use crate::log::{Log, LogError, LogOptions, LogStorage, Offset};
use crate::persist;

/// Registry of topic names, relative to the data directory.
pub const REGISTRY_FILE: &str = "topics.json";

/// Parent of every topic's segment directory.
pub const TOPICS_DIR: &str = "topics";

/// Stable identifier of one incarnation of a topic.
///
/// A name that is deleted and created again gets a fresh id, so its new
/// log and cursors never alias the old ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId(pub Uuid);

impl TopicId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TopicId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("topic '{0}' already exists")]
    AlreadyExists(String),

    #[error("topic '{0}' not found")]
    NotFound(String),

    #[error("invalid topic name '{0}'")]
    InvalidName(String),

    #[error("topic storage: {0}")]
    Storage(#[from] LogError),

    #[error("topic registry: {0}")]
    Registry(#[from] io::Error),

    #[error("consumer groups: {0}")]
    Groups(#[from] GroupError),
}

impl DirectoryError {
    /// Whether the error signals an unhealthy broker rather than a bad request.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DirectoryError::AlreadyExists(_)
                | DirectoryError::NotFound(_)
                | DirectoryError::InvalidName(_)
        )
    }
}

/// Descriptive snapshot of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMetadata {
    pub name: String,
    pub topic_id: TopicId,
    pub segment_count: usize,
    pub highest_offset: Option<Offset>,
    pub next_offset: Offset,
}

/// A named topic and the log it owns.
#[derive(Debug)]
pub struct Topic {
    name: String,
    id: TopicId,
    log: Log,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> TopicId {
        self.id
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn metadata(&self) -> TopicMetadata {
        TopicMetadata {
            name: self.name.clone(),
            topic_id: self.id,
            segment_count: self.log.segment_count(),
            highest_offset: self.log.highest_offset(),
            next_offset: self.log.next_offset(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryEntry {
    name: String,
    topic_id: TopicId,
}

pub struct TopicDirectory {
    data_dir: Option<PathBuf>,
    options: LogOptions,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    groups: Arc<ConsumerGroupTracker>,
}

impl TopicDirectory {
    /// Open the directory, recovering every registered topic's log.
    pub fn open(
        config: &BrokerConfig,
        groups: Arc<ConsumerGroupTracker>,
    ) -> Result<Self, DirectoryError> {
        let options = config.log_options();
        let mut topics = HashMap::new();

        if let Some(data_dir) = &config.data_dir {
            let topics_root = data_dir.join(TOPICS_DIR);
            fs::create_dir_all(&topics_root)?;

            let entries: Vec<RegistryEntry> =
                persist::read_json(&data_dir.join(REGISTRY_FILE))?.unwrap_or_default();

            for entry in entries {
                let storage = LogStorage::Directory(topics_root.join(entry.topic_id.to_string()));
                let log = Log::open(storage, options.clone())?;
                let topic = Topic {
                    name: entry.name.clone(),
                    id: entry.topic_id,
                    log,
                };
                topics.insert(entry.name, Arc::new(topic));
            }

            let known: HashSet<String> = topics.values().map(|t| t.id.to_string()).collect();
            for entry in fs::read_dir(&topics_root)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !known.contains(&name) {
                    warn!(directory = %entry.path().display(), "ignoring unregistered topic directory");
                }
            }

            info!(data_dir = %data_dir.display(), topics = topics.len(), "topic directory opened");
        }

        Ok(Self {
            data_dir: config.data_dir.clone(),
            options,
            topics: RwLock::new(topics),
            groups,
        })
    }

    fn storage_for(&self, id: TopicId) -> LogStorage {
        match &self.data_dir {
            Some(dir) => LogStorage::Directory(dir.join(TOPICS_DIR).join(id.to_string())),
            None => LogStorage::Memory,
        }
    }

    fn persist(&self, topics: &HashMap<String, Arc<Topic>>) -> Result<(), DirectoryError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let mut entries: Vec<RegistryEntry> = topics
            .values()
            .map(|t| RegistryEntry {
                name: t.name.clone(),
                topic_id: t.id,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        persist::write_json_atomic(&dir.join(REGISTRY_FILE), &entries)?;
        Ok(())
    }

    /// Create an empty topic. An existing topic is never modified.
    pub fn create_topic(&self, name: &str) -> Result<TopicMetadata, DirectoryError> {
        if name.trim().is_empty() {
            return Err(DirectoryError::InvalidName(name.to_string()));
        }

        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Err(DirectoryError::AlreadyExists(name.to_string()));
        }

        let id = TopicId::new();
        let log = Log::open(self.storage_for(id), self.options.clone())?;
        let topic = Arc::new(Topic {
            name: name.to_string(),
            id,
            log,
        });
        topics.insert(name.to_string(), Arc::clone(&topic));

        if let Err(e) = self.persist(&topics) {
            topics.remove(name);
            if let Err(cleanup) = topic.log.destroy() {
                warn!(topic = %name, error = %cleanup, "unable to clean up unregistered topic");
            }
            return Err(e);
        }

        info!(topic = %name, topic_id = %id, "topic created");
        Ok(topic.metadata())
    }

    pub fn describe_topic(&self, name: &str) -> Result<TopicMetadata, DirectoryError> {
        self.lookup(name)
            .map(|t| t.metadata())
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    /// Delete a topic, its consumer group cursors and all of its segments.
    ///
    /// The topic disappears from lookups and its cursors are purged before
    /// the exclusive lock is released; segment files are removed afterwards,
    /// even when persisting the purge failed.
    pub fn delete_topic(&self, name: &str) -> Result<TopicMetadata, DirectoryError> {
        let (topic, purged) = {
            let mut topics = self.topics.write();
            let topic = topics
                .remove(name)
                .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;

            if let Err(e) = self.persist(&topics) {
                topics.insert(name.to_string(), topic);
                return Err(e);
            }
            // cursors leave memory even when the offsets file can't be
            // rewritten; stale entries are dropped on the next open
            let purged = self.groups.purge_topic(topic.id);
            (topic, purged)
        };

        let metadata = topic.metadata();
        let destroyed = topic.log.destroy();
        if let Err(e) = &purged {
            warn!(
                topic = %name,
                topic_id = %topic.id,
                error = %e,
                "consumer offsets of deleted topic not persisted"
            );
        }
        purged?;
        destroyed?;
        info!(topic = %name, topic_id = %topic.id, "topic deleted");
        Ok(metadata)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    /// Names of all topics, sorted.
    pub fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Ids of all live topics.
    pub fn topic_ids(&self) -> HashSet<TopicId> {
        self.topics.read().values().map(|t| t.id).collect()
    }
}
