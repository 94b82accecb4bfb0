// Request Router
//
// Dispatches produce, consume and topic-admin requests to the engine and
// shapes their responses. Expected outcomes (unknown topic, duplicate
// create, nothing new to consume) come back as `success: false` or an
// empty message list; only internal faults surface as `EngineError`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{BrokerConfig, ConfigError};
use crate::groups::{ConsumerGroupTracker, GroupCursor, GroupError};
use crate::log::{LogError, Offset};
use crate::topic::{DirectoryError, TopicDirectory, TopicMetadata};

/// Inbound operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    CreateTopic {
        topic_name: String,
    },
    DescribeTopic {
        topic_name: String,
    },
    DeleteTopic {
        topic_name: String,
    },
    Produce {
        topic_name: String,
        #[serde(default)]
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Consume {
        topic_name: String,
        group_id: String,
        #[serde(default)]
        max_messages: Option<usize>,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CreateTopic { .. } => "createTopic",
            Request::DescribeTopic { .. } => "describeTopic",
            Request::DeleteTopic { .. } => "deleteTopic",
            Request::Produce { .. } => "produce",
            Request::Consume { .. } => "consume",
        }
    }

    pub fn topic_name(&self) -> &str {
        match self {
            Request::CreateTopic { topic_name }
            | Request::DescribeTopic { topic_name }
            | Request::DeleteTopic { topic_name }
            | Request::Produce { topic_name, .. }
            | Request::Consume { topic_name, .. } => topic_name,
        }
    }
}

/// Outcome of a topic-admin request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicResponse {
    pub success: bool,
    pub topic_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TopicMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub consumer_groups: Vec<GroupCursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a produce. `offset` is 0 when `success` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub success: bool,
    pub topic_name: String,
    pub offset: Offset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A delivered record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub offset: Offset,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Outcome of a consume, messages in ascending offset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub success: bool,
    pub topic_name: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Response {
    CreateTopic(TopicResponse),
    DescribeTopic(TopicResponse),
    DeleteTopic(TopicResponse),
    Produce(ProduceResponse),
    Consume(ConsumeResponse),
}

impl Response {
    pub fn success(&self) -> bool {
        match self {
            Response::CreateTopic(r) | Response::DescribeTopic(r) | Response::DeleteTopic(r) => {
                r.success
            }
            Response::Produce(r) => r.success,
            Response::Consume(r) => r.success,
        }
    }

    pub fn topic_name(&self) -> &str {
        match self {
            Response::CreateTopic(r) | Response::DescribeTopic(r) | Response::DeleteTopic(r) => {
                &r.topic_name
            }
            Response::Produce(r) => &r.topic_name,
            Response::Consume(r) => &r.topic_name,
        }
    }
}

/// Internal faults. Distinct from a request that was merely invalid.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("log failure on topic '{topic}': {source}")]
    Log {
        topic: String,
        #[source]
        source: LogError,
    },

    #[error("topic directory failure: {0}")]
    Directory(DirectoryError),

    #[error("consumer group failure: {0}")]
    Groups(#[from] GroupError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl TopicResponse {
    fn ok(topic_name: String, metadata: TopicMetadata) -> Self {
        Self {
            success: true,
            topic_name,
            metadata: Some(metadata),
            consumer_groups: Vec::new(),
            reason: None,
        }
    }

    fn failed(topic_name: String, reason: String) -> Self {
        Self {
            success: false,
            topic_name,
            metadata: None,
            consumer_groups: Vec::new(),
            reason: Some(reason),
        }
    }
}

impl ProduceResponse {
    fn failed(topic_name: String, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            topic_name,
            offset: 0,
            reason: Some(reason.into()),
        }
    }
}

impl ConsumeResponse {
    fn failed(topic_name: String, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            topic_name,
            messages: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Entry point of the engine: owns the topic directory and group tracker.
pub struct Router {
    config: BrokerConfig,
    topics: TopicDirectory,
    groups: Arc<ConsumerGroupTracker>,
}

impl Router {
    /// Open the engine, recovering persisted state when a data directory
    /// is configured.
    pub fn open(config: BrokerConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let groups = Arc::new(match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(GroupError::Io)?;
                ConsumerGroupTracker::open(dir.clone())?
            }
            None => ConsumerGroupTracker::in_memory(),
        });
        let topics =
            TopicDirectory::open(&config, Arc::clone(&groups)).map_err(EngineError::Directory)?;
        groups.retain_topics(&topics.topic_ids())?;

        Ok(Self {
            config,
            topics,
            groups,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicDirectory {
        &self.topics
    }

    pub fn groups(&self) -> &ConsumerGroupTracker {
        &self.groups
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.topics.list_topics()
    }

    pub fn handle(&self, request: Request) -> Result<Response, EngineError> {
        let kind = request.kind();
        let topic = request.topic_name().to_string();

        let result = match request {
            Request::CreateTopic { topic_name } => self.create_topic(topic_name),
            Request::DescribeTopic { topic_name } => self.describe_topic(topic_name),
            Request::DeleteTopic { topic_name } => self.delete_topic(topic_name),
            Request::Produce {
                topic_name,
                key,
                value,
            } => self.produce(topic_name, &key, &value),
            Request::Consume {
                topic_name,
                group_id,
                max_messages,
            } => self.consume(topic_name, group_id, max_messages),
        };

        match &result {
            Ok(response) => debug!(request = kind, topic = %topic, success = response.success(), "request handled"),
            Err(err) => error!(request = kind, topic = %topic, error = %err, "request failed"),
        }
        result
    }

    /// Turn a directory outcome into a topic response, escalating faults.
    fn topic_outcome(
        topic_name: String,
        outcome: Result<TopicMetadata, DirectoryError>,
    ) -> Result<TopicResponse, EngineError> {
        match outcome {
            Ok(metadata) => Ok(TopicResponse::ok(topic_name, metadata)),
            Err(e) if !e.is_fatal() => Ok(TopicResponse::failed(topic_name, e.to_string())),
            Err(e) => Err(EngineError::Directory(e)),
        }
    }

    fn create_topic(&self, topic_name: String) -> Result<Response, EngineError> {
        let outcome = self.topics.create_topic(&topic_name);
        Self::topic_outcome(topic_name, outcome).map(Response::CreateTopic)
    }

    fn describe_topic(&self, topic_name: String) -> Result<Response, EngineError> {
        let outcome = self.topics.describe_topic(&topic_name);
        let mut response = Self::topic_outcome(topic_name, outcome)?;
        if let Some(metadata) = &response.metadata {
            response.consumer_groups = self.groups.groups(metadata.topic_id);
        }
        Ok(Response::DescribeTopic(response))
    }

    fn delete_topic(&self, topic_name: String) -> Result<Response, EngineError> {
        let outcome = self.topics.delete_topic(&topic_name);
        Self::topic_outcome(topic_name, outcome).map(Response::DeleteTopic)
    }

    fn produce(&self, topic_name: String, key: &[u8], value: &[u8]) -> Result<Response, EngineError> {
        let Some(topic) = self.topics.lookup(&topic_name) else {
            let reason = format!("topic '{topic_name}' not found");
            return Ok(Response::Produce(ProduceResponse::failed(topic_name, reason)));
        };

        match topic.log().append(key, value) {
            Ok(offset) => Ok(Response::Produce(ProduceResponse {
                success: true,
                topic_name,
                offset,
                reason: None,
            })),
            // deleted between lookup and append
            Err(LogError::Closed) => {
                let reason = format!("topic '{topic_name}' not found");
                Ok(Response::Produce(ProduceResponse::failed(topic_name, reason)))
            }
            Err(e @ LogError::RecordTooLarge { .. }) => {
                Ok(Response::Produce(ProduceResponse::failed(topic_name, e.to_string())))
            }
            Err(source) => Err(EngineError::Log {
                topic: topic_name,
                source,
            }),
        }
    }

    fn consume(
        &self,
        topic_name: String,
        group_id: String,
        max_messages: Option<usize>,
    ) -> Result<Response, EngineError> {
        if group_id.is_empty() {
            return Ok(Response::Consume(ConsumeResponse::failed(
                topic_name,
                "group id must not be empty",
            )));
        }
        let Some(topic) = self.topics.lookup(&topic_name) else {
            let reason = format!("topic '{topic_name}' not found");
            return Ok(Response::Consume(ConsumeResponse::failed(topic_name, reason)));
        };
        let max = max_messages.unwrap_or(self.config.default_max_messages);

        // purged by a delete that won the race since the lookup
        let Some(lease) = self.groups.lease(topic.id(), &group_id) else {
            let reason = format!("topic '{topic_name}' not found");
            return Ok(Response::Consume(ConsumeResponse::failed(topic_name, reason)));
        };
        let records = match topic.log().read_from(lease.start(), max) {
            Ok(records) => records,
            Err(LogError::Closed) => {
                let reason = format!("topic '{topic_name}' not found");
                return Ok(Response::Consume(ConsumeResponse::failed(topic_name, reason)));
            }
            Err(source) => {
                return Err(EngineError::Log {
                    topic: topic_name,
                    source,
                })
            }
        };

        // at-least-once: the cursor moves only after the read succeeded
        let next = lease.advance(records.len() as u64)?;
        debug!(topic = %topic_name, group = %group_id, delivered = records.len(), next_offset = next, "consumed");

        let messages = records
            .into_iter()
            .map(|r| Message {
                offset: r.offset,
                key: r.key,
                value: r.value,
            })
            .collect();
        Ok(Response::Consume(ConsumeResponse {
            success: true,
            topic_name,
            messages,
            reason: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::open(BrokerConfig::in_memory(4096)).unwrap()
    }

    fn produce(router: &Router, topic: &str, key: &str, value: &str) -> ProduceResponse {
        match router
            .handle(Request::Produce {
                topic_name: topic.into(),
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            })
            .unwrap()
        {
            Response::Produce(r) => r,
            other => panic!("unexpected response {other:?}"),
        }
    }

    fn consume(router: &Router, topic: &str, group: &str, max: Option<usize>) -> ConsumeResponse {
        match router
            .handle(Request::Consume {
                topic_name: topic.into(),
                group_id: group.into(),
                max_messages: max,
            })
            .unwrap()
        {
            Response::Consume(r) => r,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn request_json_uses_camel_case() {
        let request: Request = serde_json::from_str(
            r#"{ "op": "consume", "topicName": "orders", "groupId": "cg1", "maxMessages": 5 }"#,
        )
        .unwrap();
        assert_eq!(
            request,
            Request::Consume {
                topic_name: "orders".into(),
                group_id: "cg1".into(),
                max_messages: Some(5),
            }
        );

        let request: Request =
            serde_json::from_str(r#"{ "op": "produce", "topicName": "orders", "value": [1, 2] }"#)
                .unwrap();
        assert_eq!(request.kind(), "produce");
        assert_eq!(request.topic_name(), "orders");
    }

    #[test]
    fn response_json_shape() {
        let router = router();
        router
            .handle(Request::CreateTopic {
                topic_name: "orders".into(),
            })
            .unwrap();

        let response = router
            .handle(Request::Produce {
                topic_name: "orders".into(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            })
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "produce");
        assert_eq!(json["success"], true);
        assert_eq!(json["topicName"], "orders");
        assert_eq!(json["offset"], 0);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn consume_respects_max_messages() {
        let router = router();
        router
            .handle(Request::CreateTopic {
                topic_name: "orders".into(),
            })
            .unwrap();
        for i in 0..5 {
            produce(&router, "orders", "k", &format!("v{i}"));
        }

        let first = consume(&router, "orders", "cg1", Some(2));
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.messages[0].value, b"v0");

        let rest = consume(&router, "orders", "cg1", None);
        let values: Vec<_> = rest.messages.iter().map(|m| m.value.clone()).collect();
        assert_eq!(values, vec![b"v2".to_vec(), b"v3".to_vec(), b"v4".to_vec()]);

        let none = consume(&router, "orders", "cg1", Some(0));
        assert!(none.success);
        assert!(none.messages.is_empty());
    }

    #[test]
    fn empty_group_id_is_rejected() {
        let router = router();
        router
            .handle(Request::CreateTopic {
                topic_name: "orders".into(),
            })
            .unwrap();

        let response = consume(&router, "orders", "", None);
        assert!(!response.success);
        assert_eq!(response.topic_name, "orders");
    }

    #[test]
    fn describe_lists_consumer_groups() {
        let router = router();
        router
            .handle(Request::CreateTopic {
                topic_name: "orders".into(),
            })
            .unwrap();
        produce(&router, "orders", "k", "v");
        consume(&router, "orders", "cg1", None);

        let response = router
            .handle(Request::DescribeTopic {
                topic_name: "orders".into(),
            })
            .unwrap();
        let Response::DescribeTopic(described) = response else {
            panic!("unexpected response");
        };
        assert!(described.success);
        assert_eq!(described.metadata.unwrap().highest_offset, Some(0));
        assert_eq!(
            described.consumer_groups,
            vec![GroupCursor {
                group_id: "cg1".into(),
                next_offset: 1
            }]
        );
    }

    #[test]
    fn zero_segment_size_refuses_to_open() {
        let err = Router::open(BrokerConfig::in_memory(0)).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
