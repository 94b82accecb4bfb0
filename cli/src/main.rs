use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use strata_kernel::router::Message;
use strata_kernel::{BrokerConfig, Request, Response, Router};

/// Strata broker CLI
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Run broker requests against a local data directory", long_about = None)]
struct Cli {
    /// Path to broker config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the config file)
    #[arg(long, env = "STRATA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Segment size in bytes (overrides the config file)
    #[arg(long)]
    segment_max_bytes: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Create an empty topic
    CreateTopic { name: String },

    /// Show a topic's offsets, segments and consumer groups
    DescribeTopic { name: String },

    /// Delete a topic and everything stored for it
    DeleteTopic { name: String },

    /// List topic names
    ListTopics,

    /// Append one message to a topic
    Produce {
        topic: String,
        value: String,
        #[arg(long, default_value = "")]
        key: String,
    },

    /// Read the next messages for a consumer group
    Consume {
        topic: String,
        #[arg(long)]
        group: String,
        #[arg(long)]
        max: Option<usize>,
    },
}

impl Command {
    fn into_request(self) -> Option<Request> {
        Some(match self {
            Command::CreateTopic { name } => Request::CreateTopic { topic_name: name },
            Command::DescribeTopic { name } => Request::DescribeTopic { topic_name: name },
            Command::DeleteTopic { name } => Request::DeleteTopic { topic_name: name },
            Command::ListTopics => return None,
            Command::Produce { topic, value, key } => Request::Produce {
                topic_name: topic,
                key: key.into_bytes(),
                value: value.into_bytes(),
            },
            Command::Consume { topic, group, max } => Request::Consume {
                topic_name: topic,
                group_id: group,
                max_messages: max,
            },
        })
    }
}

/// Consumed message with payloads shown as text.
#[derive(Debug, Serialize)]
struct MessageOutput {
    offset: u64,
    key: String,
    value: String,
}

impl From<&Message> for MessageOutput {
    fn from(message: &Message) -> Self {
        Self {
            offset: message.offset,
            key: String::from_utf8_lossy(&message.key).into_owned(),
            value: String::from_utf8_lossy(&message.value).into_owned(),
        }
    }
}

fn load_config(cli: &Cli) -> Result<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => BrokerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BrokerConfig::default_config(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(bytes) = cli.segment_max_bytes {
        config.segment_max_bytes = bytes;
    }
    Ok(config)
}

fn render(response: &Response) -> Result<serde_json::Value> {
    let mut output = serde_json::to_value(response)?;
    if let Response::Consume(consumed) = response {
        let messages: Vec<MessageOutput> = consumed.messages.iter().map(Into::into).collect();
        output["messages"] = serde_json::to_value(messages)?;
    }
    Ok(output)
}

fn run(cli: Cli) -> Result<()> {
    // ----------------------------
    // Open the engine
    // ----------------------------
    let config = load_config(&cli)?;
    debug!(data_dir = ?config.data_dir, segment_max_bytes = config.segment_max_bytes, "opening broker");
    let router = Router::open(config).context("opening broker")?;

    // ----------------------------
    // Execute
    // ----------------------------
    let output = match cli.command.into_request() {
        Some(request) => render(&router.handle(request)?)?,
        None => serde_json::to_value(router.list_topics())?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_consume_with_limit() {
        let cli = Cli::try_parse_from([
            "strata",
            "--data-dir",
            "/tmp/strata",
            "consume",
            "orders",
            "--group",
            "cg1",
            "--max",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/strata")));
        assert_eq!(
            cli.command.into_request(),
            Some(Request::Consume {
                topic_name: "orders".into(),
                group_id: "cg1".into(),
                max_messages: Some(5),
            })
        );
    }

    #[test]
    fn produce_key_defaults_to_empty() {
        let cli = Cli::try_parse_from(["strata", "produce", "orders", "hello"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Produce {
                topic: "orders".into(),
                value: "hello".into(),
                key: String::new(),
            }
        );
    }

    #[test]
    fn consume_requires_a_group() {
        assert!(Cli::try_parse_from(["strata", "consume", "orders"]).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");
        std::fs::write(&path, r#"{ "segment_max_bytes": 64, "default_max_messages": 3 }"#).unwrap();

        let cli = Cli::try_parse_from([
            "strata",
            "--config",
            path.to_str().unwrap(),
            "--segment-max-bytes",
            "128",
            "list-topics",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.segment_max_bytes, 128);
        assert_eq!(config.default_max_messages, 3);
    }

    #[test]
    fn consume_output_shows_text_payloads() {
        let router = Router::open(BrokerConfig::in_memory(4096)).unwrap();
        router
            .handle(Request::CreateTopic {
                topic_name: "orders".into(),
            })
            .unwrap();
        router
            .handle(Request::Produce {
                topic_name: "orders".into(),
                key: b"k".to_vec(),
                value: b"hello".to_vec(),
            })
            .unwrap();

        let response = router
            .handle(Request::Consume {
                topic_name: "orders".into(),
                group_id: "cg1".into(),
                max_messages: None,
            })
            .unwrap();
        let output = render(&response).unwrap();
        assert_eq!(output["success"], true);
        assert_eq!(output["messages"][0]["value"], "hello");
        assert_eq!(output["messages"][0]["key"], "k");
    }
}
