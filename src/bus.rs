//! Bot bus boundary: the JSON query envelope and a TCP client for it.
//!
//! Queries travel as newline-delimited JSON objects in both directions. The
//! adapter engages once at start; afterwards [`BusClient::run`] pumps queries
//! between the socket and the bridge channels.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::xmpp::stanza::stanza_id;

/// Destination used for everything the adapter sends.
pub const SERVER_TARGET: &str = "server";

pub const ACTION_ENGAGE: &str = "engage";
pub const ACTION_DISENGAGE: &str = "disengage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Message,
    Command,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "type")]
    pub kind: QueryType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandBlock>,
}

/// Chat payload of a `message` query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageBlock {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(default)]
    pub mentioned: bool,
    /// Body with the mention token removed; only set when `mentioned`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stripped: String,
    /// Display names to `@mention` when delivering an outbound message.
    #[serde(default, rename = "mentionNotify", skip_serializing_if = "Vec::is_empty")]
    pub mention_notify: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandBlock {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub array: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl Query {
    pub fn message(source: &str, block: MessageBlock) -> Self {
        Self {
            kind: QueryType::Message,
            source: source.to_string(),
            to: SERVER_TARGET.to_string(),
            message: Some(block),
            command: None,
        }
    }

    pub fn command(source: &str, block: CommandBlock) -> Self {
        Self {
            kind: QueryType::Command,
            source: source.to_string(),
            to: SERVER_TARGET.to_string(),
            message: None,
            command: Some(block),
        }
    }

    /// Announces this process to the bus as an adapter.
    pub fn engage(source: &str) -> Self {
        Self::command(
            source,
            CommandBlock {
                id: stanza_id(),
                action: ACTION_ENGAGE.to_string(),
                kind: "adapter".to_string(),
                time: unix_now(),
                ..Default::default()
            },
        )
    }

    pub fn disengage(source: &str) -> Self {
        Self::command(
            source,
            CommandBlock {
                id: stanza_id(),
                action: ACTION_DISENGAGE.to_string(),
                time: unix_now(),
                ..Default::default()
            },
        )
    }

    pub fn is_disengage(&self) -> bool {
        self.kind == QueryType::Command
            && self
                .command
                .as_ref()
                .is_some_and(|command| command.action == ACTION_DISENGAGE)
    }
}

/// TCP connection to the bot bus server.
pub struct BusClient {
    stream: TcpStream,
    source_id: String,
    span: Span,
}

impl BusClient {
    pub async fn connect(config: &BusConfig, span: Span) -> Result<Self, BusError> {
        let addr = config.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| BusError::Connect { addr: addr.clone(), source })?;
        span.in_scope(|| info!(addr = %addr, "Connected to bus server"));
        Ok(Self {
            stream,
            source_id: config.source_id.clone(),
            span,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn engage(&mut self) -> Result<(), BusError> {
        let line = encode_line(&Query::engage(&self.source_id))?;
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;
        self.span.in_scope(|| debug!(source = %self.source_id, "Engage sent"));
        Ok(())
    }

    /// Pump `outbound` to the socket and socket queries to `inbound`. When the
    /// connection is lost a synthetic disengage is delivered on `inbound`.
    pub fn run(self, outbound: mpsc::Receiver<Query>, inbound: mpsc::Sender<Query>) -> JoinHandle<()> {
        let (read_half, write_half) = self.stream.into_split();
        let source_id = self.source_id;
        let span = self.span;
        tokio::spawn(
            async move {
                tokio::join!(read_loop(read_half, inbound, &source_id), write_loop(write_half, outbound));
            }
            .instrument(span),
        )
    }
}

fn encode_line(query: &Query) -> Result<Vec<u8>, BusError> {
    let mut line = serde_json::to_vec(query)?;
    line.push(b'\n');
    Ok(line)
}

async fn read_loop(read_half: OwnedReadHalf, inbound: mpsc::Sender<Query>, source_id: &str) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                warn!("Bus server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Bus connection lost");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Query>(line) {
            Ok(query) => {
                debug!(kind = ?query.kind, "Query received from bus");
                if inbound.send(query).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Ignoring undecodable bus query"),
        }
    }
    let _ = inbound.send(Query::disengage(source_id)).await;
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<Query>) {
    while let Some(query) = outbound.recv().await {
        let line = match encode_line(&query) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Could not encode bus query");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&line).await {
            warn!(error = %e, "Bus write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
