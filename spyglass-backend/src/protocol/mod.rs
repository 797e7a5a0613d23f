//! Wire codecs for the two Minecraft status dialects.
//!
//! The Java dialect speaks length-prefixed frames over TCP and answers with
//! a JSON envelope; the Bedrock dialect answers a single RakNet
//! Unconnected-Ping datagram. Both normalize into [`ProbeReport`].

pub mod bedrock;
pub mod java;
pub mod varint;

use spyglass_db::Dialect;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Budget for the Java attempt when the dialect is still `auto`.
const JAVA_DETECT_BUDGET: Duration = Duration::from_secs(10);
/// Budget for the Bedrock fallback when the dialect is still `auto`.
const BEDROCK_DETECT_BUDGET: Duration = Duration::from_secs(5);

/// Codec-level probe failures. All are transient: the engine records an
/// offline sample and the next tick retries.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("read timeout")]
    ReadTimeout,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// One player identity reported in a roster sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub name: String,
    pub uuid: Option<String>,
}

/// Normalized result of one successful probe, independent of dialect.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// The concrete dialect that answered (never `auto`).
    pub dialect: Dialect,
    pub version: String,
    pub motd: String,
    pub roster_online: i64,
    pub max_roster: i64,
    /// Sampled identities; servers may truncate this below `roster_online`.
    pub roster: Vec<RosterEntry>,
    pub latency_ms: i64,
}

/// Probe an endpoint according to its dialect. `Auto` tries Java first and
/// falls back to Bedrock; the report carries whichever dialect answered so
/// the engine can lock it in.
pub async fn probe(host: &str, port: u16, dialect: Dialect) -> Result<ProbeReport, ProbeError> {
    match dialect {
        Dialect::Java => java::probe(host, port).await,
        Dialect::Bedrock => bedrock::probe(host, port).await,
        Dialect::Auto => {
            match timeout(JAVA_DETECT_BUDGET, java::probe(host, port)).await {
                Ok(Ok(report)) => Ok(report),
                _ => match timeout(BEDROCK_DETECT_BUDGET, bedrock::probe(host, port)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::ReadTimeout),
                },
            }
        }
    }
}
