//! Java-dialect status probe: TCP, length-prefixed frames, JSON envelope.

use super::varint::{read_varint, write_string, write_varint};
use super::{ProbeError, ProbeReport, RosterEntry};
use serde::Deserialize;
use spyglass_db::Dialect;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Protocol 47 (1.8); old enough that effectively every server answers it.
const PROTOCOL_VERSION: u32 = 47;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const NEXT_READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Query a Java-dialect server and normalize its status envelope.
pub async fn probe(host: &str, port: u16) -> Result<ProbeReport, ProbeError> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProbeError::ConnectTimeout(format!("{host}:{port}")))?
        .map_err(|e| ProbeError::ConnectTimeout(e.to_string()))?;

    stream
        .write_all(&handshake_packet(host, port))
        .await
        .map_err(|e| ProbeError::Framing(e.to_string()))?;
    stream
        .write_all(&status_request_packet())
        .await
        .map_err(|e| ProbeError::Framing(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| ProbeError::Framing(e.to_string()))?;
    let started = Instant::now();

    let (status, latency_ms) = read_status(&mut stream, started).await?;

    let motd = status.description.normalize();
    Ok(ProbeReport {
        dialect: Dialect::Java,
        version: status.version.name,
        motd: if motd.is_empty() {
            "Minecraft Server".to_string()
        } else {
            motd
        },
        roster_online: status.players.online,
        max_roster: status.players.max,
        roster: status
            .players
            .sample
            .into_iter()
            .map(|entry| RosterEntry {
                name: entry.name,
                uuid: entry.id,
            })
            .collect(),
        latency_ms,
    })
}

/// Handshake frame: packet id 0x00, protocol version, host, port (u16 BE),
/// next-state 1 (status).
fn handshake_packet(host: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 8);
    write_varint(&mut body, 0x00);
    write_varint(&mut body, PROTOCOL_VERSION);
    write_string(&mut body, host);
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, 1);
    frame(body)
}

/// Status-request frame: packet id 0x00, empty payload.
fn status_request_packet() -> Vec<u8> {
    let mut body = Vec::new();
    write_varint(&mut body, 0x00);
    frame(body)
}

/// Prefix a packet body with its VarInt length.
fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 2);
    write_varint(&mut framed, body.len() as u32);
    framed.extend_from_slice(&body);
    framed
}

/// Read the status frame, tolerating a payload that arrives in chunks or a
/// stream the server closes mid-payload. Latency is the wall time between
/// the flushed request and the parsed JSON length prefix.
async fn read_status(
    stream: &mut TcpStream,
    started: Instant,
) -> Result<(StatusResponse, i64), ProbeError> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut read_timeout = FIRST_READ_TIMEOUT;

    // Accumulate until the three header varints are parseable
    let (json_offset, json_len) = loop {
        if let Some(header) = parse_header(&buf)? {
            break header;
        }
        let n = fill(stream, &mut buf, read_timeout).await?;
        if n == 0 {
            return Err(ProbeError::Framing("stream closed before status header".into()));
        }
        read_timeout = NEXT_READ_TIMEOUT;
    };
    let latency_ms = started.elapsed().as_millis() as i64;

    // Collect the JSON payload; a short read here is tolerated and handed
    // to the truncation-repairing decoder
    let wanted = (json_offset + json_len).min(MAX_RESPONSE_BYTES);
    while buf.len() < wanted {
        match fill(stream, &mut buf, NEXT_READ_TIMEOUT).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let end = wanted.min(buf.len());
    if end <= json_offset {
        return Err(ProbeError::Framing("empty status payload".into()));
    }
    let status = decode_status(&buf[json_offset..end])?;
    Ok((status, latency_ms))
}

async fn fill(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    deadline: Duration,
) -> Result<usize, ProbeError> {
    if buf.len() >= MAX_RESPONSE_BYTES {
        return Err(ProbeError::Framing("status response too large".into()));
    }
    let mut chunk = [0u8; 4096];
    let n = timeout(deadline, stream.read(&mut chunk))
        .await
        .map_err(|_| ProbeError::ReadTimeout)?
        .map_err(|e| ProbeError::Framing(e.to_string()))?;
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

/// Parse the frame header: VarInt frame length, VarInt packet id (must be
/// 0x00), VarInt JSON length. Returns the payload offset and length, or
/// None when the buffer does not yet hold the full header.
fn parse_header(buf: &[u8]) -> Result<Option<(usize, usize)>, ProbeError> {
    let Some((_frame_len, n1)) = read_varint(buf)? else {
        return Ok(None);
    };
    let Some((packet_id, n2)) = read_varint(&buf[n1..])? else {
        return Ok(None);
    };
    if packet_id != 0x00 {
        return Err(ProbeError::Framing(format!("unexpected packet id {packet_id:#x}")));
    }
    let Some((json_len, n3)) = read_varint(&buf[n1 + n2..])? else {
        return Ok(None);
    };
    Ok(Some((n1 + n2 + n3, json_len as usize)))
}

/// Decode the JSON envelope. When the payload was truncated, retry the
/// longest prefix that still ends with a closing brace before giving up.
fn decode_status(bytes: &[u8]) -> Result<StatusResponse, ProbeError> {
    match serde_json::from_slice(bytes) {
        Ok(status) => Ok(status),
        Err(first_err) => {
            let text = String::from_utf8_lossy(bytes);
            if let Some(idx) = text.rfind('}') {
                if let Ok(status) = serde_json::from_str(&text[..=idx]) {
                    return Ok(status);
                }
            }
            Err(ProbeError::Decode(first_err.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: VersionInfo,
    #[serde(default)]
    players: PlayersInfo,
    #[serde(default)]
    description: Description,
}

#[derive(Debug, Default, Deserialize)]
struct VersionInfo {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PlayersInfo {
    #[serde(default)]
    online: i64,
    #[serde(default)]
    max: i64,
    #[serde(default)]
    sample: Vec<SampleEntry>,
}

#[derive(Debug, Deserialize)]
struct SampleEntry {
    name: String,
    #[serde(default)]
    id: Option<String>,
}

/// The `description` field arrives as a bare string, an object with `text`,
/// or an object with `extra` fragments; all three normalize to plain text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Description {
    Text(String),
    Object {
        #[serde(default)]
        text: String,
        #[serde(default)]
        extra: Vec<ExtraFragment>,
    },
}

#[derive(Debug, Deserialize)]
struct ExtraFragment {
    #[serde(default)]
    text: String,
}

impl Default for Description {
    fn default() -> Self {
        Description::Text(String::new())
    }
}

impl Description {
    fn normalize(&self) -> String {
        match self {
            Description::Text(text) => text.clone(),
            Description::Object { text, extra } => {
                if !text.is_empty() {
                    text.clone()
                } else {
                    extra.iter().map(|fragment| fragment.text.as_str()).collect()
                }
            }
        }
    }
}
