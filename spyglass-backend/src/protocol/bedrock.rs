//! Bedrock-dialect status probe: a single RakNet Unconnected-Ping datagram.

use super::{ProbeError, ProbeReport, RosterEntry};
use rand::Rng;
use spyglass_db::Dialect;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// RakNet offline-message marker, echoed back by the pong.
const MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56,
    0x78,
];

const UNCONNECTED_PING: u8 = 0x01;
const UNCONNECTED_PONG: u8 = 0x1C;
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// PacketID + timestamp + server GUID + magic + string length.
const PONG_HEADER_LEN: usize = 1 + 8 + 8 + 16 + 2;

/// Query a Bedrock-dialect server. The roster sample is always empty; the
/// pong only carries aggregate counts.
pub async fn probe(host: &str, port: u16) -> Result<ProbeReport, ProbeError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProbeError::ConnectTimeout(e.to_string()))?;
    socket
        .connect((host, port))
        .await
        .map_err(|e| ProbeError::ConnectTimeout(e.to_string()))?;

    let ping = unconnected_ping(crate::helpers::now() as u64, rand::rng().random());
    socket
        .send(&ping)
        .await
        .map_err(|e| ProbeError::Framing(e.to_string()))?;
    let started = Instant::now();

    let mut buf = [0u8; 2048];
    let n = timeout(READ_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| ProbeError::ReadTimeout)?
        .map_err(|e| ProbeError::Framing(e.to_string()))?;
    let latency_ms = started.elapsed().as_millis() as i64;

    let record = parse_pong(&buf[..n])?;
    Ok(ProbeReport {
        dialect: Dialect::Bedrock,
        version: record.version.clone(),
        motd: if record.motd.is_empty() {
            "Minecraft Server".to_string()
        } else {
            record.motd.clone()
        },
        roster_online: record.players_online,
        max_roster: record.max_players,
        roster: Vec::<RosterEntry>::new(),
        latency_ms,
    })
}

/// Unconnected Ping: 0x01, u64-BE timestamp, magic, u64-BE client GUID.
fn unconnected_ping(timestamp: u64, client_guid: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + MAGIC.len() + 8);
    buf.push(UNCONNECTED_PING);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&client_guid.to_be_bytes());
    buf
}

/// Fields of the semicolon-separated pong record. Trailing fields are
/// frequently absent on older servers and default to empty/zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PongRecord {
    pub motd: String,
    pub game_type: String,
    pub map: String,
    pub players_online: i64,
    pub max_players: i64,
    pub server_id: String,
    pub game_mode: String,
    pub game_mode_num: i64,
    pub port_ipv4: i64,
    pub port_ipv6: i64,
    pub version: String,
}

/// Parse an Unconnected Pong datagram.
pub fn parse_pong(data: &[u8]) -> Result<PongRecord, ProbeError> {
    if data.len() < PONG_HEADER_LEN {
        return Err(ProbeError::Framing("pong datagram too short".into()));
    }
    if data[0] != UNCONNECTED_PONG {
        return Err(ProbeError::Framing(format!(
            "unexpected packet id {:#x}",
            data[0]
        )));
    }
    if data[17..33] != MAGIC {
        return Err(ProbeError::Framing("bad raknet magic".into()));
    }

    let str_len = u16::from_be_bytes([data[33], data[34]]) as usize;
    let body = data
        .get(PONG_HEADER_LEN..PONG_HEADER_LEN + str_len)
        .ok_or_else(|| ProbeError::Framing("status string exceeds datagram".into()))?;
    let text = String::from_utf8_lossy(body);

    let parts: Vec<&str> = text.split(';').collect();
    if parts.len() < 6 {
        return Err(ProbeError::Decode("status record too short".into()));
    }

    let field = |i: usize| parts.get(i).copied().unwrap_or_default().to_string();
    let num = |i: usize| {
        parts
            .get(i)
            .and_then(|p| p.parse::<i64>().ok())
            .unwrap_or(0)
    };

    Ok(PongRecord {
        motd: field(0),
        game_type: field(1),
        map: field(2),
        players_online: num(3),
        max_players: num(4),
        server_id: field(5),
        game_mode: field(6),
        game_mode_num: num(7),
        port_ipv4: num(8),
        port_ipv6: num(9),
        version: field(10),
    })
}
