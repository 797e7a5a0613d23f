use arrayvec::ArrayString;

/// Minecraft player name - max 16 characters, stored inline (no heap allocation).
pub type PlayerName = ArrayString<16>;

/// Protocol family an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
  Java,
  Bedrock,
  /// Not yet probed; replaced by the detected dialect after the first
  /// successful probe and never set back.
  Auto,
}

impl Dialect {
  pub fn as_str(&self) -> &'static str {
    match self {
      Dialect::Java => "java",
      Dialect::Bedrock => "bedrock",
      Dialect::Auto => "auto",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "java" => Some(Dialect::Java),
      "bedrock" => Some(Dialect::Bedrock),
      "auto" => Some(Dialect::Auto),
      _ => None,
    }
  }
}

/// Last observed reachability of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
  Checking,
  Online,
  Offline,
}

impl EndpointStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      EndpointStatus::Checking => "checking",
      EndpointStatus::Online => "online",
      EndpointStatus::Offline => "offline",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "checking" => Some(EndpointStatus::Checking),
      "online" => Some(EndpointStatus::Online),
      "offline" => Some(EndpointStatus::Offline),
      _ => None,
    }
  }
}

/// A monitored host:port.
///
/// Mutable fields (status, last_*, anonymous_count) are owned by the probe
/// engine; `last_latency_ms` is -1 exactly when `last_status` is offline.
#[derive(Debug, Clone)]
pub struct Endpoint {
  pub id: i64,
  pub display_name: String,
  pub host: String,
  pub port: u16,
  pub dialect: Dialect,
  pub last_status: EndpointStatus,
  pub last_roster_size: i64,
  pub max_roster: i64,
  pub last_latency_ms: i64,
  pub last_version: String,
  pub last_motd: String,
  /// Unix seconds; None until the first probe completes.
  pub last_checked_at: Option<i64>,
  pub anonymous_count: i64,
}

/// One persisted probe observation. Append-only; pruned by retention.
#[derive(Debug, Clone)]
pub struct EndpointSample {
  pub id: i64,
  pub endpoint_id: i64,
  pub roster_online: i64,
  pub max_roster: i64,
  pub latency_ms: i64,
  pub version: String,
  pub motd: String,
  pub timestamp: i64,
}

/// A player observed on any monitored endpoint.
#[derive(Debug, Clone)]
pub struct Player {
  pub id: i64,
  pub username: String,
  /// Stable across renames when the server reports it.
  pub uuid: Option<String>,
  pub first_seen: i64,
  pub last_seen: i64,
  pub total_playtime_seconds: i64,
  pub rank: String,
}

/// A contiguous interval one player spent on one endpoint.
/// Open while `leave_time` is None; at most one open session per
/// (player, endpoint) pair.
#[derive(Debug, Clone)]
pub struct Session {
  pub id: i64,
  pub player_id: i64,
  pub endpoint_id: i64,
  pub join_time: i64,
  pub leave_time: Option<i64>,
  pub duration_seconds: i64,
}

impl Session {
  pub fn is_open(&self) -> bool {
    self.leave_time.is_none()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
  Join,
  Leave,
}

impl ActivityKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ActivityKind::Join => "join",
      ActivityKind::Leave => "leave",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "join" => Some(ActivityKind::Join),
      "leave" => Some(ActivityKind::Leave),
      _ => None,
    }
  }
}

/// A recorded join or leave. `session_duration_seconds` is only set on leave.
#[derive(Debug, Clone)]
pub struct Activity {
  pub id: i64,
  pub player_id: i64,
  pub endpoint_id: i64,
  pub kind: ActivityKind,
  pub timestamp: i64,
  pub session_duration_seconds: i64,
}

/// An earned badge; unique per (player, label) and never revoked.
#[derive(Debug, Clone)]
pub struct Title {
  pub id: i64,
  pub player_id: i64,
  pub label: String,
  pub earned_at: i64,
}

/// Row counts used by the retention engine's optimization report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
  pub endpoints: i64,
  pub samples: i64,
  pub players: i64,
  pub sessions: i64,
  pub activities: i64,
  pub titles: i64,
}
