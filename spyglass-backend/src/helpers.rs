use rand::distr::{Alphanumeric, SampleString};
use rand::rng;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn generate_subscriber_id() -> String {
  format!("sub-{}", Alphanumeric.sample_string(&mut rng(), 8))
}

pub fn now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap()
    .as_secs() as i64
}

/// Format a duration for log lines.
/// - Show seconds if < 1 minute
/// - Show minutes if < 1 hour
/// - Show hours if < 24 hours
/// - Show days if >= 24 hours
pub fn format_duration(duration_secs: i64) -> String {
  const MINUTE: i64 = 60;
  const HOUR: i64 = 60 * MINUTE;
  const DAY: i64 = 24 * HOUR;

  if duration_secs < MINUTE {
    format!("{}s", duration_secs)
  } else if duration_secs < HOUR {
    let minutes = duration_secs / MINUTE;
    format!("{}m", minutes)
  } else if duration_secs < DAY {
    let hours = duration_secs / HOUR;
    format!("{}h", hours)
  } else {
    let days = duration_secs / DAY;
    format!("{}d", days)
  }
}
