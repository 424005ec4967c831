//! Small shared constants and option-parsing helpers used by the node
//! URL grammar (spec §6) and by the listener/handler configuration
//! structs that consume it.

use std::time::Duration;

/// Default dial timeout applied when a node URL omits `timeout`.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP keep-alive period.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Default SSH `keepalive@golang.org`-equivalent request interval.
pub const DEFAULT_SSH_KEEPALIVE: Duration = Duration::from_secs(5);

/// Default UDP flow idle expiry.
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(60);

/// Default UDP flow table capacity.
pub const DEFAULT_FLOW_BACKLOG: usize = 1024;

/// Default per-flow inbound queue depth.
pub const DEFAULT_FLOW_QUEUE: usize = 128;

/// Default TUN/TAP MTU.
pub const DEFAULT_MTU: u16 = 1500;

/// Maximum UDP-over-TCP payload, bounded by the 16-bit length prefix.
pub const MAX_DATAGRAM_PAYLOAD: usize = u16::MAX as usize;

/// Minimum pooled buffer capacity: max framed payload plus the 2-byte header.
pub const MIN_POOLED_BUFFER: usize = MAX_DATAGRAM_PAYLOAD + 2;

/// Parses a duration from node URL option text (always strings): bare
/// digits are seconds, or a trailing `s`/`m`/`h` unit suffix is
/// accepted, mirroring the subset of Go's `time.ParseDuration` grammar
/// these options actually use. Returns `None` on empty or unparsable
/// input so callers can fall back to a default.
pub fn parse_duration_secs(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.strip_suffix('h') {
        Some(digits) => (digits, 3600),
        None => match raw.strip_suffix('m') {
            Some(digits) => (digits, 60),
            None => (raw.strip_suffix('s').unwrap_or(raw), 1),
        },
    };
    digits.parse::<u64>().ok().map(|v| Duration::from_secs(v * multiplier))
}

pub fn parse_usize(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok()
}

pub fn parse_u16(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok()
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_digits_are_seconds() {
        assert_eq!(parse_duration_secs("30"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn unit_suffixes_are_accepted() {
        assert_eq!(parse_duration_secs("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_secs("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration_secs("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn empty_or_garbage_is_none() {
        assert_eq!(parse_duration_secs(""), None);
        assert_eq!(parse_duration_secs("soon"), None);
    }
}
