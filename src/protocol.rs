//! Wire protocol for the DG-Lab socket dialect.
//!
//! Every frame on the broker wire is a JSON envelope with four mandatory
//! string fields (`type`, `clientId`, `targetId`, `message`) plus optional
//! `channel` and `time`. The `message` string carries the actual payload:
//! telemetry reports from the app, commands to the app, or one of the
//! numeric reply codes. Unrecognized `type` values are forwarded verbatim,
//! so the envelope keeps `type` as a plain string.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound for strength and limit values on both channels.
pub const MAX_STRENGTH: u8 = 200;

/// One pulse frame covers 100 ms of output.
pub const FRAME_MS: u64 = 100;

/// Envelope `type` values the broker understands.
pub mod kind {
    pub const BIND: &str = "bind";
    pub const MSG: &str = "msg";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const BREAK: &str = "break";
    pub const ERROR: &str = "error";
}

/// Numeric reply codes (three-digit strings in the `message` field).
pub mod code {
    pub const OK: &str = "200";
    pub const PEER_GONE: &str = "209";
    pub const ALREADY_BOUND: &str = "400";
    pub const TARGET_MISSING: &str = "401";
    pub const NOT_PAIRED: &str = "402";
    pub const BAD_JSON: &str = "403";
    pub const RECIPIENT_OFFLINE: &str = "404";
    pub const OVERSIZE: &str = "405";
    pub const INTERNAL: &str = "500";
}

/// `message` payload of the server→peer id-assignment frame sent on accept.
pub const ASSIGN_ID: &str = "targetId";

/// `message` payload of the pairing handshake.
pub const HANDSHAKE: &str = "DGLAB";

// ═══════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════

/// The four-field JSON envelope every wire frame uses.
///
/// `channel` and `time` are accepted as arbitrary JSON so frames from
/// newer app builds survive a decode/forward round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new(
        kind: &str,
        client_id: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.to_owned(),
            client_id: client_id.into(),
            target_id: target_id.into(),
            message: message.into(),
            channel: None,
            time: None,
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

// ═══════════════════════════════════════════════════════════════
// Channels and strength modes
// ═══════════════════════════════════════════════════════════════

/// Output channel of the device. Strength and clear commands address the
/// channels numerically (1/2); pulse commands by letter (A/B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::A, Channel::B];

    pub fn index(self) -> u8 {
        match self {
            Channel::A => 1,
            Channel::B => 2,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Channel::A => "A",
            Channel::B => "B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" | "a" | "1" => Some(Channel::A),
            "B" | "b" | "2" => Some(Channel::B),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// How a strength command changes the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrengthMode {
    Decrease,
    Increase,
    Set,
}

impl StrengthMode {
    fn wire(self) -> u8 {
        match self {
            StrengthMode::Decrease => 0,
            StrengthMode::Increase => 1,
            StrengthMode::Set => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decrease" => Some(StrengthMode::Decrease),
            "increase" => Some(StrengthMode::Increase),
            "set" => Some(StrengthMode::Set),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// App → controller telemetry payloads
// ═══════════════════════════════════════════════════════════════

static STRENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^strength-(\d+)\+(\d+)\+(\d+)\+(\d+)$").expect("strength regex"));

static FEEDBACK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^feedback-(\d+)$").expect("feedback regex"));

/// Strength/limit report from the app, clamped into 0..=200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrengthReport {
    pub a: u8,
    pub b: u8,
    pub limit_a: u8,
    pub limit_b: u8,
}

fn clamp_part(s: &str) -> u8 {
    // Overflowing digit runs still matched the grammar; they clamp like any
    // other out-of-range value.
    s.parse::<u32>()
        .map_or(MAX_STRENGTH, |v| v.min(u32::from(MAX_STRENGTH)) as u8)
}

/// Parse a `strength-<A>+<B>+<limitA>+<limitB>` payload. Returns `None`
/// unless the payload matches the grammar exactly.
pub fn parse_strength_report(payload: &str) -> Option<StrengthReport> {
    let caps = STRENGTH_RE.captures(payload)?;
    Some(StrengthReport {
        a: clamp_part(caps.get(1)?.as_str()),
        b: clamp_part(caps.get(2)?.as_str()),
        limit_a: clamp_part(caps.get(3)?.as_str()),
        limit_b: clamp_part(caps.get(4)?.as_str()),
    })
}

/// Parse a `feedback-<index>` payload. Indexes 0..=4 are channel A buttons,
/// 5..=9 channel B.
pub fn parse_feedback(payload: &str) -> Option<u8> {
    let caps = FEEDBACK_RE.captures(payload)?;
    caps.get(1)?.as_str().parse::<u8>().ok()
}

/// Channel a feedback index belongs to.
pub fn feedback_channel(index: u8) -> Channel {
    if index < 5 {
        Channel::A
    } else {
        Channel::B
    }
}

// ═══════════════════════════════════════════════════════════════
// Controller → app command payloads
// ═══════════════════════════════════════════════════════════════

/// `strength-<c>+<m>+<v>` — adjust channel strength on the app.
pub fn strength_command(channel: Channel, mode: StrengthMode, value: u8) -> String {
    format!(
        "strength-{}+{}+{}",
        channel.index(),
        mode.wire(),
        value.min(MAX_STRENGTH)
    )
}

/// `pulse-<A|B>:<json-hex-array>` — queue a batch of pulse frames.
pub fn pulse_command(channel: Channel, frames: &[String]) -> String {
    let body = serde_json::to_string(frames).unwrap_or_else(|_| "[]".to_owned());
    format!("pulse-{}:{}", channel.tag(), body)
}

/// `clear-<1|2>` — drop the app's queued frames for the channel.
pub fn clear_command(channel: Channel) -> String {
    format!("clear-{}", channel.index())
}

/// A valid pulse frame is exactly 16 hex characters (100 ms of output).
pub fn is_hex_frame(s: &str) -> bool {
    s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

// ═══════════════════════════════════════════════════════════════
// Internal event bus types
// ═══════════════════════════════════════════════════════════════

/// Why a device session was removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Explicit delete through the outbound API.
    Explicit,
    /// Connection-idle timeout fired before any bind handshake.
    NeverBound,
    /// Reconnection window elapsed without the app returning.
    ReconnectExpired,
    /// Global stale sweep (no activity for the configured TTL).
    Stale,
}

impl SessionEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionEnd::Explicit => "explicit",
            SessionEnd::NeverBound => "never_bound",
            SessionEnd::ReconnectExpired => "reconnect_expired",
            SessionEnd::Stale => "stale",
        }
    }
}

/// Events published to the internal broadcast channel. The agent-facing
/// layer subscribes to drive its notification stream.
#[derive(Debug, Clone)]
pub enum Event {
    /// A bind handshake completed for this device.
    DeviceBound {
        device_id: Uuid,
        controller_id: Uuid,
        app_id: Uuid,
    },
    /// The device lost its app pairing.
    DeviceUnbound {
        device_id: Uuid,
        controller_id: Uuid,
    },
    /// The app reported fresh strength/limit telemetry.
    StrengthChanged {
        device_id: Uuid,
        report: StrengthReport,
    },
    /// The app reported a feedback button press.
    FeedbackReceived {
        device_id: Uuid,
        channel: Channel,
        index: u8,
    },
    /// A controller endpoint went away.
    ControllerDisconnected {
        controller_id: Uuid,
        session_preserved: bool,
    },
    /// An app endpoint went away.
    AppDisconnected { app_id: Uuid },
    /// A device session left the store.
    SessionDeleted { device_id: Uuid, reason: SessionEnd },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_report_parses_and_clamps() {
        let r = parse_strength_report("strength-10+20+150+180").unwrap();
        assert_eq!(
            r,
            StrengthReport {
                a: 10,
                b: 20,
                limit_a: 150,
                limit_b: 180
            }
        );

        // Values past 200 clamp, including absurdly long digit runs.
        let r = parse_strength_report("strength-999+0+99999999999999999999999+200").unwrap();
        assert_eq!(r.a, 200);
        assert_eq!(r.limit_a, 200);
    }

    #[test]
    fn strength_report_rejects_loose_matches() {
        assert!(parse_strength_report("strength-1+2+3").is_none());
        assert!(parse_strength_report("strength-1+2+3+4+5").is_none());
        assert!(parse_strength_report("strength-1+2+3+x").is_none());
        assert!(parse_strength_report(" strength-1+2+3+4").is_none());
        assert!(parse_strength_report("strength-1+2+3+4 ").is_none());
        assert!(parse_strength_report("feedback-1").is_none());
    }

    #[test]
    fn feedback_parses_and_maps_channels() {
        assert_eq!(parse_feedback("feedback-0"), Some(0));
        assert_eq!(parse_feedback("feedback-9"), Some(9));
        assert!(parse_feedback("feedback-").is_none());
        assert!(parse_feedback("feedback-a").is_none());

        assert_eq!(feedback_channel(4), Channel::A);
        assert_eq!(feedback_channel(5), Channel::B);
    }

    #[test]
    fn command_payload_shapes() {
        assert_eq!(
            strength_command(Channel::A, StrengthMode::Set, 100),
            "strength-1+2+100"
        );
        assert_eq!(
            strength_command(Channel::B, StrengthMode::Decrease, 250),
            "strength-2+0+200"
        );
        assert_eq!(
            pulse_command(Channel::A, &["0a0a0a0a0a0a0a0a".to_owned()]),
            r#"pulse-A:["0a0a0a0a0a0a0a0a"]"#
        );
        assert_eq!(clear_command(Channel::B), "clear-2");
    }

    #[test]
    fn hex_frame_validation() {
        assert!(is_hex_frame("0123456789abcdef"));
        assert!(is_hex_frame("FFFFFFFFFFFFFFFF"));
        assert!(!is_hex_frame("0123456789abcde"));
        assert!(!is_hex_frame("0123456789abcdef0"));
        assert!(!is_hex_frame("0123456789abcdeg"));
    }

    #[test]
    fn envelope_round_trip_preserves_field_names() {
        let env = Envelope::new(kind::BIND, "c1", "", ASSIGN_ID);
        let json = env.to_json().unwrap();
        assert!(json.contains(r#""type":"bind""#));
        assert!(json.contains(r#""clientId":"c1""#));
        assert!(json.contains(r#""targetId":"""#));
        // Absent optionals stay off the wire.
        assert!(!json.contains("channel"));
        assert!(!json.contains("time"));

        let back = Envelope::parse(&json).unwrap();
        assert_eq!(back.kind, "bind");
        assert_eq!(back.message, ASSIGN_ID);
    }

    #[test]
    fn envelope_accepts_extra_shapes_for_forwarding() {
        let env =
            Envelope::parse(r#"{"type":"msg","clientId":"a","targetId":"b","message":"hi","channel":2,"time":"now"}"#)
                .unwrap();
        assert_eq!(env.channel, Some(serde_json::json!(2)));
        assert!(Envelope::parse(r#"{"type":"msg"}"#).is_none());
    }
}
