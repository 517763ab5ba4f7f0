//! Message types and decode/encode dispatch.
//!
//! - [`Command`]: lines we send to the timer (APP → device)
//! - [`Message`]: lines the timer sends to us (device → APP)
//!
//! | Direction | Line | Meaning |
//! |---|---|---|
//! | → | `#G_STATE` | query session state |
//! | ← | `#G_STATE=<0\|1\|2>` | IDLE / COUNTDOWN / RUNNING |
//! | → | `#G_SNUM` | query total shot count |
//! | ← | `#G_SNUM=<int>` | monotonically increasing counter |
//! | → | `#G_STIME=<id>` | query elapsed ms of 0-based shot `id` |
//! | ← | `#G_STIME=<int>` | elapsed ms since the start signal |
//! | → | `#S_TMIN=<ms>`, `#S_TMAX=<ms>` | start-delay window |
//! | → | `#E_STARTT` | start / beep |
//! | → | `#S_STB`, `#S_GRD` | standby / ready (zeroes the counter) |
//! | ← | `#ERR=<code>` | error for the preceding command |

pub mod config;
pub mod fault;
pub mod shot;
pub mod status;

use crate::codec;
use crate::error::Result;

pub use fault::{DeviceError, ErrorKind};
pub use status::SessionState;

// ---------------------------------------------------------------------------
// Tag constants
// ---------------------------------------------------------------------------

// Queries (APP sends, device answers with `TAG=value`)
pub const TAG_STATE: &str = "#G_STATE";
pub const TAG_SHOT_COUNT: &str = "#G_SNUM";
pub const TAG_SHOT_TIME: &str = "#G_STIME";

// Settings and actions (no value reply)
pub const TAG_MIN_DELAY: &str = "#S_TMIN";
pub const TAG_MAX_DELAY: &str = "#S_TMAX";
pub const TAG_START: &str = "#E_STARTT";
pub const TAG_STANDBY: &str = "#S_STB";
pub const TAG_READY: &str = "#S_GRD";

// ---------------------------------------------------------------------------
// Command: lines we send to the timer
// ---------------------------------------------------------------------------

/// A command line we send to the timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // -- Queries --
    StateQuery,
    ShotCountQuery,
    ShotTimeQuery(shot::ShotTimeReq),

    // -- Start delay --
    SetMinDelay(u32),
    SetMaxDelay(u32),

    // -- Actions --
    Start,
    Standby,
    Ready,
}

impl Command {
    /// Encode as a command line (without the CR terminator).
    pub fn encode(&self) -> String {
        match self {
            Command::StateQuery => TAG_STATE.to_string(),
            Command::ShotCountQuery => TAG_SHOT_COUNT.to_string(),
            Command::ShotTimeQuery(req) => req.encode(),
            Command::SetMinDelay(ms) => codec::write_assign(TAG_MIN_DELAY, ms),
            Command::SetMaxDelay(ms) => codec::write_assign(TAG_MAX_DELAY, ms),
            Command::Start => TAG_START.to_string(),
            Command::Standby => TAG_STANDBY.to_string(),
            Command::Ready => TAG_READY.to_string(),
        }
    }

    /// Tag of the value line that answers this command, if any.
    pub fn response_tag(&self) -> Option<&'static str> {
        match self {
            Command::StateQuery => Some(TAG_STATE),
            Command::ShotCountQuery => Some(TAG_SHOT_COUNT),
            Command::ShotTimeQuery(_) => Some(TAG_SHOT_TIME),
            Command::SetMinDelay(_)
            | Command::SetMaxDelay(_)
            | Command::Start
            | Command::Standby
            | Command::Ready => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message: lines the timer sends to us
// ---------------------------------------------------------------------------

/// A line the timer sends to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    State(SessionState),
    ShotCount(shot::ShotCount),
    ShotTime(shot::ShotTime),
    Error(DeviceError),

    // -- Forward compat --
    Unknown { line: String },
}

impl Message {
    /// Decode one complete line.
    ///
    /// Known tags with unreadable values are errors; unknown tags decode to
    /// [`Message::Unknown`].
    pub fn decode(line: &str) -> Result<Self> {
        if let Some(err) = fault::decode(line) {
            return Ok(Message::Error(err));
        }
        if codec::has_tag(line, TAG_STATE) {
            Ok(Message::State(SessionState::decode(line)?))
        } else if codec::has_tag(line, TAG_SHOT_COUNT) {
            Ok(Message::ShotCount(shot::ShotCount::decode(line)?))
        } else if codec::has_tag(line, TAG_SHOT_TIME) {
            Ok(Message::ShotTime(shot::ShotTime::decode(line)?))
        } else {
            Ok(Message::Unknown {
                line: line.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding() {
        assert_eq!(Command::StateQuery.encode(), "#G_STATE");
        assert_eq!(Command::ShotCountQuery.encode(), "#G_SNUM");
        assert_eq!(
            Command::ShotTimeQuery(shot::ShotTimeReq { id: 2 }).encode(),
            "#G_STIME=1"
        );
        assert_eq!(Command::SetMinDelay(1500).encode(), "#S_TMIN=1500");
        assert_eq!(Command::SetMaxDelay(4000).encode(), "#S_TMAX=4000");
        assert_eq!(Command::Start.encode(), "#E_STARTT");
        assert_eq!(Command::Standby.encode(), "#S_STB");
        assert_eq!(Command::Ready.encode(), "#S_GRD");
    }

    #[test]
    fn response_tags() {
        assert_eq!(Command::StateQuery.response_tag(), Some(TAG_STATE));
        assert_eq!(Command::Start.response_tag(), None);
    }

    #[test]
    fn message_decode_dispatch() {
        assert_eq!(
            Message::decode("#G_STATE=2").unwrap(),
            Message::State(SessionState::Running)
        );
        assert_eq!(
            Message::decode("#G_SNUM=3").unwrap(),
            Message::ShotCount(shot::ShotCount { total: 3 })
        );
        assert_eq!(
            Message::decode("#G_STIME=900").unwrap(),
            Message::ShotTime(shot::ShotTime { elapsed_ms: 900 })
        );
        assert!(matches!(
            Message::decode("#ERR=02").unwrap(),
            Message::Error(DeviceError { kind: ErrorKind::Busy, .. })
        ));
        assert!(matches!(
            Message::decode("HELLO").unwrap(),
            Message::Unknown { .. }
        ));
        assert!(Message::decode("#G_SNUM=many").is_err());
    }
}
