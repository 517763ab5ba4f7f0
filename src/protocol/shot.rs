//! Shot counter and shot time messages.
//!
//! Slot ids are 1-based in discovery order. The wire addresses shots 0-based,
//! so slot `n` is fetched with `#G_STIME=<n-1>`.

use crate::codec;
use crate::error::{Result, WireError};

use super::{TAG_SHOT_COUNT, TAG_SHOT_TIME};

// ---------------------------------------------------------------------------
// #G_SNUM: total shot count
// ---------------------------------------------------------------------------

/// Total shots counted by the timer since its last standby/ready cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotCount {
    pub total: u32,
}

impl ShotCount {
    pub fn decode(line: &str) -> Result<Self> {
        Ok(Self {
            total: codec::read_u32(line, TAG_SHOT_COUNT)?,
        })
    }
}

// ---------------------------------------------------------------------------
// #G_STIME: elapsed time of one shot
// ---------------------------------------------------------------------------

/// Request the elapsed time of the shot in slot `id` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotTimeReq {
    pub id: u32,
}

impl ShotTimeReq {
    /// 0-based id sent on the wire.
    pub fn wire_id(&self) -> u32 {
        self.id.saturating_sub(1)
    }

    pub fn encode(&self) -> String {
        codec::write_assign(TAG_SHOT_TIME, self.wire_id())
    }
}

/// Milliseconds between the start signal and a shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotTime {
    pub elapsed_ms: u32,
}

impl ShotTime {
    pub fn decode(line: &str) -> Result<Self> {
        let raw = codec::read_int(line, TAG_SHOT_TIME)?;
        let elapsed_ms = u32::try_from(raw).map_err(|_| WireError::OutOfRange {
            field: TAG_SHOT_TIME,
            value: raw,
        })?;
        Ok(Self { elapsed_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_decode() {
        assert_eq!(ShotCount::decode("#G_SNUM=12").unwrap().total, 12);
        assert!(ShotCount::decode("#G_SNUM=-1").is_err());
    }

    #[test]
    fn time_request_is_zero_based() {
        assert_eq!(ShotTimeReq { id: 1 }.encode(), "#G_STIME=0");
        assert_eq!(ShotTimeReq { id: 4 }.encode(), "#G_STIME=3");
    }

    #[test]
    fn time_decode() {
        assert_eq!(ShotTime::decode("#G_STIME=5123").unwrap().elapsed_ms, 5123);
        assert!(ShotTime::decode("#G_STIME=").is_err());
        assert!(ShotTime::decode("#G_SNUM=3").is_err());
    }
}
