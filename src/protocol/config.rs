//! Start-delay configuration (`#S_TMIN`, `#S_TMAX`).
//!
//! The timer draws its beep delay from `[TMIN, TMAX]` milliseconds after
//! `#E_STARTT`. A fixed delay is expressed as `TMIN == TMAX`.

/// How the start delay is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "mode", rename_all = "snake_case"))]
pub enum StartMode {
    /// Always beep after `delay_ms`.
    Fixed { delay_ms: u32 },
    /// Beep after a random delay in `[min_ms, max_ms]`.
    Randomized { min_ms: u32, max_ms: u32 },
}

impl StartMode {
    /// `(TMIN, TMAX)` for this mode, ordered.
    pub fn window(&self) -> (u32, u32) {
        match *self {
            StartMode::Fixed { delay_ms } => (delay_ms, delay_ms),
            StartMode::Randomized { min_ms, max_ms } => (min_ms.min(max_ms), min_ms.max(max_ms)),
        }
    }
}

impl Default for StartMode {
    fn default() -> Self {
        StartMode::Randomized {
            min_ms: 2000,
            max_ms: 4000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_is_degenerate() {
        assert_eq!(StartMode::Fixed { delay_ms: 3000 }.window(), (3000, 3000));
    }

    #[test]
    fn randomized_window_is_ordered() {
        let mode = StartMode::Randomized {
            min_ms: 5000,
            max_ms: 1500,
        };
        assert_eq!(mode.window(), (1500, 5000));
    }
}
