#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]

use stage_sys::StatusWord;

/// Mechanical spacing between the three limit switches, in stage counts. Fixed by the
/// hardware; these must be re-measured if the switches are moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchOffsets {
    pub home_to_faraday: i64,
    pub faraday_to_end: i64,
}

impl Default for SwitchOffsets {
    fn default() -> Self {
        SwitchOffsets {
            home_to_faraday: 3_679_098,
            faraday_to_end: 2_578_395,
        }
    }
}

/// Which switch the stage was resting on when references were taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Reverse,
    Home,
    Forward,
}

impl Anchor {
    /// Reverse wins over home, home over forward. Only one should ever be tripped at once.
    #[must_use]
    pub fn from_status(status: StatusWord) -> Option<Self> {
        if status.reverse_switch() {
            Some(Anchor::Reverse)
        } else if status.home_switch() {
            Some(Anchor::Home)
        } else if status.forward_switch() {
            Some(Anchor::Forward)
        } else {
            None
        }
    }
}

/// Stage positions of the park (reverse limit), Faraday cup (home switch) and far end (forward
/// limit), in stage counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationReferences {
    pub home: i64,
    pub faraday: i64,
    pub end: i64,
    pub travel_mm: f64,
}

impl CalibrationReferences {
    /// Build the reference set from a single switch reading at `position`.
    #[must_use]
    pub fn from_anchor(
        anchor: Anchor,
        position: i64,
        offsets: SwitchOffsets,
        travel_mm: f64,
    ) -> Self {
        let (home, faraday, end) = match anchor {
            Anchor::Reverse => {
                let faraday = position + offsets.home_to_faraday;
                (position, faraday, faraday + offsets.faraday_to_end)
            }
            Anchor::Home => (
                position - offsets.home_to_faraday,
                position,
                position + offsets.faraday_to_end,
            ),
            Anchor::Forward => {
                let faraday = position - offsets.faraday_to_end;
                (faraday - offsets.home_to_faraday, faraday, position)
            }
        };
        CalibrationReferences {
            home,
            faraday,
            end,
            travel_mm,
        }
    }

    #[inline]
    #[must_use]
    pub fn span(&self) -> i64 {
        self.end - self.home
    }

    /// Distance of `position` from the park position in mm, or `None` when the references are
    /// degenerate.
    #[must_use]
    pub fn position_to_mm(&self, position: i64) -> Option<f64> {
        if self.span() == 0 {
            return None;
        }
        Some((position - self.home) as f64 / self.span() as f64 * self.travel_mm)
    }

    /// Stage counts for a distance in mm from the park position, truncated toward zero.
    #[must_use]
    pub fn mm_to_position(&self, mm: f64) -> Option<i64> {
        if self.span() == 0 || !mm.is_finite() {
            return None;
        }
        Some((mm / self.travel_mm * self.span() as f64 + self.home as f64) as i64)
    }
}
