#![warn(clippy::pedantic)]
#![warn(clippy::all)]
use crate::core::{StageResult, StatusWord};

/// Capability set of the slit stage and analyzer I/O hanging off the one motion controller.
///
/// Calls are blocking and order-dependent on the physical link, so an implementation is used
/// from one thread at a time; callers that share a stage must serialize access themselves.
pub trait Stage: Send {
    /// # Errors
    /// Fails if the controller at `address` cannot be reached.
    fn open(&mut self, address: &str) -> StageResult<()>;

    /// Begin an absolute move. Returns as soon as the move is commanded; poll
    /// [`Stage::is_in_motion`] to find out when it is done.
    /// # Errors
    /// Propagates link failures.
    fn move_to(&mut self, position: i64) -> StageResult<()>;

    /// # Errors
    /// Propagates link failures.
    fn set_speed(&mut self, counts_per_sec: u32) -> StageResult<()>;

    /// # Errors
    /// Propagates link failures.
    fn set_output_voltage(&mut self, volts: f64) -> StageResult<()>;

    /// # Errors
    /// Propagates link failures.
    fn read_input_voltage(&mut self) -> StageResult<f64>;

    /// # Errors
    /// Propagates link failures.
    fn read_position(&mut self) -> StageResult<i64>;

    /// # Errors
    /// Propagates link failures.
    fn read_status(&mut self) -> StageResult<StatusWord>;

    /// Drive toward the nearest switch edge. Like [`Stage::move_to`] this only starts motion.
    /// # Errors
    /// Propagates link failures.
    fn seek_edge(&mut self) -> StageResult<()>;

    /// # Errors
    /// Propagates link failures.
    fn stop(&mut self) -> StageResult<()>;

    /// # Errors
    /// Propagates link failures.
    fn close(&mut self) -> StageResult<()>;

    /// # Errors
    /// Propagates link failures.
    fn read_status_bitmask(&mut self) -> StageResult<i32> {
        Ok(self.read_status()?.raw())
    }

    /// # Errors
    /// Propagates link failures.
    fn is_in_motion(&mut self) -> StageResult<bool> {
        Ok(self.read_status()?.in_motion())
    }

    /// # Errors
    /// Propagates link failures.
    fn check_home_switch(&mut self) -> StageResult<bool> {
        Ok(self.read_status()?.home_switch())
    }

    /// # Errors
    /// Propagates link failures.
    fn check_forward_switch(&mut self) -> StageResult<bool> {
        Ok(self.read_status()?.forward_switch())
    }

    /// # Errors
    /// Propagates link failures.
    fn check_reverse_switch(&mut self) -> StageResult<bool> {
        Ok(self.read_status()?.reverse_switch())
    }
}
