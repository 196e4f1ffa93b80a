#![warn(clippy::pedantic)]
#![warn(clippy::all)]

pub mod core;
#[cfg(feature = "mock")]
pub mod mock;
pub mod stage;

pub use crate::core::{ErrorCode, StageError, StageResult, StatusWord};
#[cfg(feature = "mock")]
pub use mock::SimStage;
pub use stage::Stage;
