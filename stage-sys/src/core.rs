#![allow(non_camel_case_types)]
#![warn(clippy::pedantic)]
#![warn(clippy::all)]
#![allow(clippy::wildcard_imports)]
use enum_primitive::*;
use std::fmt;
use thiserror::Error;

enum_from_primitive! {
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum ErrorCode {
    OK = 0, // included for conciseness, but shouldn't be used
    TIMEOUT = 1,
    NO_RESPONSE = 2,
    COMMAND_REJECTED = 3,
    OUT_OF_RANGE = 4,
    LIMIT_ACTIVE = 5,
    LINK_CLOSED = 6,
}
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::OK => "no error",
            ErrorCode::TIMEOUT => "timed out waiting for controller",
            ErrorCode::NO_RESPONSE => "controller did not respond",
            ErrorCode::COMMAND_REJECTED => "command rejected",
            ErrorCode::OUT_OF_RANGE => "argument out of range",
            ErrorCode::LIMIT_ACTIVE => "motion blocked by limit switch",
            ErrorCode::LINK_CLOSED => "link closed",
        };
        write!(f, "{text} ({})", *self as i32)
    }
}

/// Any failure on the link to the motion controller. Every stage call can return one of these;
/// callers treat them as fatal to the operation in progress.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    #[error("controller error: {0}")]
    Controller(ErrorCode),
    #[error("unparseable controller response {0:?}")]
    BadResponse(String),
    #[error("stage link is not open")]
    NotOpen,
}

impl StageError {
    /// Decode a raw controller error code. Unknown codes are reported as a bad response rather
    /// than dropped.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match ErrorCode::from_i32(code) {
            Some(c) => StageError::Controller(c),
            None => StageError::BadResponse(format!("error code {code}")),
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;

pub const STATUS_IN_MOTION: i32 = 128;
pub const STATUS_HOME_SWITCH: i32 = 2;
pub const STATUS_REVERSE_SWITCH: i32 = 4;
pub const STATUS_FORWARD_SWITCH: i32 = 8;

/// The controller's status byte. The limit switch bits are active-low: the bit is *cleared*
/// while the switch is tripped. The home bit is active-high.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StatusWord(pub i32);

impl StatusWord {
    /// Status with nothing moving and no switch tripped.
    pub const IDLE: StatusWord = StatusWord(STATUS_REVERSE_SWITCH | STATUS_FORWARD_SWITCH);

    #[inline]
    #[must_use]
    pub fn raw(self) -> i32 {
        self.0
    }
    #[inline]
    #[must_use]
    pub fn in_motion(self) -> bool {
        self.0 & STATUS_IN_MOTION != 0
    }
    #[inline]
    #[must_use]
    pub fn home_switch(self) -> bool {
        self.0 & STATUS_HOME_SWITCH != 0
    }
    #[inline]
    #[must_use]
    pub fn reverse_switch(self) -> bool {
        self.0 & STATUS_REVERSE_SWITCH == 0
    }
    #[inline]
    #[must_use]
    pub fn forward_switch(self) -> bool {
        self.0 & STATUS_FORWARD_SWITCH == 0
    }
    #[inline]
    #[must_use]
    pub fn any_switch(self) -> bool {
        self.reverse_switch() || self.home_switch() || self.forward_switch()
    }
}
