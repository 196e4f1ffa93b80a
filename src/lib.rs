extern crate toml;

pub mod analysis;
pub mod calibration;
pub mod communications;
pub mod configs;
pub mod controller;
pub mod datafile;
pub mod ring_buffer;
pub mod scanner;
pub mod session;
pub mod util;

pub use controller::{ScanController, ScanError, ScanEvent, ScanParams};
pub use scanner::Scanner;
