#![warn(clippy::pedantic)]

use bytes::Bytes;
use futures::future::FutureExt;
use gethostname::gethostname;
use zeromq::prelude::*;

use crate::controller::ScanEvent;
use crate::scanner::Scanner;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str;

macro_rules! to_bytes {
    ($collection:expr) => {
        $collection.iter().flat_map(|x| x.to_le_bytes())
    };
}

/// Number of frames in a published snapshot.
pub const SNAPSHOT_FRAMES: usize = 12;

/// Sockets of the scanner service: a PUB socket streaming session snapshots and events, and a
/// REP socket taking colon-separated commands.
pub struct ScannerComms {
    hostname: String,
    logs_sock: zeromq::PubSocket,
    logs_port: u16,
    command_sock: zeromq::RepSocket,
    command_port: u16,
    logs_publish_frequency_exponent: u8,
    readings_published: usize,
    outgoing_bytes: Vec<Bytes>,
}

impl ScannerComms {
    #[must_use]
    pub fn new() -> Option<Self> {
        let hostname = gethostname().into_string().ok()?;
        Some(ScannerComms {
            outgoing_bytes: vec![Bytes::copy_from_slice(hostname.as_bytes())],
            hostname,
            logs_sock: zeromq::PubSocket::new(),
            logs_port: 8080,
            command_sock: zeromq::RepSocket::new(),
            command_port: 8081,
            logs_publish_frequency_exponent: 3,
            readings_published: 64,
        })
    }

    #[inline]
    #[must_use]
    pub fn logs_port(&self) -> u16 {
        self.logs_port
    }

    #[inline]
    #[must_use]
    pub fn command_port(&self) -> u16 {
        self.command_port
    }

    #[inline]
    #[must_use]
    pub fn logs_publish_frequency_exponent(&self) -> u8 {
        self.logs_publish_frequency_exponent
    }

    /// Publish every `num_cycles` status polls, rounded down to a power of two.
    pub fn set_log_publish_frequency(&mut self, num_cycles: u32) -> &mut Self {
        self.logs_publish_frequency_exponent = num_cycles.checked_ilog2().unwrap_or(0) as u8;
        self
    }

    /// How many of the most recent input readings each snapshot carries.
    pub fn set_readings_published(&mut self, num: usize) -> &mut Self {
        self.readings_published = num;
        self
    }

    #[inline]
    #[must_use]
    pub fn should_publish_logs(&self, num_cycles: u64) -> bool {
        (num_cycles & ((1 << self.logs_publish_frequency_exponent) - 1)) == 0
    }

    /// Answer at most one pending command without waiting for one to arrive. Returns the command
    /// text if one was handled.
    pub async fn handle_socket_request(&mut self, scanner: &mut Scanner) -> Option<String> {
        let received =
            catch_unwind(AssertUnwindSafe(|| self.command_sock.recv().now_or_never()));
        let cmd_msg = match received {
            Ok(msg) => msg?.ok()?,
            Err(_) => {
                log::error!("command socket failed on receive; rebinding sockets");
                if let Err(e) = self.reset_sockets().await {
                    log::error!("failed to rebind sockets: {e}");
                }
                return None;
            }
        };
        let cmd = str::from_utf8(cmd_msg.get(0)?).ok()?.trim();
        let sent = if let Ok(s) = scanner.process_command(cmd.split(':')) {
            self.command_sock.send(s.into()).await
        } else {
            log::warn!("failed to process command [{cmd}]");
            self.command_sock
                .send(format!("Command '{cmd}' not recognized").into())
                .await
        };
        if let Err(e) = sent {
            log::warn!("failed to reply to command [{cmd}]: {e}");
        }
        Some(cmd.to_string())
    }

    /// Replace both sockets with fresh ones bound to the same ports.
    /// # Errors
    /// Propagates any zeromq error from binding the new sockets.
    pub async fn reset_sockets(&mut self) -> zeromq::ZmqResult<()> {
        let _ = self.unbind_sockets().await;
        self.logs_sock = zeromq::PubSocket::new();
        self.command_sock = zeromq::RepSocket::new();
        self.bind_sockets(self.logs_port, self.command_port).await
    }

    /// Publish the current session snapshot as a multipart message of little-endian frames:
    /// hostname, cycle, uptime (s), state, position, position (mm), status word, output volts,
    /// input volts, calibrated flag, rows completed, recent input readings.
    /// # Errors
    /// Propagates any zeromq error in the socket send operation.
    pub async fn publish_logs(&mut self, scanner: &Scanner) -> zeromq::ZmqResult<()> {
        while self.outgoing_bytes.len() < SNAPSHOT_FRAMES {
            self.outgoing_bytes.push(Bytes::new());
        }
        let snap = scanner.controller.session().snapshot();
        let readings = scanner
            .controller
            .session()
            .recent_readings(self.readings_published);
        for (index, frame) in self.outgoing_bytes.iter_mut().enumerate() {
            // reuse each frame's allocation where we can
            macro_rules! match_arm {
                ($($new_bytes:expr),*) => {{
                    let previous_buffer = ::std::mem::replace(frame, Bytes::new());
                    let mut as_vec: Vec<u8> = previous_buffer.into();
                    as_vec.clear();
                    $(as_vec.extend($new_bytes);)*
                    *frame = Bytes::from(as_vec);
                }};
            }
            match index {
                0 => match_arm!(self.hostname.as_bytes()),
                1 => match_arm!(scanner.cycle_counter.to_le_bytes()),
                2 => match_arm!(scanner.start_time.elapsed().as_secs().to_le_bytes()),
                3 => match_arm!(snap.state.to_string().as_bytes()),
                4 => match_arm!(snap.position.to_le_bytes()),
                5 => match_arm!(snap.position_mm().unwrap_or(f64::NAN).to_le_bytes()),
                6 => match_arm!(snap.status.raw().to_le_bytes()),
                7 => match_arm!(snap.output_voltage.to_le_bytes()),
                8 => match_arm!(snap.input_voltage.to_le_bytes()),
                9 => match_arm!([u8::from(snap.calibrated())]),
                10 => match_arm!((snap.rows_completed as u64).to_le_bytes()),
                11 => match_arm!(to_bytes!(readings)),
                _ => {}
            }
        }

        let msg: VecDeque<Bytes> = self.outgoing_bytes.iter().cloned().collect();
        self.logs_sock
            .send(msg.try_into().map_err(zeromq::ZmqError::Other)?)
            .await
    }

    /// Publish a controller event as `[hostname, "EVENT", text]`.
    /// # Errors
    /// Propagates any zeromq error in the socket send operation.
    pub async fn publish_event(&mut self, event: &ScanEvent) -> zeromq::ZmqResult<()> {
        let msg: VecDeque<Bytes> = [
            Bytes::copy_from_slice(self.hostname.as_bytes()),
            Bytes::from_static(b"EVENT"),
            Bytes::from(event.to_string()),
        ]
        .into_iter()
        .collect();
        self.logs_sock
            .send(msg.try_into().map_err(zeromq::ZmqError::Other)?)
            .await
    }

    /// # Errors
    /// In case of any zmq error, aborts early and returns the error.
    pub async fn bind_sockets(
        &mut self,
        log_port: u16,
        command_port: u16,
    ) -> zeromq::ZmqResult<()> {
        self.logs_sock
            .bind(format!("tcp://0.0.0.0:{log_port}").as_str())
            .await?;
        self.logs_port = log_port;
        self.command_sock
            .bind(format!("tcp://0.0.0.0:{command_port}").as_str())
            .await?;
        self.command_port = command_port;
        Ok(())
    }

    /// # Errors
    /// In case of any zmq error, aborts early and returns the error.
    pub async fn unbind_sockets(&mut self) -> zeromq::ZmqResult<()> {
        let _ = self.logs_sock.unbind_all().await;
        let _ = self.command_sock.unbind_all().await;
        Ok(())
    }
}
