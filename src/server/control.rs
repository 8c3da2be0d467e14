//! Line-based control connection on the base port.
//!
//! Commands are newline-terminated ASCII:
//!
//! - `status`: one line per stream, then `ok`
//! - `ping`: answers `pong`
//! - `quit`: answers `bye` and closes the connection
//!
//! Anything else is echoed back unchanged.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use super::{Connection, ConnectionError, ConnectionHandler};
use crate::context::StreamRegistry;

/// Longest accepted command line, newline included.
pub const MAX_COMMAND_LEN: usize = 1024;

const READ_TICK: Duration = Duration::from_millis(200);

pub struct ControlHandler {
    registry: Arc<StreamRegistry>,
}

impl ControlHandler {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self { registry }
    }

    /// Writes the reply to one line. Returns false when the client asked
    /// to close.
    fn respond<W: Write>(&self, line: &[u8], out: &mut W) -> io::Result<bool> {
        let command = String::from_utf8_lossy(line);
        match command.trim() {
            "status" => {
                for entry in self.registry.entries() {
                    writeln!(out, "{}", entry.status_line())?;
                }
                out.write_all(b"ok\n")?;
            }
            "ping" => out.write_all(b"pong\n")?,
            "quit" => {
                out.write_all(b"bye\n")?;
                return Ok(false);
            }
            _ => out.write_all(line)?,
        }
        Ok(true)
    }
}

impl ConnectionHandler for ControlHandler {
    fn handle(&mut self, conn: &mut Connection<'_>) -> Result<(), ConnectionError> {
        conn.stream().set_read_timeout(Some(READ_TICK))?;
        let mut reader = BufReader::new(conn.stream().try_clone()?);
        let mut line = Vec::with_capacity(MAX_COMMAND_LEN);

        loop {
            if conn.should_stop() {
                return Ok(());
            }
            let limit = (MAX_COMMAND_LEN - line.len()) as u64;
            match (&mut reader).take(limit).read_until(b'\n', &mut line) {
                Ok(0) if line.is_empty() => return Ok(()),
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }

            if line.last() != Some(&b'\n') {
                if line.len() >= MAX_COMMAND_LEN {
                    conn.stream().write_all(b"error: command too long\n")?;
                    return Err(ConnectionError::LineTooLong(MAX_COMMAND_LEN));
                }
                // Partial line: wait for the rest, unless the peer is gone.
                if reader.fill_buf().map(|b| b.is_empty()).unwrap_or(false) {
                    return Ok(());
                }
                continue;
            }

            tracing::debug!(peer = %conn.peer(), command = %String::from_utf8_lossy(&line).trim(), "Control command");
            let keep_open = self.respond(&line, conn.stream())?;
            line.clear();
            if !keep_open {
                return Ok(());
            }
        }
    }
}
