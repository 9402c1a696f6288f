//! Acquisition trigger on the sensor's serial line.
//!
//! The sensor flips between running and idle on one fixed command, so
//! starting and stopping write the same bytes.

use std::io::Write;

use anyhow::{Context, Result};

/// Command that toggles acquisition.
pub const TOGGLE_COMMAND: [u8; 8] = [0x08, 0x6B, 0x00, 0x00, 0x00, 0x3E, 0x09, 0xD7];

/// Baud rate of the trigger line.
pub const TRIGGER_BAUD_RATE: u32 = 115_200;

pub struct ToggleTrigger<W: Write> {
    port: W,
    started: bool,
}

impl<W: Write> ToggleTrigger<W> {
    pub fn new(port: W) -> Self {
        Self {
            port,
            started: false,
        }
    }

    /// Whether the last command sent should have left the sensor running.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn toggle(&mut self) -> Result<()> {
        self.port
            .write_all(&TOGGLE_COMMAND)
            .context("writing trigger command")?;
        self.port.flush().context("flushing trigger command")?;
        self.started = !self.started;
        Ok(())
    }

    /// Sends the command unless the sensor is already running.
    pub fn start(&mut self) -> Result<()> {
        if !self.started {
            self.toggle()?;
        }
        Ok(())
    }

    /// Sends the command only if it was started through this trigger.
    pub fn stop(&mut self) -> Result<()> {
        if self.started {
            self.toggle()?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}
