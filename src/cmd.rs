//! Command mailbox.
//!
//! Exactly one command may be outstanding. A request is staged into a fixed buffer
//! behind a 4-byte header, written to the mailbox padded to bus alignment, and announced
//! with a doorbell write to the interrupt trigger register. The firmware answers through
//! the command-complete interrupt, at which point the mailbox is read back for the reply
//! length the caller expects and handed to the client. A watchdog timer covers the round
//! trip; on expiry the command is reported failed and the mailbox reopens. Retrying is
//! the upper layer's call, never ours.

use embassy_time::Duration;

use crate::{
    bus::{AddrMode, Bus, Progress, Timer, Transfer, XferTag},
    mac::{DriverError, DriverResult, MacClient},
    regs::{pad_len, CMD_MAILBOX, INTR_TRIG_CMD, REG_INTR_TRIG},
};

/// Most payload bytes a single command can carry.
pub const CMD_MAX_PAYLOAD: usize = 240;

const CMD_HEADER_LEN: usize = 4;
const CMD_BUF_LEN: usize = CMD_HEADER_LEN + CMD_MAX_PAYLOAD;

/// Opaque command identifier, chosen by the upper layer and echoed by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandId(pub u16);

pub(crate) struct CommandMailbox {
    buf: [u8; CMD_BUF_LEN],
    inflight: Option<CommandId>,
    /// Response read on the wire.
    reading: bool,
    /// Reply payload bytes the caller asked for.
    reply_len: usize,
    timeout: Duration,
}
impl CommandMailbox {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            buf: [0u8; CMD_BUF_LEN],
            inflight: None,
            reading: false,
            reply_len: 0,
            timeout,
        }
    }
    pub fn busy(&self) -> bool {
        self.inflight.is_some()
    }
    /// Stage and transmit one command expecting `reply_len` payload bytes back.
    pub fn send<B: Bus, T: Timer>(
        &mut self,
        bus: &mut B,
        timer: &mut T,
        id: CommandId,
        payload: &[u8],
        reply_len: usize,
    ) -> DriverResult<()> {
        if payload.len() > CMD_MAX_PAYLOAD || reply_len > CMD_MAX_PAYLOAD {
            return Err(DriverError::PayloadTooLong);
        }
        if self.inflight.is_some() {
            return Err(DriverError::CommandInFlight);
        }
        self.buf[0..2].copy_from_slice(&id.0.to_le_bytes());
        // The status field is firmware territory, zeroed in requests.
        self.buf[2..4].copy_from_slice(&0u16.to_le_bytes());
        self.buf[CMD_HEADER_LEN..CMD_HEADER_LEN + payload.len()].copy_from_slice(payload);
        let wire_len = pad_len(CMD_HEADER_LEN + payload.len());
        for byte in self.buf[CMD_HEADER_LEN + payload.len()..wire_len].iter_mut() {
            *byte = 0;
        }
        bus.issue(Transfer::write(
            CMD_MAILBOX,
            AddrMode::Increment,
            &self.buf[..wire_len],
        ))?;
        bus.issue(Transfer::write(
            REG_INTR_TRIG,
            AddrMode::Increment,
            &INTR_TRIG_CMD.to_le_bytes(),
        ))?;
        self.inflight = Some(id);
        self.reply_len = reply_len;
        timer.start(self.timeout);
        trace!("Command {:#x} sent, {} payload bytes.", id.0, payload.len());
        Ok(())
    }
    /// The firmware raised command-complete; fetch and deliver the response.
    pub fn on_complete<B: Bus, T: Timer, C: MacClient>(
        &mut self,
        bus: &mut B,
        timer: &mut T,
        client: &mut C,
    ) -> DriverResult<Progress> {
        if self.inflight.is_none() {
            debug!("Command completion with no command in flight.");
            return Ok(Progress::Complete);
        }
        timer.cancel();
        let read_len = pad_len(CMD_HEADER_LEN + self.reply_len);
        let progress = bus.issue(
            Transfer::read(CMD_MAILBOX, AddrMode::Increment, &mut self.buf[..read_len])
                .done(XferTag::CmdResponse),
        )?;
        match progress {
            Progress::Complete => {
                let response = self.buf;
                self.deliver(client, &response[..read_len]);
                Ok(Progress::Complete)
            }
            Progress::Pending => {
                self.reading = true;
                Ok(Progress::Pending)
            }
        }
    }
    /// Feed back a response read that completed asynchronously.
    pub fn read_done<C: MacClient>(&mut self, client: &mut C, response: &[u8]) {
        if !self.reading {
            error!("Command response delivered without a read in flight.");
            return;
        }
        self.reading = false;
        if response.len() < CMD_HEADER_LEN {
            error!("Short command response: {} bytes.", response.len());
            if let Some(id) = self.inflight.take() {
                client.command_failed(id, response);
            }
            return;
        }
        self.deliver(client, response);
    }
    /// Fail any outstanding command without an answer. Covers a response read dying on
    /// the bus as well as a deliberate driver stop.
    pub fn abort<C: MacClient>(&mut self, client: &mut C) {
        self.reading = false;
        if let Some(id) = self.inflight.take() {
            client.command_failed(id, &[]);
        }
    }
    /// The round-trip timer fired before the firmware answered.
    pub fn timed_out<C: MacClient>(&mut self, client: &mut C) {
        let Some(id) = self.inflight.take() else {
            debug!("Command timer fired with nothing in flight.");
            return;
        };
        self.reading = false;
        warn!("Command {:#x} timed out.", id.0);
        client.command_failed(id, &[]);
    }
    fn deliver<C: MacClient>(&mut self, client: &mut C, response: &[u8]) {
        let Some(id) = self.inflight.take() else {
            return;
        };
        let echoed = u16::from_le_bytes([response[0], response[1]]);
        if echoed != id.0 {
            warn!(
                "Response carries id {:#x}, request was {:#x}.",
                echoed, id.0
            );
        }
        let status = u16::from_le_bytes([response[2], response[3]]);
        trace!("Command {:#x} answered with status {}.", id.0, status);
        let take = self.reply_len.min(response.len() - CMD_HEADER_LEN);
        client.command_complete(id, status, &response[CMD_HEADER_LEN..CMD_HEADER_LEN + take]);
    }
    /// Drop any in-flight command after a firmware restart.
    pub fn restart(&mut self) {
        self.inflight = None;
        self.reading = false;
        self.reply_len = 0;
    }
}
