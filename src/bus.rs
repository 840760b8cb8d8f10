//! Contracts towards the platform: the shared byte bus and the single-shot timer.
//!
//! The driver never touches hardware directly. Every access to the chip is a [Transfer]
//! handed to the platform's [Bus] implementation, which either finishes it on the spot or
//! takes it and reports back later through [FullMac::transfer_done](crate::FullMac::transfer_done).

use embassy_time::Duration;

/// How far a requested operation got.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Progress {
    /// The operation finished synchronously.
    Complete,
    /// The operation was accepted and will finish asynchronously.
    Pending,
}

/// Addressing mode of a bus transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddrMode {
    /// Every byte goes to the same address (FIFO style).
    Fixed,
    /// The address increments with every byte (memory style).
    Increment,
}

/// Errors the bus layer can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusError {
    /// The transaction failed on the wire.
    Io,
    /// The device stopped responding mid transaction.
    Timeout,
}

pub type BusResult<T> = Result<T, BusError>;

/// Identifies an asynchronously completed transfer when it is reported back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum XferTag {
    /// The combined interrupt-status and firmware-status read.
    FwStatus,
    /// The command mailbox response read.
    CmdResponse,
    /// The last member write of the aggregation batch with this sequence number.
    TxBatch(u8),
    /// The Tx result table read.
    TxResult,
}

/// Direction and buffer of a transfer.
pub enum XferData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// One bus transaction.
pub struct Transfer<'a> {
    pub addr: u32,
    pub mode: AddrMode,
    pub data: XferData<'a>,
    /// Another transfer for the same burst follows immediately; the bus should keep the
    /// transaction window open.
    pub more: bool,
    /// Tag reported through the completion path. `None` transfers complete silently.
    pub done: Option<XferTag>,
}
impl<'a> Transfer<'a> {
    pub fn read(addr: u32, mode: AddrMode, buf: &'a mut [u8]) -> Self {
        Self {
            addr,
            mode,
            data: XferData::Read(buf),
            more: false,
            done: None,
        }
    }
    pub fn write(addr: u32, mode: AddrMode, buf: &'a [u8]) -> Self {
        Self {
            addr,
            mode,
            data: XferData::Write(buf),
            more: false,
            done: None,
        }
    }
    pub fn more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }
    pub fn done(mut self, tag: XferTag) -> Self {
        self.done = Some(tag);
        self
    }
    /// Number of payload bytes this transfer moves.
    pub fn len(&self) -> usize {
        match &self.data {
            XferData::Read(buf) => buf.len(),
            XferData::Write(buf) => buf.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The shared byte bus to the chip.
///
/// Contract:
/// - Transfers are executed in issue order, including across a `more` chain.
/// - On [Progress::Complete], a read has already filled its buffer. A tagged transfer
///   that completed this way is finished and is never reported a second time.
/// - `Complete` may only be returned once every earlier transfer has completed too.
/// - On [Progress::Pending], the bus reports through
///   [FullMac::transfer_done](crate::FullMac::transfer_done) on the driver context, lending
///   the read data for the duration of the call. Pending writes report an empty slice.
/// - A transfer without a tag may still complete asynchronously; it is simply never
///   reported.
pub trait Bus {
    fn issue(&mut self, xfer: Transfer<'_>) -> BusResult<Progress>;
}

/// Single-shot timeout timer plus a free-running microsecond clock.
///
/// On expiry the platform must call
/// [FullMac::command_timeout](crate::FullMac::command_timeout) on the driver context.
/// Starting an armed timer re-arms it.
pub trait Timer {
    fn start(&mut self, after: Duration);
    fn cancel(&mut self);
    /// Wrapping microsecond clock, compared against the firmware's local clock.
    fn now_us(&self) -> u32;
}
