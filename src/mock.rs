//! Test doubles: a scriptable bus, a hand-cranked timer and a recording client.

use embassy_time::Duration;

use crate::{
    bus::{AddrMode, Bus, BusError, BusResult, Progress, Timer, Transfer, XferData, XferTag},
    cmd::CommandId,
    mac::{DriverError, DriverResult, Fault, MacClient},
    slots::SlotId,
    txres::TxOutcome,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// Record of one transfer as the bus saw it.
#[derive(Clone, Debug)]
pub(crate) struct Issued {
    pub addr: u32,
    pub mode: AddrMode,
    pub dir: Dir,
    /// Written payload for writes, delivered payload for reads.
    pub bytes: Vec<u8>,
    pub more: bool,
    pub done: Option<XferTag>,
}

/// Bus double. Reads are served from scripted responses, consumed in script order per
/// address; unscripted reads deliver zeroes. Addresses can be made to go pending or to
/// fail outright.
pub(crate) struct MockBus {
    pub issued: Vec<Issued>,
    reads: Vec<(u32, Vec<u8>)>,
    pending_addrs: Vec<u32>,
    pub pending_all: bool,
    fail_addrs: Vec<u32>,
}
impl MockBus {
    pub fn new() -> Self {
        Self {
            issued: Vec::new(),
            reads: Vec::new(),
            pending_addrs: Vec::new(),
            pending_all: false,
            fail_addrs: Vec::new(),
        }
    }
    pub fn script_read(&mut self, addr: u32, bytes: Vec<u8>) {
        self.reads.push((addr, bytes));
    }
    pub fn make_pending(&mut self, addr: u32) {
        self.pending_addrs.push(addr);
    }
    pub fn fail(&mut self, addr: u32) {
        self.fail_addrs.push(addr);
    }
    fn next_scripted(&mut self, addr: u32) -> Option<Vec<u8>> {
        let at = self.reads.iter().position(|(a, _)| *a == addr)?;
        Some(self.reads.remove(at).1)
    }
}
impl Bus for MockBus {
    fn issue(&mut self, xfer: Transfer<'_>) -> BusResult<Progress> {
        let mut record = Issued {
            addr: xfer.addr,
            mode: xfer.mode,
            dir: match &xfer.data {
                XferData::Read(_) => Dir::Read,
                XferData::Write(_) => Dir::Write,
            },
            bytes: match &xfer.data {
                XferData::Read(_) => Vec::new(),
                XferData::Write(data) => data.to_vec(),
            },
            more: xfer.more,
            done: xfer.done,
        };
        if self.fail_addrs.contains(&xfer.addr) {
            self.issued.push(record);
            return Err(BusError::Io);
        }
        if self.pending_all || self.pending_addrs.contains(&xfer.addr) {
            self.issued.push(record);
            return Ok(Progress::Pending);
        }
        if let XferData::Read(buf) = xfer.data {
            if let Some(scripted) = self.next_scripted(xfer.addr) {
                let n = scripted.len().min(buf.len());
                buf[..n].copy_from_slice(&scripted[..n]);
            } else {
                buf.fill(0);
            }
            record.bytes = buf.to_vec();
        }
        self.issued.push(record);
        Ok(Progress::Complete)
    }
}

pub(crate) struct TestTimer {
    pub armed: Option<Duration>,
    pub cancels: u32,
    /// Value [Timer::now_us] reports; tests move it by hand.
    pub now: u32,
}
impl TestTimer {
    pub fn new() -> Self {
        Self {
            armed: None,
            cancels: 0,
            now: 0,
        }
    }
}
impl Timer for TestTimer {
    fn start(&mut self, after: Duration) {
        self.armed = Some(after);
    }
    fn cancel(&mut self) {
        self.armed = None;
        self.cancels += 1;
    }
    fn now_us(&self) -> u32 {
        self.now
    }
}

/// Everything the driver told the client, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    TxSent(SlotId),
    TxComplete(TxOutcome),
    RxReady,
    FwEvent(u8),
    QueuesResumed(u8),
    CommandComplete(CommandId, u16, Vec<u8>),
    CommandFailed(CommandId, Vec<u8>),
    InitComplete,
    Fault(Fault),
}

pub(crate) struct TestClient {
    pub events: Vec<Event>,
    /// What [MacClient::rx_ready] answers.
    pub rx_progress: Progress,
    /// What [MacClient::fw_event] answers.
    pub event_progress: Progress,
    /// Forced failure for [MacClient::rx_ready].
    pub rx_error: Option<DriverError>,
}
impl TestClient {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            rx_progress: Progress::Complete,
            event_progress: Progress::Complete,
            rx_error: None,
        }
    }
}
impl MacClient for TestClient {
    fn tx_sent(&mut self, slot: SlotId) {
        self.events.push(Event::TxSent(slot));
    }
    fn tx_complete(&mut self, outcome: TxOutcome) {
        self.events.push(Event::TxComplete(outcome));
    }
    fn rx_ready(&mut self) -> DriverResult<Progress> {
        self.events.push(Event::RxReady);
        if let Some(err) = self.rx_error {
            return Err(err);
        }
        Ok(self.rx_progress)
    }
    fn fw_event(&mut self, mailbox: u8) -> DriverResult<Progress> {
        self.events.push(Event::FwEvent(mailbox));
        Ok(self.event_progress)
    }
    fn queues_resumed(&mut self, classes: u8) {
        self.events.push(Event::QueuesResumed(classes));
    }
    fn command_complete(&mut self, id: CommandId, status: u16, payload: &[u8]) {
        self.events
            .push(Event::CommandComplete(id, status, payload.to_vec()));
    }
    fn command_failed(&mut self, id: CommandId, partial: &[u8]) {
        self.events.push(Event::CommandFailed(id, partial.to_vec()));
    }
    fn init_complete(&mut self) {
        self.events.push(Event::InitComplete);
    }
    fn fault(&mut self, fault: Fault) {
        self.events.push(Event::Fault(fault));
    }
}
