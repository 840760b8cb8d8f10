//! Driver core: firmware event coordination and the public surface.
//!
//! The chip raises a single level interrupt for everything it wants to tell us. What
//! actually happened only becomes visible after reading the status block, which starts
//! with the clear-on-read interrupt vector. One read therefore drives one coordination
//! cycle: take the latched signal, read the status block, then work through the vector
//! in a fixed order. Command responses are handled before generic events so that a
//! command completion is never reordered behind event traffic it may have caused. The
//! data bit is shared by three producers (received frames, freed Tx blocks and Tx
//! results), so it fans out into the RX hook, the block reconciliation and the result
//! table poll.
//!
//! Handlers and table reads may finish asynchronously. The cycle counts them and sits in
//! [MacState::WaitingHandlers] until each one reported back, then checks the signal
//! again; an interrupt that fired while we were busy is latched in [IrqSignal] and costs
//! a fresh status read, never a lost event. All of this runs on one worker context. The
//! only things an interrupt handler may touch directly are [IrqSignal::raise] and the
//! slot pool.
//!
//! Faults are decided here and nowhere else. A firmware watchdog report or any failed
//! bus transfer halts the core: the client hears [MacClient::fault] exactly once and
//! every entry point answers [DriverError::Halted] until [FullMac::restart].

use embassy_time::Duration;

use crate::{
    bus::{AddrMode, Bus, BusError, BusResult, Progress, Timer, Transfer, XferTag},
    cmd::{CommandId, CommandMailbox},
    hwq::{AccessClass, Admission, BlockPolicy, HwQueues, NUM_CLASSES},
    regs::{
        FwStatus, FW_STATUS, FW_STATUS_LEN, INTR_CMD_COMPLETE, INTR_DATA, INTR_EVENT_A,
        INTR_EVENT_B, INTR_INIT_COMPLETE, INTR_SCOPE_ALL, INTR_SCOPE_INIT, INTR_WATCHDOG,
    },
    slots::{SlotId, SlotPool},
    sync::IrqSignal,
    tx::{AggPolicy, TxPath},
    txres::{TxOutcome, TxResults},
};

/// Ways a driver call can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverError {
    /// A bus transfer failed. This is always fatal for the driver core.
    Bus(BusError),
    /// A mailbox command is already outstanding.
    CommandInFlight,
    /// Command payload exceeds [crate::cmd::CMD_MAX_PAYLOAD].
    PayloadTooLong,
    /// Frame exceeds [crate::tx::MAX_FRAME].
    FrameTooLong,
    /// The core halted after a fatal fault and needs [FullMac::restart].
    Halted,
}
pub type DriverResult<T> = Result<T, DriverError>;
impl From<BusError> for DriverError {
    fn from(err: BusError) -> Self {
        DriverError::Bus(err)
    }
}

/// What brought the core down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The firmware watchdog expired.
    Watchdog,
    /// A bus transfer failed.
    Bus(BusError),
}

/// Which interrupt sources the host currently reacts to.
///
/// Bits outside the scope still clear on read but are dropped without dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventScope {
    /// Boot-time set: watchdog, init-complete and command-complete.
    Init,
    /// Everything, for normal operation.
    All,
}
impl EventScope {
    fn mask(self) -> u32 {
        match self {
            EventScope::Init => INTR_SCOPE_INIT,
            EventScope::All => INTR_SCOPE_ALL,
        }
    }
}

/// Where the coordination cycle currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacState {
    /// No cycle in progress; the next latched signal starts one.
    Idle,
    /// Status read on the wire.
    ReadingStatus,
    /// Status dispatched; handlers or table reads still outstanding.
    WaitingHandlers,
    /// Fatal fault. Only [FullMac::restart] leaves this state.
    Halted,
}

/// Upcalls from the driver core into the next layer.
///
/// All callbacks arrive on the worker context, never from an interrupt handler.
pub trait MacClient {
    /// A staged frame left the host over the bus. Reported exactly once per frame,
    /// unless the send call already covered it with a synchronous `Complete`.
    fn tx_sent(&mut self, slot: SlotId);
    /// The firmware finished a frame. Its slot is already back in the pool.
    fn tx_complete(&mut self, outcome: TxOutcome);
    /// Received frames are waiting on the device. Return `Pending` when pick-up
    /// continues asynchronously and report with [FullMac::handler_done]. An error,
    /// usually a bus transfer that failed inside the handler, halts the core.
    fn rx_ready(&mut self) -> DriverResult<Progress>;
    /// Event mailbox `mailbox` (0 or 1) has data. Same completion contract as
    /// [MacClient::rx_ready].
    fn fw_event(&mut self, mailbox: u8) -> DriverResult<Progress>;
    /// Backpressure lifted for the classes in `classes`, a bitmap of
    /// [AccessClass::bit] values.
    fn queues_resumed(&mut self, classes: u8);
    /// The firmware answered a mailbox command.
    fn command_complete(&mut self, id: CommandId, status: u16, payload: &[u8]);
    /// A mailbox command died without a full answer. `partial` holds whatever response
    /// bytes did arrive; empty on a timeout. Retrying is the caller's decision.
    fn command_failed(&mut self, id: CommandId, partial: &[u8]);
    /// The firmware finished booting.
    fn init_complete(&mut self);
    /// The core halted. Tear down, then call [FullMac::restart].
    fn fault(&mut self, fault: Fault);
}

/// Driver tuning, fixed at construction and at [FullMac::restart].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Total Tx buffer blocks. Usually zero here and set from the firmware's boot
    /// advertisement through [FullMac::set_total_blocks].
    pub total_blocks: u16,
    /// Per-class low thresholds in blocks, indexed by [AccessClass::index].
    pub low_thresholds: [u16; NUM_CLASSES],
    pub block: BlockPolicy,
    pub agg: AggPolicy,
    /// Most Tx descriptors the firmware accepts in flight.
    pub fw_descr_limit: u8,
    /// Round-trip budget for mailbox commands.
    pub cmd_timeout: Duration,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            total_blocks: 0,
            low_thresholds: [8; NUM_CLASSES],
            block: BlockPolicy::default(),
            agg: AggPolicy::default(),
            fw_descr_limit: 32,
            cmd_timeout: Duration::from_millis(750),
        }
    }
}

/// The driver core.
///
/// Owns the bus, the command timer and the client; shares the slot pool and the
/// interrupt signal with whoever feeds it. Every method must be called from the one
/// worker context.
pub struct FullMac<'res, B, T, C> {
    bus: B,
    timer: T,
    client: C,
    pool: &'res SlotPool,
    irq: &'res IrqSignal,
    hwq: HwQueues,
    tx: TxPath,
    results: TxResults,
    cmd: CommandMailbox,
    state: MacState,
    scope: EventScope,
    enabled: bool,
    /// Handlers and table reads still outstanding in this cycle.
    pending: u8,
    /// Host clock minus firmware clock, in microseconds, from the last status read.
    fw_time_offset: u32,
    status_buf: [u8; FW_STATUS_LEN],
}
impl<'res, B: Bus, T: Timer, C: MacClient> FullMac<'res, B, T, C> {
    pub fn new(
        bus: B,
        timer: T,
        client: C,
        pool: &'res SlotPool,
        irq: &'res IrqSignal,
        config: Config,
    ) -> Self {
        let mut hwq = HwQueues::new(config.block, config.fw_descr_limit);
        hwq.configure(config.low_thresholds);
        hwq.set_total_blocks(config.total_blocks);
        Self {
            bus,
            timer,
            client,
            pool,
            irq,
            hwq,
            tx: TxPath::new(config.agg),
            results: TxResults::new(),
            cmd: CommandMailbox::new(config.cmd_timeout),
            state: MacState::Idle,
            scope: EventScope::Init,
            enabled: false,
            pending: 0,
            fw_time_offset: 0,
            status_buf: [0u8; FW_STATUS_LEN],
        }
    }
    /// Open the host-side gate and drain anything already latched.
    pub fn enable(&mut self) -> DriverResult<()> {
        self.enabled = true;
        self.poll()
    }
    /// Close the host-side gate. Signals keep latching and are processed on the next
    /// [FullMac::poll] after [FullMac::enable].
    pub fn disable(&mut self) {
        self.enabled = false;
    }
    pub fn set_event_scope(&mut self, scope: EventScope) {
        trace!("Event scope set, mask {:#x}.", scope.mask());
        self.scope = scope;
    }
    pub fn state(&self) -> MacState {
        self.state
    }
    /// Run coordination cycles until nothing more can happen without new input.
    ///
    /// Call after [IrqSignal] fires and after any completion callback.
    pub fn poll(&mut self) -> DriverResult<()> {
        loop {
            match self.state {
                MacState::Halted => return Err(DriverError::Halted),
                MacState::Idle => {
                    if !self.enabled || !self.irq.take() {
                        return Ok(());
                    }
                    let started = self.begin_status_read();
                    self.run(started)?;
                    if self.state == MacState::ReadingStatus {
                        return Ok(());
                    }
                }
                // The bus drives the next step through transfer_done.
                MacState::ReadingStatus => return Ok(()),
                MacState::WaitingHandlers => {
                    if self.pending > 0 {
                        return Ok(());
                    }
                    trace!("Coordination cycle finished.");
                    self.state = MacState::Idle;
                }
            }
        }
    }
    /// Report the completion of a tagged bus transfer.
    ///
    /// Reads hand their payload in through `result`; writes report an empty slice.
    pub fn transfer_done(&mut self, tag: XferTag, result: BusResult<&[u8]>) -> DriverResult<()> {
        if self.state == MacState::Halted {
            return Err(DriverError::Halted);
        }
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                match tag {
                    XferTag::FwStatus => error!("Status read failed on the bus."),
                    // The halt below fails the in-flight command.
                    XferTag::CmdResponse => error!("Command response read failed on the bus."),
                    XferTag::TxBatch(seq) => {
                        error!("Tx batch {} failed on the bus.", seq);
                        self.tx.batch_failed(seq);
                    }
                    XferTag::TxResult => {
                        error!("Tx result read failed on the bus.");
                        self.results.read_failed();
                    }
                }
                self.halt(Fault::Bus(err));
                return Err(DriverError::Bus(err));
            }
        };
        match tag {
            XferTag::FwStatus => {
                if self.state != MacState::ReadingStatus {
                    error!("Status block delivered outside a status read.");
                    return Ok(());
                }
                if bytes.len() < FW_STATUS_LEN {
                    self.halt(Fault::Bus(BusError::Io));
                    return Err(DriverError::Bus(BusError::Io));
                }
                self.status_buf.copy_from_slice(&bytes[..FW_STATUS_LEN]);
                let buf = self.status_buf;
                let dispatched = self.dispatch_status(&buf);
                self.run(dispatched)?;
            }
            XferTag::CmdResponse => {
                self.cmd.read_done(&mut self.client, bytes);
                self.finish_pending();
            }
            XferTag::TxBatch(seq) => {
                self.tx.batch_done(&mut self.client, seq);
            }
            XferTag::TxResult => {
                let processed = self
                    .results
                    .read_done(&mut self.bus, self.pool, &mut self.client, bytes);
                self.run(processed)?;
                self.finish_pending();
            }
        }
        self.poll()
    }
    /// A client handler that returned `Pending` has finished its work.
    pub fn handler_done(&mut self) -> DriverResult<()> {
        self.finish_pending();
        self.poll()
    }
    /// Report expiry of the command round-trip timer.
    pub fn command_timeout(&mut self) {
        self.cmd.timed_out(&mut self.client);
    }

    fn begin_status_read(&mut self) -> DriverResult<()> {
        self.state = MacState::ReadingStatus;
        let progress = self.bus.issue(
            Transfer::read(FW_STATUS, AddrMode::Increment, &mut self.status_buf)
                .done(XferTag::FwStatus),
        )?;
        match progress {
            Progress::Complete => {
                let buf = self.status_buf;
                self.dispatch_status(&buf)
            }
            Progress::Pending => Ok(()),
        }
    }
    /// Work through one status snapshot in dispatch order.
    fn dispatch_status(&mut self, buf: &[u8; FW_STATUS_LEN]) -> DriverResult<()> {
        let status = FwStatus::parse(buf);
        self.fw_time_offset = self.timer.now_us().wrapping_sub(status.fw_localtime);
        let events = status.intr & self.scope.mask();
        if events != status.intr {
            debug!(
                "Dropping out-of-scope interrupt bits {:#x}.",
                status.intr & !self.scope.mask()
            );
        }
        trace!("Dispatching interrupt vector {:#x}.", events);
        self.state = MacState::WaitingHandlers;
        self.pending = 0;

        if events & INTR_WATCHDOG != 0 {
            error!("Firmware watchdog expired.");
            self.halt(Fault::Watchdog);
            return Err(DriverError::Halted);
        }
        if events & INTR_INIT_COMPLETE != 0 {
            debug!("Firmware init complete.");
            self.client.init_complete();
        }
        if events & INTR_CMD_COMPLETE != 0 {
            let progress = self
                .cmd
                .on_complete(&mut self.bus, &mut self.timer, &mut self.client)?;
            if progress == Progress::Pending {
                self.pending += 1;
            }
        }
        if events & INTR_EVENT_A != 0 {
            if self.client.fw_event(0)? == Progress::Pending {
                self.pending += 1;
            }
        }
        if events & INTR_EVENT_B != 0 {
            if self.client.fw_event(1)? == Progress::Pending {
                self.pending += 1;
            }
        }
        if events & INTR_DATA != 0 {
            if self.client.rx_ready()? == Progress::Pending {
                self.pending += 1;
            }
            let resumed = self.hwq.reconcile_all(&status);
            if resumed != 0 {
                self.client.queues_resumed(resumed);
            }
            let progress =
                self.results
                    .poll(&mut self.bus, self.pool, &mut self.client, status.tx_result_counter)?;
            if progress == Progress::Pending {
                self.pending += 1;
            }
        }
        Ok(())
    }
    fn finish_pending(&mut self) {
        if self.pending == 0 {
            warn!("Completion reported with no pending handlers.");
            return;
        }
        self.pending -= 1;
    }
    /// Turn bus failures into a halt; everything else passes through.
    fn run<V>(&mut self, result: DriverResult<V>) -> DriverResult<V> {
        if let Err(DriverError::Bus(err)) = result {
            self.halt(Fault::Bus(err));
        }
        result
    }
    fn halt(&mut self, fault: Fault) {
        if self.state == MacState::Halted {
            return;
        }
        match fault {
            Fault::Watchdog => error!("Driver core halted: firmware watchdog expired."),
            Fault::Bus(_) => error!("Driver core halted: bus fault."),
        }
        self.state = MacState::Halted;
        self.enabled = false;
        self.pending = 0;
        self.timer.cancel();
        self.cmd.abort(&mut self.client);
        self.client.fault(fault);
    }
    /// Halt the core deliberately. No [MacClient::fault] is raised; any outstanding
    /// command is failed. Only [FullMac::restart] brings the core back.
    pub fn stop(&mut self) {
        if self.state == MacState::Halted {
            return;
        }
        debug!("Driver core stopped.");
        self.state = MacState::Halted;
        self.enabled = false;
        self.pending = 0;
        self.timer.cancel();
        self.cmd.abort(&mut self.client);
    }
    /// Reset every component after the upper layer brought the firmware back up.
    ///
    /// Counters, slots, budgets and the latched signal all return to their boot state.
    /// The event scope drops back to [EventScope::Init] and the gate stays closed until
    /// [FullMac::enable].
    pub fn restart(&mut self) {
        debug!("Restarting driver core.");
        self.pool.reset();
        self.irq.reset();
        self.hwq.restart();
        self.tx.restart();
        self.results.restart();
        self.cmd.restart();
        self.state = MacState::Idle;
        self.scope = EventScope::Init;
        self.enabled = false;
        self.pending = 0;
        self.fw_time_offset = 0;
    }

    /// Adopt the block total the firmware advertised at boot.
    pub fn set_total_blocks(&mut self, total: u16) {
        self.hwq.set_total_blocks(total);
    }
    pub fn alloc_slot(&self) -> Option<SlotId> {
        self.pool.allocate()
    }
    pub fn free_slot(&self, slot: SlotId) -> bool {
        self.pool.free(slot)
    }
    /// Blocks a frame of `len` bytes will occupy on the device.
    pub fn estimate_blocks(&self, len: usize) -> u16 {
        self.hwq.estimate_blocks(len)
    }
    /// Ask for admission of one frame worth `blocks`.
    pub fn try_reserve(&mut self, class: AccessClass, blocks: u16) -> Admission {
        self.hwq.try_reserve(class, blocks)
    }
    /// Stage one admitted frame for transmission.
    ///
    /// `blocks` is the amount granted by [FullMac::try_reserve] for this frame.
    pub fn send(
        &mut self,
        slot: SlotId,
        class: AccessClass,
        blocks: u16,
        flags: u8,
        frame: &[u8],
    ) -> DriverResult<Progress> {
        if self.state == MacState::Halted {
            return Err(DriverError::Halted);
        }
        let sent = self
            .tx
            .send(&mut self.bus, &mut self.client, slot, class, blocks, flags, frame);
        self.run(sent)
    }
    /// Flush the open aggregation batch; the traffic source has nothing more for now.
    pub fn end_of_burst(&mut self) -> DriverResult<Progress> {
        if self.state == MacState::Halted {
            return Err(DriverError::Halted);
        }
        let flushed = self.tx.end_of_burst(&mut self.bus, &mut self.client);
        self.run(flushed)
    }
    /// Send one mailbox command expecting `reply_len` payload bytes back. At most one
    /// may be outstanding.
    pub fn send_command(
        &mut self,
        id: CommandId,
        payload: &[u8],
        reply_len: usize,
    ) -> DriverResult<()> {
        if self.state == MacState::Halted {
            return Err(DriverError::Halted);
        }
        let sent = self.cmd.send(&mut self.bus, &mut self.timer, id, payload, reply_len);
        self.run(sent)
    }
    /// Host clock minus firmware clock, for mapping [TxOutcome::fw_timestamp] into the
    /// host microsecond domain.
    pub fn fw_time_offset(&self) -> u32 {
        self.fw_time_offset
    }
    pub fn free_blocks(&self) -> u16 {
        self.hwq.free_blocks()
    }
    pub fn log_stats(&self) {
        self.hwq.log_stats();
        debug!(
            "Slots: {} of {} free.",
            self.pool.free_count(),
            self.pool.capacity()
        );
    }
}
