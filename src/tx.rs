//! Tx data path: descriptor build, aggregation and shipment.
//!
//! Admitted packets are copied into a per-slot staging buffer behind an 8-byte packed
//! descriptor and collected into a batch. A batch is shipped as one chain of bus writes
//! to the fixed data-path address, all but the last flagged more-to-come, followed by a
//! small write of the shipped-descriptor counter that makes the firmware look. Completion
//! is reported once per member, either synchronously through the caller's return value or
//! through the batch completion tag, never both.

use bitfield_struct::bitfield;
use macro_bits::bit;

use crate::{
    bus::{AddrMode, Bus, Progress, Transfer, XferTag},
    hwq::AccessClass,
    mac::{DriverError, DriverResult, MacClient},
    regs::{pad_len, DATA_PATH, HOST_DESC_COUNT},
    slots::{SlotId, MAX_SLOTS},
};

/// Largest payload a slot can carry.
pub const MAX_FRAME: usize = 1600;
/// On-wire descriptor prepended to every frame.
pub const TX_DESCR_LEN: usize = 8;

const FRAME_BUF: usize = TX_DESCR_LEN + MAX_FRAME;
const AGG_CAP: usize = 16;

/// The frame is encrypted by the firmware on the way out.
pub const TX_FLAG_PROTECTED: u8 = bit!(0);
/// Do not wait for an acknowledgement.
pub const TX_FLAG_NO_ACK: u8 = bit!(1);

const DEFAULT_LIFETIME_MS: u16 = 2000;

#[bitfield(u32)]
pub struct TxDescrWord0 {
    #[bits(12)]
    pub length: u16,
    #[bits(8)]
    pub slot: u8,
    #[bits(2)]
    pub class: u8,
    #[bits(5)]
    pub extra_blocks: u8,
    #[bits(4)]
    pub flags: u8,
    #[bits(1)]
    __: bool,
}

/// Aggregation limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggPolicy {
    /// Frames per batch; 1 disables aggregation. Capped at 16.
    pub max_frames: u8,
    /// Byte budget per batch, descriptors and padding included.
    pub max_bytes: u16,
}
impl Default for AggPolicy {
    fn default() -> Self {
        Self {
            max_frames: 8,
            max_bytes: 8192,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct SlotMeta {
    len: u16,
    /// Padded descriptor-plus-payload length actually written out.
    wire_len: u16,
    blocks: u16,
    class: AccessClass,
    flags: u8,
    /// Bound data-path address for this slot's writes.
    data_addr: u32,
}

#[derive(Clone, Copy)]
struct Batch {
    slots: [SlotId; AGG_CAP],
    count: u8,
    bytes: u32,
}
impl Batch {
    const EMPTY: Self = Self {
        slots: [SlotId::from_raw(0); AGG_CAP],
        count: 0,
        bytes: 0,
    };
}

pub(crate) struct TxPath {
    meta: [SlotMeta; MAX_SLOTS],
    frames: [[u8; FRAME_BUF]; MAX_SLOTS],
    agg: AggPolicy,
    open: Batch,
    /// Shipped but not yet reported slots, in ship order.
    inflight_slots: [SlotId; MAX_SLOTS],
    if_head: u8,
    if_len: u8,
    /// Per flushed batch: sequence number and member count, in ship order.
    inflight_batches: [(u8, u8); MAX_SLOTS],
    ib_head: u8,
    ib_len: u8,
    /// Wrapping count of descriptors shipped, mirrored to the firmware.
    shipped_count: u8,
    next_seq: u8,
}
impl TxPath {
    pub fn new(mut agg: AggPolicy) -> Self {
        if agg.max_frames as usize > AGG_CAP {
            debug!("Aggregation count capped at {}.", AGG_CAP);
            agg.max_frames = AGG_CAP as u8;
        }
        let mut meta = [SlotMeta::default(); MAX_SLOTS];
        for slot_meta in meta.iter_mut() {
            slot_meta.data_addr = DATA_PATH;
        }
        Self {
            meta,
            frames: [[0u8; FRAME_BUF]; MAX_SLOTS],
            agg,
            open: Batch::EMPTY,
            inflight_slots: [SlotId::from_raw(0); MAX_SLOTS],
            if_head: 0,
            if_len: 0,
            inflight_batches: [(0, 0); MAX_SLOTS],
            ib_head: 0,
            ib_len: 0,
            shipped_count: 0,
            next_seq: 0,
        }
    }
    /// Stage one admitted packet and run the aggregation rules.
    ///
    /// `Complete` means the packet is already on the wire and no callback will follow for
    /// it. `Pending` means it was queued or shipped asynchronously and
    /// [MacClient::tx_sent] will report it exactly once.
    pub fn send<B: Bus, C: MacClient>(
        &mut self,
        bus: &mut B,
        client: &mut C,
        slot: SlotId,
        class: AccessClass,
        blocks: u16,
        flags: u8,
        frame: &[u8],
    ) -> DriverResult<Progress> {
        if frame.len() > MAX_FRAME {
            return Err(DriverError::FrameTooLong);
        }
        let wire_len = self.stage(slot, class, blocks, flags, frame);

        if self.agg.max_frames <= 1 {
            self.append(slot, wire_len);
            return self.flush_covered(bus, client, Some(slot));
        }
        if self.open.count > 0 && !self.fits(wire_len) {
            self.flush_covered(bus, client, None)?;
        }
        self.append(slot, wire_len);
        Ok(Progress::Pending)
    }
    /// Ship whatever batch is open; the upstream source has nothing more right now.
    pub fn end_of_burst<B: Bus, C: MacClient>(
        &mut self,
        bus: &mut B,
        client: &mut C,
    ) -> DriverResult<Progress> {
        self.flush_covered(bus, client, None)
    }
    /// Copy descriptor and payload into the slot's staging buffer.
    fn stage(
        &mut self,
        slot: SlotId,
        class: AccessClass,
        blocks: u16,
        flags: u8,
        frame: &[u8],
    ) -> u16 {
        let idx = slot.index();
        let word0 = TxDescrWord0::new()
            .with_length(frame.len() as u16)
            .with_slot(slot.raw())
            .with_class(class.into_bits())
            .with_extra_blocks((blocks.saturating_sub(1)).min(31) as u8)
            .with_flags(flags & 0xf);
        let buf = &mut self.frames[idx];
        buf[0..4].copy_from_slice(&word0.into_bits().to_le_bytes());
        buf[4] = blocks.min(255) as u8;
        buf[5] = 0; // rate policy id
        buf[6..8].copy_from_slice(&DEFAULT_LIFETIME_MS.to_le_bytes());
        buf[TX_DESCR_LEN..TX_DESCR_LEN + frame.len()].copy_from_slice(frame);

        let wire_len = pad_len(TX_DESCR_LEN + frame.len());
        for byte in buf[TX_DESCR_LEN + frame.len()..wire_len].iter_mut() {
            *byte = 0;
        }
        self.meta[idx] = SlotMeta {
            len: frame.len() as u16,
            wire_len: wire_len as u16,
            blocks,
            class,
            flags,
            data_addr: self.meta[idx].data_addr,
        };
        wire_len as u16
    }
    fn fits(&self, wire_len: u16) -> bool {
        (self.open.count as usize) < self.agg.max_frames as usize
            && self.open.bytes + wire_len as u32 <= self.agg.max_bytes as u32
    }
    fn append(&mut self, slot: SlotId, wire_len: u16) {
        let at = self.open.count as usize;
        debug_assert!(at < AGG_CAP);
        self.open.slots[at] = slot;
        self.open.count += 1;
        self.open.bytes += wire_len as u32;
    }
    /// Ship the open batch as one chained transaction plus the counter write.
    ///
    /// `covered` names the member whose completion the caller's own return value reports,
    /// so the synchronous path does not notify it a second time.
    fn flush_covered<B: Bus, C: MacClient>(
        &mut self,
        bus: &mut B,
        client: &mut C,
        covered: Option<SlotId>,
    ) -> DriverResult<Progress> {
        let count = self.open.count as usize;
        if count == 0 {
            return Ok(Progress::Complete);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let mut last_progress = Progress::Complete;
        for member in 0..count {
            let slot = self.open.slots[member];
            let meta = &self.meta[slot.index()];
            let not_last = member + 1 < count;
            let mut xfer = Transfer::write(
                meta.data_addr,
                AddrMode::Fixed,
                &self.frames[slot.index()][..meta.wire_len as usize],
            )
            .more(not_last);
            if !not_last {
                xfer = xfer.done(XferTag::TxBatch(seq));
            }
            last_progress = bus.issue(xfer)?;
        }
        self.shipped_count = self.shipped_count.wrapping_add(count as u8);
        bus.issue(Transfer::write(
            HOST_DESC_COUNT,
            AddrMode::Increment,
            &(self.shipped_count as u32).to_le_bytes(),
        ))?;
        trace!("Batch {}: {} frames, {} bytes shipped.", seq, count, self.open.bytes);

        match last_progress {
            Progress::Complete => {
                for member in 0..count {
                    let slot = self.open.slots[member];
                    if covered != Some(slot) {
                        client.tx_sent(slot);
                    }
                }
                self.open = Batch::EMPTY;
                Ok(Progress::Complete)
            }
            Progress::Pending => {
                self.push_inflight(seq);
                self.open = Batch::EMPTY;
                Ok(Progress::Pending)
            }
        }
    }
    fn push_inflight(&mut self, seq: u8) {
        let count = self.open.count;
        if self.ib_len as usize >= MAX_SLOTS || self.if_len as usize + count as usize > MAX_SLOTS {
            // Cannot happen while every slot is in at most one batch.
            error!("In-flight batch bookkeeping overflow.");
            return;
        }
        let batch_at = (self.ib_head as usize + self.ib_len as usize) % MAX_SLOTS;
        self.inflight_batches[batch_at] = (seq, count);
        self.ib_len += 1;
        for member in 0..count as usize {
            let slot_at = (self.if_head as usize + self.if_len as usize) % MAX_SLOTS;
            self.inflight_slots[slot_at] = self.open.slots[member];
            self.if_len += 1;
        }
    }
    /// Fan out the completion of the batch carrying `seq`.
    ///
    /// Members are reported in append order, each exactly once.
    pub fn batch_done<C: MacClient>(&mut self, client: &mut C, seq: u8) {
        if self.ib_len == 0 {
            error!("Batch completion with nothing in flight.");
            return;
        }
        let (expected_seq, count) = self.inflight_batches[self.ib_head as usize];
        self.ib_head = ((self.ib_head as usize + 1) % MAX_SLOTS) as u8;
        self.ib_len -= 1;
        if expected_seq != seq {
            error!("Batch completion out of order: got {}, expected {}.", seq, expected_seq);
        }
        for _ in 0..count {
            if self.if_len == 0 {
                error!("Batch member bookkeeping ran dry.");
                return;
            }
            let slot = self.inflight_slots[self.if_head as usize];
            self.if_head = ((self.if_head as usize + 1) % MAX_SLOTS) as u8;
            self.if_len -= 1;
            client.tx_sent(slot);
        }
    }
    /// Drop the completion records of the batch carrying `seq` without notifying.
    ///
    /// Used when the shipment itself failed; the coordinator raises the fault.
    pub fn batch_failed(&mut self, seq: u8) {
        if self.ib_len == 0 {
            return;
        }
        let (expected_seq, count) = self.inflight_batches[self.ib_head as usize];
        self.ib_head = ((self.ib_head as usize + 1) % MAX_SLOTS) as u8;
        self.ib_len -= 1;
        if expected_seq != seq {
            error!("Failed batch out of order: got {}, expected {}.", seq, expected_seq);
        }
        let drop = (count as usize).min(self.if_len as usize);
        self.if_head = ((self.if_head as usize + drop) % MAX_SLOTS) as u8;
        self.if_len -= drop as u8;
    }
    /// Forget all staged and in-flight state.
    pub fn restart(&mut self) {
        self.open = Batch::EMPTY;
        self.if_head = 0;
        self.if_len = 0;
        self.ib_head = 0;
        self.ib_len = 0;
        self.shipped_count = 0;
        self.next_seq = 0;
    }
    pub fn open_count(&self) -> usize {
        self.open.count as usize
    }
    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.if_len as usize
    }
}
