//! Tx result collection.
//!
//! The firmware posts one entry per finished frame into a small cyclic table and bumps a
//! free-running counter in its header. The host keeps its own mirror of that counter,
//! reads the table when the status block says it moved, walks the fresh window and
//! writes its mirror back so the firmware knows which entries it may reuse. Slot ids in
//! the entries come from the firmware and are validated against the pool before anything
//! is freed or reported.

use macro_bits::serializable_enum;

use crate::{
    bus::{AddrMode, Bus, Progress, Transfer, XferTag},
    mac::{DriverResult, MacClient},
    regs::{le32, TX_RESULT_IF},
    slots::{SlotId, SlotPool},
};

/// Entries in the cyclic result table. Must be a power of two.
pub const RESULT_RING_DEPTH: usize = 16;

const RESULT_HEADER_LEN: usize = 8;
const RESULT_ENTRY_LEN: usize = 8;
const RESULT_TABLE_LEN: usize = RESULT_HEADER_LEN + RESULT_RING_DEPTH * RESULT_ENTRY_LEN;
/// Offset of the host mirror counter inside the table header.
const HOST_COUNTER_OFFSET: u32 = 4;

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    /// Final verdict the firmware reached for one frame.
    pub enum TxStatus: u8 {
        #[default]
        Acked => 0,
        NoAck => 1,
        Expired => 2,
        Dropped => 3,
        Error => 4
    }
}
impl TxStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => TxStatus::Acked,
            1 => TxStatus::NoAck,
            2 => TxStatus::Expired,
            3 => TxStatus::Dropped,
            _ => TxStatus::Error,
        }
    }
}

/// Everything the firmware reported about one finished frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxOutcome {
    pub slot: SlotId,
    pub status: TxStatus,
    /// Transmissions that went unacknowledged.
    pub ack_failures: u8,
    /// Retransmissions the firmware performed.
    pub retries: u8,
    /// Firmware-local microsecond timestamp of the final attempt.
    pub fw_timestamp: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    Idle,
    Reading,
}

pub(crate) struct TxResults {
    buf: [u8; RESULT_TABLE_LEN],
    /// Host mirror of the firmware's free-running result counter.
    host_counter: u32,
    /// Status-block counter value that triggered the last table read.
    seen_counter: u8,
    state: ReadState,
}
impl TxResults {
    pub const fn new() -> Self {
        Self {
            buf: [0u8; RESULT_TABLE_LEN],
            host_counter: 0,
            seen_counter: 0,
            state: ReadState::Idle,
        }
    }
    /// Kick off a table read if the status block shows fresh results.
    ///
    /// Returns `Pending` while a read is on the wire, `Complete` when there was nothing
    /// to do or the results were handled synchronously.
    pub fn poll<B: Bus, C: MacClient>(
        &mut self,
        bus: &mut B,
        pool: &SlotPool,
        client: &mut C,
        result_counter: u8,
    ) -> DriverResult<Progress> {
        if self.state == ReadState::Reading {
            return Ok(Progress::Pending);
        }
        if result_counter == self.seen_counter {
            return Ok(Progress::Complete);
        }
        self.seen_counter = result_counter;
        let progress = bus.issue(
            Transfer::read(TX_RESULT_IF, AddrMode::Increment, &mut self.buf)
                .done(XferTag::TxResult),
        )?;
        match progress {
            Progress::Complete => {
                let table = self.buf;
                self.process(bus, pool, client, &table)?;
                Ok(Progress::Complete)
            }
            Progress::Pending => {
                self.state = ReadState::Reading;
                Ok(Progress::Pending)
            }
        }
    }
    /// Feed back a table read that completed asynchronously.
    pub fn read_done<B: Bus, C: MacClient>(
        &mut self,
        bus: &mut B,
        pool: &SlotPool,
        client: &mut C,
        table: &[u8],
    ) -> DriverResult<()> {
        if self.state != ReadState::Reading {
            error!("Result table delivered without a read in flight.");
            return Ok(());
        }
        self.state = ReadState::Idle;
        if table.len() < RESULT_TABLE_LEN {
            error!("Short result table read: {} bytes.", table.len());
            return Ok(());
        }
        self.process(bus, pool, client, table)
    }
    /// The in-flight table read died on the bus; the coordinator handles the fault.
    pub fn read_failed(&mut self) {
        self.state = ReadState::Idle;
    }
    fn process<B: Bus, C: MacClient>(
        &mut self,
        bus: &mut B,
        pool: &SlotPool,
        client: &mut C,
        table: &[u8],
    ) -> DriverResult<()> {
        let fw_counter = le32(table, 0);
        let mut delta = fw_counter.wrapping_sub(self.host_counter);
        if delta == 0 {
            return Ok(());
        }
        if delta as usize > RESULT_RING_DEPTH {
            error!(
                "Result ring overran, {} results but only {} entries.",
                delta, RESULT_RING_DEPTH
            );
            delta = RESULT_RING_DEPTH as u32;
            self.host_counter = fw_counter.wrapping_sub(delta);
        }
        // Hand the consumed entries back to the firmware before the completion
        // callbacks run; a callback may stop the driver.
        bus.issue(Transfer::write(
            TX_RESULT_IF + HOST_COUNTER_OFFSET,
            AddrMode::Increment,
            &fw_counter.to_le_bytes(),
        ))?;
        while self.host_counter != fw_counter {
            let entry = RESULT_HEADER_LEN
                + (self.host_counter as usize % RESULT_RING_DEPTH) * RESULT_ENTRY_LEN;
            self.host_counter = self.host_counter.wrapping_add(1);

            let fw_timestamp = le32(table, entry);
            let id = table[entry + 4];
            let Some(slot) = pool.lookup(id) else {
                continue;
            };
            let outcome = TxOutcome {
                slot,
                status: TxStatus::from_raw(table[entry + 5]),
                ack_failures: table[entry + 6],
                retries: table[entry + 7],
                fw_timestamp,
            };
            pool.free(slot);
            trace!("Tx result for slot {}, status {}.", id, table[entry + 5]);
            client.tx_complete(outcome);
        }
        Ok(())
    }
    /// Forget all counters after a firmware restart.
    pub fn restart(&mut self) {
        self.host_counter = 0;
        self.seen_counter = 0;
        self.state = ReadState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, MockBus, TestClient};

    struct Entry {
        counter: u32,
        id: u8,
        status: TxStatus,
        ack_failures: u8,
        retries: u8,
        fw_timestamp: u32,
    }

    fn table(fw_counter: u32, entries: &[Entry]) -> Vec<u8> {
        let mut raw = vec![0u8; RESULT_TABLE_LEN];
        raw[0..4].copy_from_slice(&fw_counter.to_le_bytes());
        for entry in entries {
            let at = RESULT_HEADER_LEN + (entry.counter as usize % RESULT_RING_DEPTH) * RESULT_ENTRY_LEN;
            raw[at..at + 4].copy_from_slice(&entry.fw_timestamp.to_le_bytes());
            raw[at + 4] = entry.id;
            raw[at + 5] = entry.status.into_bits();
            raw[at + 6] = entry.ack_failures;
            raw[at + 7] = entry.retries;
        }
        raw
    }

    fn entry(counter: u32, id: u8, status: TxStatus) -> Entry {
        Entry {
            counter,
            id,
            status,
            ack_failures: 1,
            retries: 2,
            fw_timestamp: 0x1000u32.wrapping_add(counter),
        }
    }

    #[test]
    fn unchanged_counter_does_not_touch_the_bus() {
        let mut results = TxResults::new();
        let mut bus = MockBus::new();
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();
        assert_eq!(
            results.poll(&mut bus, &pool, &mut client, 0).unwrap(),
            Progress::Complete
        );
        assert!(bus.issued.is_empty());
    }

    #[test]
    fn fresh_results_free_slots_and_notify_in_order() {
        let mut results = TxResults::new();
        let mut bus = MockBus::new();
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();

        bus.script_read(
            TX_RESULT_IF,
            table(
                2,
                &[
                    entry(0, first.raw(), TxStatus::Acked),
                    entry(1, second.raw(), TxStatus::NoAck),
                ],
            ),
        );
        assert_eq!(
            results.poll(&mut bus, &pool, &mut client, 2).unwrap(),
            Progress::Complete
        );

        assert_eq!(client.events.len(), 2);
        match &client.events[0] {
            Event::TxComplete(outcome) => {
                assert_eq!(outcome.slot, first);
                assert_eq!(outcome.status, TxStatus::Acked);
                assert_eq!(outcome.ack_failures, 1);
                assert_eq!(outcome.retries, 2);
                assert_eq!(outcome.fw_timestamp, 0x1000);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &client.events[1] {
            Event::TxComplete(outcome) => {
                assert_eq!(outcome.slot, second);
                assert_eq!(outcome.status, TxStatus::NoAck);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Both slots returned to the pool.
        assert_eq!(pool.free_count(), 7);

        // The host mirror went back out on the wire.
        let write_back = bus.issued.last().unwrap();
        assert_eq!(write_back.addr, TX_RESULT_IF + 4);
        assert_eq!(write_back.bytes, 2u32.to_le_bytes().to_vec());
    }

    #[test]
    fn unknown_slot_ids_are_skipped() {
        let mut results = TxResults::new();
        let mut bus = MockBus::new();
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();
        let known = pool.allocate().unwrap();

        bus.script_read(
            TX_RESULT_IF,
            table(
                2,
                &[
                    entry(0, 30, TxStatus::Acked),
                    entry(1, known.raw(), TxStatus::Expired),
                ],
            ),
        );
        results.poll(&mut bus, &pool, &mut client, 2).unwrap();

        assert_eq!(client.events.len(), 1);
        assert!(matches!(
            client.events[0],
            Event::TxComplete(outcome) if outcome.slot == known && outcome.status == TxStatus::Expired
        ));
        // The mirror still covers the bad entry.
        let write_back = bus.issued.last().unwrap();
        assert_eq!(write_back.bytes, 2u32.to_le_bytes().to_vec());
    }

    #[test]
    fn overrun_clamps_to_the_ring_depth() {
        let mut results = TxResults::new();
        let mut bus = MockBus::new();
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();

        bus.script_read(TX_RESULT_IF, table(20, &[]));
        results.poll(&mut bus, &pool, &mut client, 20).unwrap();

        assert!(client.events.is_empty());
        let write_back = bus.issued.last().unwrap();
        assert_eq!(write_back.bytes, 20u32.to_le_bytes().to_vec());
    }

    #[test]
    fn pending_read_is_not_reissued() {
        let mut results = TxResults::new();
        let mut bus = MockBus::new();
        bus.make_pending(TX_RESULT_IF);
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();
        let slot = pool.allocate().unwrap();

        assert_eq!(
            results.poll(&mut bus, &pool, &mut client, 1).unwrap(),
            Progress::Pending
        );
        assert_eq!(
            results.poll(&mut bus, &pool, &mut client, 3).unwrap(),
            Progress::Pending
        );
        assert_eq!(bus.issued.len(), 1);

        let raw = table(1, &[entry(0, slot.raw(), TxStatus::Dropped)]);
        results.read_done(&mut bus, &pool, &mut client, &raw).unwrap();
        assert_eq!(client.events.len(), 1);
        assert_eq!(pool.free_count(), 7);
    }

    #[test]
    fn counters_reconcile_across_wraparound() {
        let mut results = TxResults::new();
        results.host_counter = u32::MAX - 1;
        results.seen_counter = 7;
        let mut bus = MockBus::new();
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();

        bus.script_read(
            TX_RESULT_IF,
            table(
                1,
                &[
                    entry(u32::MAX - 1, first.raw(), TxStatus::Acked),
                    entry(u32::MAX, second.raw(), TxStatus::Acked),
                ],
            ),
        );
        results.poll(&mut bus, &pool, &mut client, 9).unwrap();

        assert_eq!(client.events.len(), 2);
        assert_eq!(pool.free_count(), 7);
        let write_back = bus.issued.last().unwrap();
        assert_eq!(write_back.bytes, 1u32.to_le_bytes().to_vec());
    }

    #[test]
    fn stray_table_delivery_is_ignored() {
        let mut results = TxResults::new();
        let mut bus = MockBus::new();
        let pool = SlotPool::new(8);
        let mut client = TestClient::new();
        let raw = table(5, &[]);
        results.read_done(&mut bus, &pool, &mut client, &raw).unwrap();
        assert!(bus.issued.is_empty());
    }
}
