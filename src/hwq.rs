//! Per access-class block accounting and admission control.
//!
//! The firmware hands the host a fixed budget of Tx memory blocks. Every outbound packet
//! costs an estimated number of blocks, admission is decided against the free total minus
//! the reservations of the *other* classes, and classes below their configured
//! low-threshold keep a guaranteed minimum reserved. The firmware reports consumption
//! back through accumulating per-class freed-block counters in the status block, which
//! this module reconciles into `release` calls.

use macro_bits::serializable_enum;

use crate::regs::FwStatus;

/// Number of access classes the firmware schedules.
pub const NUM_CLASSES: usize = 4;

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    /// Access category of an outbound packet.
    pub enum AccessClass: u8 {
        #[default]
        BestEffort => 0,
        Background => 1,
        Video => 2,
        Voice => 3
    }
}
impl AccessClass {
    pub const ALL: [Self; NUM_CLASSES] = [
        Self::BestEffort,
        Self::Background,
        Self::Video,
        Self::Voice,
    ];
    pub fn index(&self) -> usize {
        self.into_bits() as usize
    }
    /// Position of this class in the backpressure bitmap.
    pub fn bit(&self) -> u8 {
        1 << self.into_bits()
    }
}

/// Block-count estimation constants.
///
/// The shift deliberately over-estimates (a 256-byte granule for slightly smaller real
/// blocks) to keep the hot path to a shift and an add. The admission thresholds are tuned
/// against exactly this approximation, so the constants are configuration, not derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPolicy {
    /// log2 of the estimation granule.
    pub shift: u8,
    /// Fixed per-packet overhead in bytes: descriptor header plus security expansion.
    pub overhead: u16,
    /// Extra blocks kept spare for fragmentation.
    pub spare: u8,
}
impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            shift: 8,
            overhead: 32,
            spare: 1,
        }
    }
}

/// Outcome of an admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Admission {
    /// The blocks were committed.
    Granted,
    /// No room; hold the packet and stop submitting for this class until it is resumed
    /// through the backpressure bitmap.
    StopCurrent,
    /// The blocks were committed, but another packet of this size would not fit; stop
    /// after this one.
    StopNext,
}

#[derive(Clone, Copy, Debug, Default)]
struct ClassBudget {
    low_threshold: u16,
    used: u16,
    /// Always `max(0, low_threshold - used)`.
    reserved: u16,
    /// Wrapping accumulation of every block granted to this class.
    allocated: u32,
    /// Last freed-block counter read from the firmware.
    fw_freed: u32,
    /// Size of the request that marked the class busy.
    busy_request: u16,
    busy: bool,
}

/// Block and descriptor budgets for all access classes.
pub(crate) struct HwQueues {
    classes: [ClassBudget; NUM_CLASSES],
    block: BlockPolicy,
    total_blocks: u16,
    free_blocks: u16,
    reserved_total: u16,
    /// Descriptors admitted but not yet consumed by the firmware.
    outstanding_descrs: u8,
    /// Last descriptor counter read from the firmware, byte-width wraparound.
    fw_descr_count: u8,
    fw_descr_limit: u8,
}
impl HwQueues {
    pub fn new(block: BlockPolicy, fw_descr_limit: u8) -> Self {
        Self {
            classes: [ClassBudget::default(); NUM_CLASSES],
            block,
            total_blocks: 0,
            free_blocks: 0,
            reserved_total: 0,
            outstanding_descrs: 0,
            fw_descr_count: 0,
            fw_descr_limit,
        }
    }
    /// Set the per-class low thresholds and rebuild the reservations.
    ///
    /// The thresholds must sum to no more than the total block count.
    pub fn configure(&mut self, thresholds: [u16; NUM_CLASSES]) {
        self.reserved_total = 0;
        for (class, low) in self.classes.iter_mut().zip(thresholds) {
            class.low_threshold = low;
            class.reserved = low.saturating_sub(class.used);
            self.reserved_total += class.reserved;
        }
        debug!("Thresholds configured, {} blocks reserved.", self.reserved_total);
    }
    /// Update the total block count negotiated with the firmware.
    pub fn set_total_blocks(&mut self, total: u16) {
        self.total_blocks = total;
        let used: u16 = self.classes.iter().map(|class| class.used).sum();
        self.free_blocks = total.saturating_sub(used);
        debug!("Firmware grants {} Tx blocks.", total);
    }
    /// Blocks needed for a payload of `len` bytes. Never zero.
    pub fn estimate_blocks(&self, len: usize) -> u16 {
        let blocks =
            ((len + self.block.overhead as usize) >> self.block.shift) + self.block.spare as usize;
        blocks.max(1) as u16
    }
    /// Free blocks this class may draw on: the free total minus what is reserved for
    /// everyone else.
    fn available(&self, class: AccessClass) -> u16 {
        let foreign_reserved = self.reserved_total - self.classes[class.index()].reserved;
        self.free_blocks.saturating_sub(foreign_reserved)
    }
    /// Try to commit `blocks` for one packet of `class`.
    pub fn try_reserve(&mut self, class: AccessClass, blocks: u16) -> Admission {
        let idx = class.index();
        if self.outstanding_descrs >= self.fw_descr_limit {
            trace!("No descriptor room for class {}.", idx);
            self.classes[idx].busy = true;
            self.classes[idx].busy_request = blocks;
            return Admission::StopCurrent;
        }
        if blocks > self.available(class) {
            trace!(
                "Class {} needs {} blocks, {} available.",
                idx,
                blocks,
                self.available(class)
            );
            self.classes[idx].busy = true;
            self.classes[idx].busy_request = blocks;
            return Admission::StopCurrent;
        }
        self.free_blocks -= blocks;
        let budget = &mut self.classes[idx];
        budget.used += blocks;
        budget.allocated = budget.allocated.wrapping_add(blocks as u32);
        // Only the part of the allocation below the low threshold consumes reservation,
        // keeping reserved == max(0, low_threshold - used).
        let from_reserve = blocks.min(budget.reserved);
        budget.reserved -= from_reserve;
        self.reserved_total -= from_reserve;
        self.outstanding_descrs += 1;
        if self.available(class) < blocks {
            self.classes[idx].busy = true;
            self.classes[idx].busy_request = blocks;
            Admission::StopNext
        } else {
            Admission::Granted
        }
    }
    /// Return `freed` blocks from `class` to the free total.
    pub fn release(&mut self, class: AccessClass, freed: u16) {
        let budget = &mut self.classes[class.index()];
        let freed = if freed > budget.used {
            error!(
                "Class {} frees {} blocks but only uses {}.",
                class.index(),
                freed,
                budget.used
            );
            budget.used
        } else {
            freed
        };
        budget.used -= freed;
        self.free_blocks += freed;
        // Freed blocks below the threshold go back into the reservation.
        let new_reserved = budget.low_threshold.saturating_sub(budget.used);
        self.reserved_total += new_reserved - budget.reserved;
        budget.reserved = new_reserved;
    }
    /// Fold one class's accumulated freed-block counter into the budgets.
    pub fn reconcile_from_firmware(&mut self, class: AccessClass, fw_freed_counter: u32) {
        let budget = &self.classes[class.index()];
        if fw_freed_counter == budget.fw_freed {
            return;
        }
        let newly_used = budget.allocated.wrapping_sub(fw_freed_counter);
        debug_assert!(newly_used < u32::MAX / 2);
        if newly_used > budget.used as u32 {
            error!(
                "Freed-block counter for class {} is inconsistent: {} in use, firmware claims {}.",
                class.index(),
                budget.used,
                newly_used
            );
            return;
        }
        let freed_now = budget.used - newly_used as u16;
        self.classes[class.index()].fw_freed = fw_freed_counter;
        trace!("Firmware freed {} blocks for class {}.", freed_now, class.index());
        self.release(class, freed_now);
    }
    /// Retire outstanding descriptors against the firmware's consumed counter.
    fn retire_descriptors(&mut self, fw_descr_counter: u8) {
        let delta = fw_descr_counter.wrapping_sub(self.fw_descr_count);
        if delta == 0 {
            return;
        }
        debug_assert!(delta < 128);
        if delta > self.outstanding_descrs {
            error!(
                "Firmware consumed {} descriptors, only {} outstanding.",
                delta, self.outstanding_descrs
            );
            self.outstanding_descrs = 0;
        } else {
            self.outstanding_descrs -= delta;
        }
        self.fw_descr_count = fw_descr_counter;
    }
    /// Clear the busy mark if the size that caused it now fits.
    pub fn recheck_busy(&mut self, class: AccessClass) -> bool {
        let idx = class.index();
        if !self.classes[idx].busy {
            return false;
        }
        if self.outstanding_descrs >= self.fw_descr_limit {
            return false;
        }
        if self.classes[idx].busy_request <= self.available(class) {
            self.classes[idx].busy = false;
            trace!("Class {} may resume.", idx);
            true
        } else {
            false
        }
    }
    /// One status read's worth of firmware feedback.
    ///
    /// Returns the backpressure bitmap of classes that became available again. Rechecks
    /// run after every class reconciled, since blocks freed by one class can unblock
    /// another through the shared free total.
    pub fn reconcile_all(&mut self, status: &FwStatus) -> u8 {
        self.retire_descriptors(status.tx_descr_counter);
        for class in AccessClass::ALL {
            self.reconcile_from_firmware(class, status.freed_blocks[class.index()]);
        }
        let mut resumed = 0u8;
        for class in AccessClass::ALL {
            if self.recheck_busy(class) {
                resumed |= class.bit();
            }
        }
        resumed
    }
    /// Reset every counter to the post-init baseline.
    pub fn restart(&mut self) {
        self.reserved_total = 0;
        for class in self.classes.iter_mut() {
            class.used = 0;
            class.reserved = class.low_threshold;
            class.allocated = 0;
            class.fw_freed = 0;
            class.busy = false;
            class.busy_request = 0;
            self.reserved_total += class.reserved;
        }
        self.free_blocks = self.total_blocks;
        self.outstanding_descrs = 0;
        self.fw_descr_count = 0;
        debug!("Block budgets restarted.");
    }
    pub fn free_blocks(&self) -> u16 {
        self.free_blocks
    }
    pub fn log_stats(&self) {
        debug!(
            "Blocks: {} free of {}, {} reserved, {} descriptors outstanding.",
            self.free_blocks, self.total_blocks, self.reserved_total, self.outstanding_descrs
        );
        for class in AccessClass::ALL {
            let budget = &self.classes[class.index()];
            trace!(
                "Class {}: used {} reserved {} low {} busy {}.",
                class.index(),
                budget.used,
                budget.reserved,
                budget.low_threshold,
                budget.busy
            );
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let used: u16 = self.classes.iter().map(|class| class.used).sum();
        assert_eq!(self.free_blocks + used, self.total_blocks, "conservation");
        let reserved: u16 = self.classes.iter().map(|class| class.reserved).sum();
        assert_eq!(reserved, self.reserved_total);
        for budget in &self.classes {
            assert!(budget.reserved <= budget.low_threshold);
            assert_eq!(
                budget.reserved,
                budget.low_threshold.saturating_sub(budget.used)
            );
        }
    }
    #[cfg(test)]
    fn seed_class_counters(&mut self, class: AccessClass, allocated: u32, fw_freed: u32) {
        self.classes[class.index()].allocated = allocated;
        self.classes[class.index()].fw_freed = fw_freed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(total: u16, thresholds: [u16; NUM_CLASSES]) -> HwQueues {
        let mut hwq = HwQueues::new(BlockPolicy::default(), 64);
        hwq.set_total_blocks(total);
        hwq.configure(thresholds);
        hwq.check_invariants();
        hwq
    }

    fn status_with_freed(freed: [u32; NUM_CLASSES], descr: u8) -> FwStatus {
        FwStatus {
            freed_blocks: freed,
            tx_descr_counter: descr,
            ..FwStatus::default()
        }
    }

    #[test]
    fn block_estimates_are_never_zero_and_round_up() {
        let hwq = queues(100, [0; NUM_CLASSES]);
        assert_eq!(hwq.estimate_blocks(0), 1);
        assert_eq!(hwq.estimate_blocks(100), 1);
        // (1500 + 32) >> 8 = 5, plus one spare.
        assert_eq!(hwq.estimate_blocks(1500), 6);
        assert!(hwq.estimate_blocks(1600) >= hwq.estimate_blocks(1500));
    }

    #[test]
    fn reservation_worked_example() {
        let mut hwq = queues(100, [20, 0, 0, 0]);
        assert_eq!(hwq.reserved_total, 20);

        assert_eq!(hwq.try_reserve(AccessClass::BestEffort, 15), Admission::Granted);
        assert_eq!(hwq.classes[0].used, 15);
        assert_eq!(hwq.classes[0].reserved, 5);
        assert_eq!(hwq.reserved_total, 5);
        assert_eq!(hwq.free_blocks, 85);
        hwq.check_invariants();

        assert_eq!(hwq.try_reserve(AccessClass::BestEffort, 10), Admission::Granted);
        assert_eq!(hwq.classes[0].used, 25);
        assert_eq!(hwq.classes[0].reserved, 0);
        assert_eq!(hwq.reserved_total, 0);
        assert_eq!(hwq.free_blocks, 75);
        hwq.check_invariants();

        // Firmware reports all 25 blocks freed via the accumulating counter.
        hwq.reconcile_from_firmware(AccessClass::BestEffort, 25);
        assert_eq!(hwq.classes[0].used, 0);
        assert_eq!(hwq.classes[0].reserved, 20);
        assert_eq!(hwq.reserved_total, 20);
        assert_eq!(hwq.free_blocks, 100);
        hwq.check_invariants();
    }

    #[test]
    fn foreign_reservations_are_untouchable() {
        let mut hwq = queues(100, [20, 30, 0, 0]);
        // 100 free minus 30 reserved for Background.
        assert_eq!(hwq.available(AccessClass::BestEffort), 70);
        assert_eq!(hwq.try_reserve(AccessClass::BestEffort, 71), Admission::StopCurrent);
        assert!(hwq.classes[0].busy);
        hwq.check_invariants();
        // The guaranteed minimum is still there for its owner.
        assert_eq!(hwq.try_reserve(AccessClass::Background, 30), Admission::Granted);
        hwq.check_invariants();
    }

    #[test]
    fn stop_next_when_one_more_packet_would_not_fit() {
        let mut hwq = queues(20, [0; NUM_CLASSES]);
        assert_eq!(hwq.try_reserve(AccessClass::Video, 15), Admission::StopNext);
        assert!(hwq.classes[AccessClass::Video.index()].busy);
        assert_eq!(hwq.free_blocks, 5);
        hwq.check_invariants();
    }

    #[test]
    fn descriptor_capacity_gates_admission() {
        let mut hwq = HwQueues::new(BlockPolicy::default(), 2);
        hwq.set_total_blocks(100);
        hwq.configure([0; NUM_CLASSES]);
        assert_eq!(hwq.try_reserve(AccessClass::Voice, 1), Admission::Granted);
        assert_eq!(hwq.try_reserve(AccessClass::Voice, 1), Admission::Granted);
        // Plenty of blocks left, but no descriptor room.
        assert_eq!(hwq.try_reserve(AccessClass::Voice, 1), Admission::StopCurrent);

        // Firmware consumes both descriptors and frees the two blocks.
        let resumed = hwq.reconcile_all(&status_with_freed([0, 0, 0, 2], 2));
        assert_eq!(hwq.outstanding_descrs, 0);
        assert_eq!(resumed, AccessClass::Voice.bit());
        assert_eq!(hwq.try_reserve(AccessClass::Voice, 1), Admission::Granted);
        hwq.check_invariants();
    }

    #[test]
    fn backpressure_bitmap_reports_resumed_classes() {
        let mut hwq = queues(10, [0; NUM_CLASSES]);
        assert_eq!(hwq.try_reserve(AccessClass::BestEffort, 8), Admission::StopNext);
        assert_eq!(hwq.try_reserve(AccessClass::Video, 8), Admission::StopCurrent);

        // Nothing freed: no resumes.
        assert_eq!(hwq.reconcile_all(&status_with_freed([0; 4], 0)), 0);

        let resumed = hwq.reconcile_all(&status_with_freed([8, 0, 0, 0], 1));
        assert_eq!(
            resumed,
            AccessClass::BestEffort.bit() | AccessClass::Video.bit()
        );
        hwq.check_invariants();
    }

    #[test]
    fn counter_wraparound_matches_unbounded_arithmetic() {
        let mut hwq = queues(50, [0; NUM_CLASSES]);
        // Pretend a long uptime: both accumulating counters sit just below the wrap.
        hwq.seed_class_counters(AccessClass::Background, u32::MAX - 5, u32::MAX - 5);

        assert_eq!(hwq.try_reserve(AccessClass::Background, 10), Admission::Granted);
        assert_eq!(hwq.classes[1].allocated, 4); // wrapped
        assert_eq!(hwq.try_reserve(AccessClass::Background, 10), Admission::Granted);
        assert_eq!(hwq.free_blocks, 30);

        // Firmware frees the first 10: its counter also wraps past zero.
        hwq.reconcile_from_firmware(AccessClass::Background, (u32::MAX - 5).wrapping_add(10));
        assert_eq!(hwq.classes[1].used, 10);
        assert_eq!(hwq.free_blocks, 40);
        hwq.check_invariants();

        // And the remaining 10.
        hwq.reconcile_from_firmware(AccessClass::Background, (u32::MAX - 5).wrapping_add(20));
        assert_eq!(hwq.classes[1].used, 0);
        assert_eq!(hwq.free_blocks, 50);
        hwq.check_invariants();
    }

    #[test]
    fn inconsistent_firmware_counter_is_ignored() {
        let mut hwq = queues(50, [0; NUM_CLASSES]);
        assert_eq!(hwq.try_reserve(AccessClass::Voice, 5), Admission::Granted);
        // A counter claiming more in use than we ever granted must not corrupt state.
        hwq.reconcile_from_firmware(AccessClass::Voice, 0xdead_beef);
        assert_eq!(hwq.classes[3].used, 5);
        assert_eq!(hwq.free_blocks, 45);
        hwq.check_invariants();
    }

    #[test]
    fn over_release_is_clamped() {
        let mut hwq = queues(30, [0; NUM_CLASSES]);
        assert_eq!(hwq.try_reserve(AccessClass::BestEffort, 4), Admission::Granted);
        hwq.release(AccessClass::BestEffort, 9);
        assert_eq!(hwq.free_blocks, 30);
        hwq.check_invariants();
    }

    #[test]
    fn conservation_over_mixed_sequences() {
        let mut hwq = queues(200, [30, 10, 0, 25]);
        let mut state = 0x2f6e_1a35u32;
        let mut rand = || {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            state >> 16
        };
        for _ in 0..500 {
            let class = AccessClass::ALL[(rand() % 4) as usize];
            match rand() % 3 {
                0 => {
                    let _ = hwq.try_reserve(class, (rand() % 16 + 1) as u16);
                }
                1 => {
                    let used = hwq.classes[class.index()].used;
                    if used > 0 {
                        hwq.release(class, (rand() as u16) % used + 1);
                    }
                }
                _ => {
                    let _ = hwq.recheck_busy(class);
                }
            }
            hwq.check_invariants();
        }
    }

    #[test]
    fn set_total_blocks_recomputes_free() {
        let mut hwq = queues(100, [0; NUM_CLASSES]);
        assert_eq!(hwq.try_reserve(AccessClass::Video, 40), Admission::Granted);
        hwq.set_total_blocks(120);
        assert_eq!(hwq.free_blocks, 80);
        hwq.check_invariants();
    }

    #[test]
    fn restart_returns_to_pristine_budgets() {
        let mut hwq = queues(100, [20, 0, 0, 10]);
        let _ = hwq.try_reserve(AccessClass::BestEffort, 30);
        let _ = hwq.try_reserve(AccessClass::Voice, 50);
        hwq.restart();
        assert_eq!(hwq.free_blocks, 100);
        assert_eq!(hwq.reserved_total, 30);
        assert_eq!(hwq.outstanding_descrs, 0);
        hwq.check_invariants();
    }
}
