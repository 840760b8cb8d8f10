//! # `fullmac-hal`
//! This is a host-side driver core for full-MAC Wi-Fi chips, that sit behind a shared
//! byte bus (SDIO or SPI class). The chip runs its own firmware, which owns the air
//! interface; we own the resource bookkeeping and the event plumbing on the host side.
//! ## Hardware overview
//! This chapter gives a short overview of how the host and the firmware cooperate.
//!
//! ### Transmit resources
//! The firmware has a pool of equally sized buffer blocks, which every outgoing frame is
//! stored in, and a limited table of frame slots. Before a frame may be sent, it has to
//! pass admission: [FullMac::estimate_blocks] converts its length into blocks, and
//! [FullMac::try_reserve] checks that against the free space, while keeping a low-water
//! reservation for every traffic class, so that bulk traffic can never starve voice.
//! The firmware tells us about consumed and freed blocks only through free-running
//! counters in its status block, which we reconcile with our own counters every cycle;
//! the counters wrap, the differences do not lie.
//!
//! Admitted frames take a slot from the [SlotPool], get a small descriptor prepended and
//! are collected into batches. A batch goes out as one chained bus transaction, followed
//! by a doorbell write that tells the firmware how many descriptors we have shipped so
//! far. When the firmware is done with a frame, it posts an entry into a small cyclic
//! result table, which we read and turn into [MacClient::tx_complete] calls, returning
//! the slot on the way.
//!
//! ### Event coordination
//! The chip has exactly one interrupt line for everything. The actual reason only shows
//! up in the interrupt vector at the start of the status block, and that vector clears
//! on read, so every interrupt costs one status read and one pass through the dispatch
//! order: watchdog first, then command completion, then the two event mailboxes, then
//! the shared data bit, which fans out into RX pick-up, block reconciliation and the
//! result table poll. Handlers may finish asynchronously; the cycle waits for all of
//! them before it looks at the interrupt signal again. An interrupt that fires while we
//! are busy is latched in [IrqSignal] and simply starts the next cycle.
//!
//! ### Commands
//! Control traffic runs through a mailbox with room for exactly one command. We write
//! the request, ring a doorbell register and arm a timer; the firmware answers with an
//! interrupt, the response is read back and handed to the client. If the timer fires
//! first, the command is reported failed and the mailbox reopens. Whether to retry is a
//! policy question and therefore not ours.
//!
//! ## Integration
//! The platform supplies the [Bus], the command [Timer] and the [MacClient] callbacks,
//! and owns the one worker context everything runs on. An interrupt handler only calls
//! [IrqSignal::raise]; the worker then calls [FullMac::poll]. Asynchronous bus
//! completions come back through [FullMac::transfer_done], finished handlers through
//! [FullMac::handler_done] and timer expiry through [FullMac::command_timeout].

#![cfg_attr(not(test), no_std)]
pub(crate) mod fmt;

mod bus;
mod cmd;
mod hwq;
mod mac;
#[cfg(test)]
mod mock;
mod regs;
mod slots;
mod sync;
mod tx;
mod txres;

pub use bus::{AddrMode, Bus, BusError, BusResult, Progress, Timer, Transfer, XferData, XferTag};
pub use cmd::{CommandId, CMD_MAX_PAYLOAD};
pub use hwq::{AccessClass, Admission, BlockPolicy, NUM_CLASSES};
pub use mac::*;
pub use slots::{SlotId, SlotPool, MAX_SLOTS};
pub use sync::IrqSignal;
pub use tx::{AggPolicy, TxDescrWord0, MAX_FRAME, TX_DESCR_LEN, TX_FLAG_NO_ACK, TX_FLAG_PROTECTED};
pub use txres::{TxOutcome, TxStatus, RESULT_RING_DEPTH};
