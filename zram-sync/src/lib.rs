//! Concurrency primitives shared by the store, writeback and dispatcher
//! engines.
//!
//! Generalized from this codebase's kernel-side `IrqMutex` (a ticket lock
//! that also disables interrupts/preemption): outside a kernel there is no
//! interrupt state to save, so `TicketLock`/`TicketRwLock` keep the ticket
//! fairness algorithm and drop the CPU-control-register parts. `bitlock`
//! keeps the embedded test-and-set bit the per-slot lock needs — a full
//! lock object per slot would double the size of the slot table.

pub mod bitlock;
pub mod rw_lock;
pub mod ticket_lock;

pub use rw_lock::{ReadGuard, TicketRwLock, WriteGuard};
pub use ticket_lock::{TicketLock, TicketLockGuard};
