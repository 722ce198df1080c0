//! Kernel locks. Every lock in the VM subsystem is a ticket spin lock: the
//! critical sections are short and must be usable from the fault path.

pub mod ticket;

pub use self::ticket::{TicketMutex as Mutex, TicketMutexGuard as MutexGuard};
