//! Synchronization primitives shared by every subsystem built on this crate.
//!
//! There is no real interrupt dispatcher here (it is one of the external
//! collaborators listed in the crate docs), so [`SpinLock`] degrades to a
//! plain busy-wait mutex: correct for the single-core, cooperative-yield
//! model the subsystems above are tested against, and the same shape a real
//! kernel would slot an `InterruptGuard` into later.

pub mod atomic;
pub mod spinlock;

pub use spinlock::SpinLock;
