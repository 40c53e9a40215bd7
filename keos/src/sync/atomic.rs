//! Thin wrappers around [`core::sync::atomic`] so call sites read
//! `keos::sync::atomic::AtomicBool` like every other primitive in this
//! crate, instead of reaching into `core` directly.

use core::sync::atomic::Ordering;

/// A boolean that can be safely shared between threads.
#[derive(Default)]
pub struct AtomicBool(core::sync::atomic::AtomicBool);

impl AtomicBool {
    /// Creates a new `AtomicBool`.
    pub const fn new(v: bool) -> AtomicBool {
        Self(core::sync::atomic::AtomicBool::new(v))
    }

    /// Loads the current value.
    pub fn load(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stores a new value.
    pub fn store(&self, v: bool) {
        self.0.store(v, Ordering::SeqCst)
    }

    /// Stores `v`, returning the previous value.
    pub fn swap(&self, v: bool) -> bool {
        self.0.swap(v, Ordering::SeqCst)
    }
}

/// An unsigned word that can be safely shared between threads.
#[derive(Default)]
pub struct AtomicUsize(core::sync::atomic::AtomicUsize);

impl AtomicUsize {
    /// Creates a new `AtomicUsize`.
    pub const fn new(v: usize) -> AtomicUsize {
        Self(core::sync::atomic::AtomicUsize::new(v))
    }

    /// Loads the current value.
    pub fn load(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Stores a new value.
    pub fn store(&self, v: usize) {
        self.0.store(v, Ordering::SeqCst)
    }

    /// Adds `v`, returning the previous value.
    pub fn fetch_add(&self, v: usize) -> usize {
        self.0.fetch_add(v, Ordering::SeqCst)
    }

    /// Subtracts `v`, returning the previous value.
    pub fn fetch_sub(&self, v: usize) -> usize {
        self.0.fetch_sub(v, Ordering::SeqCst)
    }
}
