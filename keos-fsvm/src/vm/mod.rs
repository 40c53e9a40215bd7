//! C4: the supplemental page table, its swap backing store, and the
//! page-fault policy that ties them together.

pub mod fault;
pub mod spt;
pub mod swap;

pub use fault::handle_page_fault;
pub use spt::{Backing, Spt, SptEntry};
pub use swap::SwapArea;
