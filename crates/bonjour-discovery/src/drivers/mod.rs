//! Driver implementations.

pub mod mdns;
pub mod memory;

pub use mdns::{MdnsDriver, MdnsHandle, MDNS_DRIVER_NAME};
pub use memory::{DriverStats, MemoryDriver, MemoryHandle, MEMORY_DRIVER_NAME};
