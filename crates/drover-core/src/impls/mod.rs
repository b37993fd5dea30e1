//! Backend implementations of the persistence port.

mod memory;

pub use memory::InMemoryStore;
