// Content-addressed work pools

pub mod test_pool;
pub mod trace_pool;

pub use test_pool::{TestPool, TestSchedStrat};
pub use trace_pool::{AddressRange, ElfEntry, ElfSymbols, TracePool};
