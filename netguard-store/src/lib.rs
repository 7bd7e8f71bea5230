pub mod subnet;

pub use subnet::{AllocatorError, SubnetAllocator};
