//! Pinned memory, the general-purpose buffer pool and memory registration.

mod iobuf;
mod pinned;
mod region;

pub use self::iobuf::*;
pub use self::pinned::*;
pub use self::region::*;
