pub mod blockinfo;
pub mod error;
pub mod storage;
pub mod storage_info;
pub mod disk;

pub mod iovecs;

pub mod avg;

mod define;
pub use define::*;
