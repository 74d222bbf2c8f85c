pub mod common;
pub mod read;
pub mod status;
pub mod sync;
pub mod write;
