pub mod engine;
pub mod meta;
pub mod storage;
pub mod topic;
pub mod value;

pub use engine::{ConnectionInfo, ServerImpl, SharedServer};
