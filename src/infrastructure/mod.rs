pub mod pipeline;
pub mod storage;
