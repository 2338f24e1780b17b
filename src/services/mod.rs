pub mod decode;
pub mod dispatch;
pub mod inference;
pub mod pipeline;
pub mod storage;
pub mod validation;
