pub mod api;
pub mod emotion;
pub mod job;
