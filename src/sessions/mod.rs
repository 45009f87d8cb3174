pub mod coordinator;
pub mod schedule;
pub mod session;
