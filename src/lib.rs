//! Ground-station hardware manager: arbitrates time-boxed, exclusive use of
//! shared hardware pipelines among reservations from an external schedule.

pub mod command;
pub mod config;
pub mod hardware;
pub mod logging;
pub mod sessions;
pub mod tasks;
pub mod telemetry;
