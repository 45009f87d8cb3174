pub mod device;
pub mod manager;
pub mod pipeline;
