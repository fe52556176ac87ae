pub mod memory_channel;
pub mod redis_channel;
