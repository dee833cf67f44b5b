//! 领域模型 / Domain model.

pub mod message;

pub use message::{fake_channel_id, person_channel_peers, Message};
