pub mod client;
pub mod message;

pub use client::{NotificationHandler, RpcClient};
