//! onebridge: 让 OneBot v11 机器人框架接入频道 / 服务器式聊天平台
//!
//! 平台侧的字符串 id 被映射为 OneBot 端需要的数字 id，
//! 发送时再映射回去并探测会话类型。

#[macro_use]
pub mod log;

pub mod actions;
pub mod adapters;
pub mod bridge;
pub mod command;
pub mod config;
pub mod correlation;
pub mod db;
pub mod error;
pub mod idmap;
pub mod inbound;
pub mod message;
pub mod onebot;
pub mod platform;
pub mod resolver;
pub mod transcode;

#[cfg(test)]
mod testutil;
