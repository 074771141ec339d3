//! 控制台模式
//!
//! 不连接任何平台：标准输入的每一行被当作频道消息送入桥，
//! 桥发往平台的消息直接打印出来。用于本地调试 OneBot 端。

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::platform::{
    ChannelInfo, GuildInfo, NativeMessage, NativeUser, OutgoingMessage, Platform, SendAck,
};
use crate::{info, warn};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};

pub const CONSOLE_GUILD: &str = "console-guild";
pub const CONSOLE_CHANNEL: &str = "console-channel";
pub const CONSOLE_USER: &str = "console-user";
pub const CONSOLE_BOT: &str = "console-bot";

fn console_guild() -> GuildInfo {
    GuildInfo {
        id: CONSOLE_GUILD.to_string(),
        name: "Console".to_string(),
        description: "本地调试".to_string(),
        member_count: 2,
        max_members: 2,
        joined_at: 0,
    }
}

#[derive(Default)]
pub struct ConsolePlatform {
    seq: AtomicU64,
}

impl ConsolePlatform {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Platform for ConsolePlatform {
    fn name(&self) -> &str {
        "console"
    }

    fn current_user(&self) -> BoxFuture<'_, BridgeResult<NativeUser>> {
        Box::pin(async move {
            Ok(NativeUser {
                id: CONSOLE_BOT.to_string(),
                username: "Console Bot".to_string(),
                bot: true,
            })
        })
    }

    fn resolve_guild(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<GuildInfo>> {
        Box::pin(async move {
            if guild_id == CONSOLE_GUILD {
                Ok(console_guild())
            } else {
                Err(BridgeError::NotFound(format!("服务器 {}", guild_id)))
            }
        })
    }

    fn list_user_guilds(
        &self,
        _limit: u32,
        _before: Option<String>,
        after: Option<String>,
    ) -> BoxFuture<'_, BridgeResult<Vec<GuildInfo>>> {
        Box::pin(async move {
            // 只有一个服务器，翻页后为空
            if after.is_some() {
                return Ok(Vec::new());
            }
            Ok(vec![console_guild()])
        })
    }

    fn list_guild_channels(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<Vec<ChannelInfo>>> {
        Box::pin(async move {
            if guild_id != CONSOLE_GUILD {
                return Ok(Vec::new());
            }
            Ok(vec![ChannelInfo {
                id: CONSOLE_CHANNEL.to_string(),
                name: "console".to_string(),
            }])
        })
    }

    fn send_channel_message(
        &self,
        channel_id: String,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, BridgeResult<SendAck>> {
        Box::pin(async move {
            println!("\x1b[36m[Bot Reply -> {}] > \x1b[0m{}", channel_id, message.content);
            for url in &message.image_urls {
                println!("\x1b[90m  [image] {}\x1b[0m", url);
            }
            for file in &message.files {
                println!("\x1b[90m  [file] {} ({} bytes)\x1b[0m", file.name, file.data.len());
            }
            Ok(SendAck {
                message_id: self.next_id("bot"),
            })
        })
    }

    fn create_direct_channel(&self, user_id: String) -> BoxFuture<'_, BridgeResult<String>> {
        Box::pin(async move { Ok(format!("dm-{}", user_id)) })
    }

    fn add_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            println!("\x1b[90m[API Call] > add role {} to {} in {}\x1b[0m", role_id, user_id, guild_id);
            Ok(())
        })
    }

    fn remove_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            println!(
                "\x1b[90m[API Call] > remove role {} from {} in {}\x1b[0m",
                role_id, user_id, guild_id
            );
            Ok(())
        })
    }
}

/// 把一行输入包装成频道消息
pub fn console_message(id: String, line: &str) -> NativeMessage {
    NativeMessage {
        id,
        channel_id: CONSOLE_CHANNEL.to_string(),
        guild_id: Some(CONSOLE_GUILD.to_string()),
        author: NativeUser {
            id: CONSOLE_USER.to_string(),
            username: "ConsoleUser".to_string(),
            bot: false,
        },
        content: line.to_string(),
        attachments: Vec::new(),
        timestamp: chrono::Local::now().timestamp(),
    }
}

/// 控制台适配器入口
pub fn entry(bridge: Arc<Bridge>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        info!(target: "Console", "已启动控制台模式，输入的每一行都会作为频道消息上报");
        info!(
            target: "Console",
            "模拟环境: 服务器 {} | 频道 {} | 用户 {}",
            CONSOLE_GUILD, CONSOLE_CHANNEL, CONSOLE_USER
        );

        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        let mut seq: u64 = 0;

        while let Ok(Some(line)) = reader.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            seq += 1;

            let msg = console_message(format!("console-{}", seq), line);
            if let Err(e) = bridge.handle_native_message(msg).await {
                warn!(target: "Console", "处理消息时出错: {}", e);
            }
        }

        info!(target: "Console", "标准输入已关闭");
    })
}
