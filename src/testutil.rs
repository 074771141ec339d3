//! 测试用的平台与上报端

use crate::adapters::onebot::EventSink;
use crate::bridge::Bridge;
use crate::config::AppConfig;
use crate::db;
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::{AllocMode, IdentityStore};
use crate::platform::{
    ChannelInfo, GuildInfo, NativeMessage, NativeUser, OutgoingMessage, Platform, SendAck,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub const BOT_NATIVE_ID: &str = "888";

#[derive(Default)]
pub struct RecordingPlatform {
    sent: Mutex<Vec<(String, OutgoingMessage)>>,
    failing: Mutex<HashSet<String>>,
    guilds: Mutex<Vec<GuildInfo>>,
    channels: Mutex<HashMap<String, Vec<ChannelInfo>>>,
    role_calls: Mutex<Vec<String>>,
    guild_queries: Mutex<Vec<(u32, Option<String>, Option<String>)>>,
}

impl RecordingPlatform {
    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }

    /// 发往该频道的消息一律失败
    pub fn fail_channel(&self, channel: &str) {
        self.failing.lock().unwrap().insert(channel.to_string());
    }

    pub fn add_guild(&self, guild: GuildInfo, channels: Vec<ChannelInfo>) {
        self.channels
            .lock()
            .unwrap()
            .insert(guild.id.clone(), channels);
        self.guilds.lock().unwrap().push(guild);
    }

    pub fn role_calls(&self) -> Vec<String> {
        self.role_calls.lock().unwrap().clone()
    }

    pub fn guild_queries(&self) -> Vec<(u32, Option<String>, Option<String>)> {
        self.guild_queries.lock().unwrap().clone()
    }
}

impl Platform for RecordingPlatform {
    fn name(&self) -> &str {
        "recording"
    }

    fn current_user(&self) -> BoxFuture<'_, BridgeResult<NativeUser>> {
        Box::pin(async move {
            Ok(NativeUser {
                id: BOT_NATIVE_ID.to_string(),
                username: "bot".to_string(),
                bot: true,
            })
        })
    }

    fn resolve_guild(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<GuildInfo>> {
        Box::pin(async move {
            self.guilds
                .lock()
                .unwrap()
                .iter()
                .find(|g| g.id == guild_id)
                .cloned()
                .ok_or_else(|| BridgeError::Platform(format!("unknown guild {}", guild_id)))
        })
    }

    fn list_user_guilds(
        &self,
        limit: u32,
        before: Option<String>,
        after: Option<String>,
    ) -> BoxFuture<'_, BridgeResult<Vec<GuildInfo>>> {
        Box::pin(async move {
            self.guild_queries
                .lock()
                .unwrap()
                .push((limit, before, after.clone()));
            let guilds = self.guilds.lock().unwrap().clone();
            let start = match after {
                Some(a) => guilds.iter().position(|g| g.id == a).map_or(0, |i| i + 1),
                None => 0,
            };
            Ok(guilds.into_iter().skip(start).take(limit as usize).collect())
        })
    }

    fn list_guild_channels(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<Vec<ChannelInfo>>> {
        Box::pin(async move {
            Ok(self
                .channels
                .lock()
                .unwrap()
                .get(&guild_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn send_channel_message(
        &self,
        channel_id: String,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, BridgeResult<SendAck>> {
        Box::pin(async move {
            if self.failing.lock().unwrap().contains(&channel_id) {
                return Err(BridgeError::Platform(format!("send to {} rejected", channel_id)));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((channel_id, message));
            Ok(SendAck {
                message_id: format!("sent-{}", sent.len()),
            })
        })
    }

    fn create_direct_channel(&self, user_id: String) -> BoxFuture<'_, BridgeResult<String>> {
        Box::pin(async move { Ok(format!("dm:{}", user_id)) })
    }

    fn add_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            self.role_calls
                .lock()
                .unwrap()
                .push(format!("add {} {} {}", guild_id, user_id, role_id));
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
            self.role_calls
                .lock()
                .unwrap()
                .push(format!("remove {} {} {}", guild_id, user_id, role_id));
            Ok(())
        })
    }
}

pub struct RecordingSink {
    id: String,
    fail: bool,
    payloads: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fail: false,
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(id)
        }
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Value> {
        self.payloads()
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_payload(&self, payload: String) -> BridgeResult<()> {
        if self.fail {
            return Err(BridgeError::Transport("closed".to_string()));
        }
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

pub struct TestBridge {
    pub bridge: Arc<Bridge>,
    pub platform: Arc<RecordingPlatform>,
    pub sink: Arc<RecordingSink>,
}

impl TestBridge {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(f: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig {
            send_delay: 0,
            ws_address: Vec::new(),
            ..AppConfig::default()
        };
        f(&mut config);

        let mode = if config.hash_id {
            AllocMode::Hash
        } else {
            AllocMode::Counter
        };
        let store = Arc::new(IdentityStore::new(db::memory().await.unwrap(), mode));
        store.init_schema().await.unwrap();

        let platform = Arc::new(RecordingPlatform::default());
        let bridge = Arc::new(Bridge::new(
            config,
            store,
            platform.clone(),
            reqwest::Client::new(),
        ));
        bridge.set_bot_native_id(BOT_NATIVE_ID);

        let sink = Arc::new(RecordingSink::new("test"));
        bridge.hub.register(sink.clone());

        Self {
            bridge,
            platform,
            sink,
        }
    }
}

pub fn native_message(
    id: &str,
    guild_id: Option<&str>,
    channel_id: &str,
    author_id: &str,
    content: &str,
) -> NativeMessage {
    NativeMessage {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        guild_id: guild_id.map(str::to_string),
        author: NativeUser {
            id: author_id.to_string(),
            username: format!("user-{}", author_id),
            bot: false,
        },
        content: content.to_string(),
        attachments: Vec::new(),
        timestamp: 1_700_000_000,
    }
}
