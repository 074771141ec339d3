//! 平台侧接口
//!
//! 桥接层只通过 [`Platform`] 调用对端平台，具体实现见 `rest` (HTTP API)
//! 与 `adapters::console` (本地调试)。

use crate::error::BridgeResult;
use futures_util::future::BoxFuture;

pub mod rest;

// ================= 平台数据结构 =================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub member_count: u32,
    pub max_members: u32,
    /// unix 秒，平台不提供时为 0
    pub joined_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeUser {
    pub id: String,
    pub username: String,
    pub bot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeAttachment {
    pub filename: String,
    pub url: String,
    pub content_type: String,
}

/// 平台推送过来的一条消息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeMessage {
    pub id: String,
    pub channel_id: String,
    /// 私信时为 None
    pub guild_id: Option<String>,
    pub author: NativeUser,
    pub content: String,
    pub attachments: Vec<NativeAttachment>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    /// 直接打开链接
    Link(String),
    /// 回调 id，由平台回传给机器人
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

/// 渲染完成、可以直接发送的消息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub files: Vec<OutgoingFile>,
    /// 以引用方式嵌入的图片地址
    pub image_urls: Vec<String>,
    pub button_rows: Vec<Vec<Button>>,
    /// 被回复的消息 id
    pub reply_to: Option<String>,
    pub sequence: u32,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
            && self.files.is_empty()
            && self.image_urls.is_empty()
            && self.button_rows.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendAck {
    pub message_id: String,
}

// ================= 平台接口 =================

pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// 机器人自身账号
    fn current_user(&self) -> BoxFuture<'_, BridgeResult<NativeUser>>;

    fn resolve_guild(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<GuildInfo>>;

    fn list_user_guilds(
        &self,
        limit: u32,
        before: Option<String>,
        after: Option<String>,
    ) -> BoxFuture<'_, BridgeResult<Vec<GuildInfo>>>;

    fn list_guild_channels(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<Vec<ChannelInfo>>>;

    fn send_channel_message(
        &self,
        channel_id: String,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, BridgeResult<SendAck>>;

    /// 打开与用户的私信频道，返回频道 id
    fn create_direct_channel(&self, user_id: String) -> BoxFuture<'_, BridgeResult<String>>;

    fn add_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>>;

    fn remove_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>>;
}
