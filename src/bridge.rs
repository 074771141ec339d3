//! 桥接上下文
//!
//! 入站处理、动作处理、各适配器共享同一个 [`Bridge`]。

use crate::adapters::onebot::Hub;
use crate::config::AppConfig;
use crate::correlation::{ConversationType, CorrelationStore};
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::IdentityStore;
use crate::platform::{NativeMessage, OutgoingMessage, Platform, SendAck};
use crate::resolver::TypeResolver;
use crate::transcode::render::{RenderOptions, Renderer};
use crate::{debug, inbound};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub struct Bridge {
    config: RwLock<AppConfig>,
    pub store: Arc<IdentityStore>,
    pub correlation: Arc<CorrelationStore>,
    pub resolver: TypeResolver,
    pub renderer: Renderer,
    pub platform: Arc<dyn Platform>,
    pub hub: Hub,
    bot_native_id: RwLock<String>,
}

impl Bridge {
    pub fn new(
        config: AppConfig,
        store: Arc<IdentityStore>,
        platform: Arc<dyn Platform>,
        http: reqwest::Client,
    ) -> Self {
        let correlation = Arc::new(CorrelationStore::new());
        let resolver = TypeResolver::new(
            store.clone(),
            correlation.clone(),
            config.app_id,
            Duration::from_millis(config.send_delay),
        );
        let renderer = Renderer::new(store.clone(), http.clone());
        let hub = Hub::new(http, config.post_url.clone(), config.app_id);

        Self {
            config: RwLock::new(config),
            store,
            correlation,
            resolver,
            renderer,
            platform,
            hub,
            bot_native_id: RwLock::new(String::new()),
        }
    }

    /// 当前配置的快照
    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn app_id(&self) -> i64 {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .app_id
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            url_pic_transfer: self
                .config
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .url_pic_transfer,
        }
    }

    pub fn bot_native_id(&self) -> String {
        self.bot_native_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_bot_native_id(&self, id: &str) {
        *self
            .bot_native_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = id.to_string();
    }

    /// 平台推送消息的入口
    pub async fn handle_native_message(self: &Arc<Self>, msg: NativeMessage) -> BridgeResult<()> {
        inbound::handle(self, msg).await
    }

    // ===== 虚拟 id -> 平台 id =====

    /// 群号对应的平台频道；组合模式且带 user_id 时按组合还原
    pub async fn channel_native(&self, group_id: i64, user_id: Option<i64>) -> BridgeResult<String> {
        if self.config().idmap_pro
            && let Some(uid) = user_id
        {
            match self.store.resolve_pair(group_id, uid).await {
                Ok((container, _)) => return Ok(container),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.store.resolve_native(group_id).await
    }

    pub async fn member_native(&self, user_id: i64, group_id: Option<i64>) -> BridgeResult<String> {
        if self.config().idmap_pro
            && let Some(gid) = group_id
        {
            match self.store.resolve_pair(gid, user_id).await {
                Ok((_, member)) => return Ok(member),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.store.resolve_native(user_id).await
    }

    // ===== 回复 =====

    /// 回复引用的平台消息 id: 懒回复模式取会话最近一条入站消息，
    /// 否则按 echo、再按 `{app_id}_{虚拟 id}` 查找
    pub fn reply_token(&self, conversation: &str, echo: Option<&str>, synthetic_id: i64) -> Option<String> {
        if self.config().lazy_message_id {
            return self.correlation.last_inbound_token(conversation);
        }
        echo.and_then(|e| self.correlation.message_token(e))
            .or_else(|| {
                self.correlation
                    .message_token(&self.resolver.memo_key(synthetic_id))
            })
    }

    /// 填入回复引用和序号
    pub fn attach_reply(&self, msg: &mut OutgoingMessage, token: Option<String>) {
        if let Some(token) = token {
            msg.sequence = self.correlation.bump_reply_sequence(&token);
            msg.reply_to = Some(token);
        }
    }

    /// 直接回复一条入站消息 (指令反馈、白名单提示)
    pub async fn reply_text(
        &self,
        msg: &NativeMessage,
        ty: ConversationType,
        text: &str,
    ) -> BridgeResult<SendAck> {
        if text.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("回复内容为空".to_string()));
        }

        let mut out = OutgoingMessage::text(text);

        // 只有回到原消息所在频道时才能引用它
        let (channel, same_channel) = match ty {
            ConversationType::Guild | ConversationType::Group => (msg.channel_id.clone(), true),
            ConversationType::GuildPrivate | ConversationType::GroupPrivate => (
                self.platform
                    .create_direct_channel(msg.author.id.clone())
                    .await?,
                msg.guild_id.is_none(),
            ),
        };
        if same_channel {
            self.attach_reply(&mut out, Some(msg.id.clone()));
        }
        debug!(target: "Bridge", "回复 {} ({}): {}", channel, ty, text);
        self.platform.send_channel_message(channel, out).await
    }
}
