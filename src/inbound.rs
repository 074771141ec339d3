//! 平台消息 -> OneBot 上报
//!
//! 1. 判定会话类型，登记 id 与属性
//! 2. 记住回复所需的消息 id
//! 3. 内置指令
//! 4. 白名单 / 黑名单 / 显示前缀
//! 5. 转换并广播

use crate::bridge::Bridge;
use crate::command::{self, Invocation, clean_text};
use crate::config::AppConfig;
use crate::correlation::{ConversationType, CorrelationStore};
use crate::error::BridgeResult;
use crate::idmap::{ATTR_CHANNEL_ID, ATTR_GUILD_ID, ATTR_TYPE};
use crate::onebot::{EventMessage, IdValue, MessageEvent, Sender};
use crate::platform::NativeMessage;
use crate::transcode::{self, InboundOptions};
use crate::{debug, warn};
use std::sync::Arc;

/// 过滤结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 继续上报，可能需要去掉一个显示前缀
    Pass { strip: Option<String> },
    /// 丢弃，可能需要回复一句兜底提示
    Drop { reply: Option<String> },
}

/// 对去掉 @ 后的文本应用前缀规则
pub fn filter(
    config: &AppConfig,
    correlation: &CorrelationStore,
    group_id: i64,
    raw: &str,
) -> Verdict {
    let text = clean_text(raw);

    if config.white_prefix_mode && !config.white_bypass.contains(&group_id) {
        let first = text.split_whitespace().next().unwrap_or("");
        let matched = config
            .white_prefixs
            .iter()
            .any(|p| text.starts_with(p.as_str()))
            || correlation.is_temporary_command(first);
        if !matched {
            let reply = Some(config.no_white_response.clone()).filter(|r| !r.trim().is_empty());
            return Verdict::Drop { reply };
        }
    }

    if config.black_prefix_mode
        && config
            .black_prefixs
            .iter()
            .any(|p| !p.is_empty() && text.starts_with(p.as_str()))
    {
        return Verdict::Drop { reply: None };
    }

    // 只去掉第一个匹配的前缀，且前缀后面还要有内容
    let strip = config
        .visual_prefixs
        .iter()
        .find(|p| !p.is_empty() && text.starts_with(p.as_str()))
        .filter(|p| text.len() > p.len())
        .cloned();

    Verdict::Pass { strip }
}

pub async fn handle(bridge: &Arc<Bridge>, msg: NativeMessage) -> BridgeResult<()> {
    let config = bridge.config();
    let bot_id = bridge.bot_native_id();
    if !bot_id.is_empty() && msg.author.id == bot_id {
        return Ok(());
    }

    let ty = if msg.guild_id.is_some() {
        ConversationType::Guild
    } else {
        ConversationType::GuildPrivate
    };

    let store = &bridge.store;
    let (group_id, user_id) = if config.idmap_pro {
        store
            .store_or_get_pair(&msg.channel_id, &msg.author.id)
            .await?
    } else {
        (
            store.store_or_get(&msg.channel_id).await?,
            store.store_or_get(&msg.author.id).await?,
        )
    };

    remember(bridge, &msg, ty, group_id, user_id).await?;
    let message_id = store.store_or_get(&msg.id).await?;

    let inv = Invocation {
        msg: &msg,
        ty,
        group_id,
        user_id,
    };
    if let Err(e) = command::handle(bridge, &inv).await {
        warn!(target: "Inbound", "指令处理失败: {}", e);
    }

    let opts = InboundOptions {
        bot_native_id: bot_id,
        app_id: config.app_id,
        remove_at: config.remove_at,
        remove_prefix: config.remove_prefix,
    };
    let mut raw = transcode::to_cq_string(store, &msg, &opts).await?;

    let strip = match filter(&config, &bridge.correlation, group_id, &raw) {
        Verdict::Pass { strip } => strip,
        Verdict::Drop { reply } => {
            debug!(target: "Inbound", "消息 {} 被前缀规则过滤", msg.id);
            if let Some(text) = reply
                && let Err(e) = bridge.reply_text(&msg, ty, &text).await
            {
                warn!(target: "Inbound", "兜底回复发送失败: {}", e);
            }
            return Ok(());
        }
    };

    if let Some(prefix) = &strip {
        raw = raw.replacen(prefix.as_str(), "", 1);
    }
    if raw.is_empty() {
        debug!(target: "Inbound", "消息 {} 转换后为空，不上报", msg.id);
        return Ok(());
    }

    let message = if config.array {
        let mut segments = transcode::to_segments(store, &msg, &opts).await?;
        if let Some(prefix) = &strip {
            segments.strip_text_prefix(prefix);
        }
        EventMessage::Segments(segments)
    } else {
        EventMessage::Text(raw.clone())
    };

    let (message_type, sub_type, event_group) = match ty {
        ConversationType::Guild | ConversationType::Group => (
            "group",
            "normal",
            Some(IdValue::new(group_id, config.string_group_id)),
        ),
        ConversationType::GuildPrivate | ConversationType::GroupPrivate => {
            ("private", "friend", None)
        }
    };

    let event = MessageEvent {
        post_type: "message",
        message_type,
        sub_type,
        self_id: config.app_id,
        user_id,
        group_id: event_group,
        message_id,
        message,
        raw_message: raw,
        font: 0,
        time: if msg.timestamp > 0 {
            msg.timestamp
        } else {
            chrono::Utc::now().timestamp()
        },
        echo: msg.id.clone(),
        sender: Sender {
            nickname: msg.author.username.clone(),
            user_id,
            ..Default::default()
        },
        real_message_type: ty.as_str(),
    };

    debug!(target: "Inbound", "{} 消息 {} -> {}", ty, msg.id, message_id);
    bridge.hub.broadcast(&event).await
}

/// 登记层级属性、会话类型与回复用的消息 id
async fn remember(
    bridge: &Bridge,
    msg: &NativeMessage,
    ty: ConversationType,
    group_id: i64,
    user_id: i64,
) -> BridgeResult<()> {
    let store = &bridge.store;
    if let Some(guild) = &msg.guild_id {
        store
            .write_attribute(&msg.channel_id, ATTR_GUILD_ID, guild)
            .await?;
    }
    store
        .write_attribute(&msg.author.id, ATTR_CHANNEL_ID, &msg.channel_id)
        .await?;

    // 频道消息记在群上，私信记在用户上
    let (subject, conversation) = match ty {
        ConversationType::Guild | ConversationType::Group => (group_id, msg.channel_id.as_str()),
        ConversationType::GuildPrivate | ConversationType::GroupPrivate => {
            (user_id, msg.author.id.as_str())
        }
    };
    store
        .write_attribute(&subject.to_string(), ATTR_TYPE, ty.as_str())
        .await?;

    let correlation = &bridge.correlation;
    let key = bridge.resolver.memo_key(subject);
    correlation.set_type(&key, ty);
    correlation.remember_message_token(&key, &msg.id);
    correlation.set_type(&msg.id, ty);
    correlation.remember_message_token(&msg.id, &msg.id);
    correlation.remember_last_inbound_token(conversation, &msg.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BOT_NATIVE_ID, TestBridge, native_message};
    use serde_json::json;

    #[tokio::test]
    async fn guild_message_is_recorded_and_broadcast() {
        let t = TestBridge::new().await;
        let b = &t.bridge;
        let msg = native_message("m1", Some("g1"), "c1", "u1", "<@!999> hello");
        b.handle_native_message(msg).await.unwrap();

        let group = b.store.lookup_synthetic("c1").await.unwrap().unwrap();
        let user = b.store.lookup_synthetic("u1").await.unwrap().unwrap();
        let mentioned = b.store.lookup_synthetic("999").await.unwrap().unwrap();
        let message_id = b.store.lookup_synthetic("m1").await.unwrap().unwrap();

        let events = t.sink.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e["post_type"], "message");
        assert_eq!(e["message_type"], "group");
        assert_eq!(e["real_message_type"], "guild");
        assert_eq!(e["group_id"], json!(group));
        assert_eq!(e["user_id"], json!(user));
        assert_eq!(e["message_id"], json!(message_id));
        assert_eq!(e["echo"], "m1");
        assert_eq!(e["sender"]["nickname"], "user-u1");
        assert_eq!(
            e["message"],
            json!([
                {"type": "at", "data": {"qq": mentioned.to_string()}},
                {"type": "text", "data": {"text": "hello"}}
            ])
        );

        assert_eq!(
            b.store.read_attribute("c1", ATTR_GUILD_ID).await.unwrap(),
            "g1"
        );
        assert_eq!(
            b.store.read_attribute("u1", ATTR_CHANNEL_ID).await.unwrap(),
            "c1"
        );
        assert_eq!(
            b.store
                .read_attribute(&group.to_string(), ATTR_TYPE)
                .await
                .unwrap(),
            "guild"
        );
        assert_eq!(
            b.correlation.get_type(&b.resolver.memo_key(group)),
            Some(ConversationType::Guild)
        );
        assert_eq!(b.correlation.last_inbound_token("c1").as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn direct_message_is_private() {
        let t = TestBridge::with_config(|c| c.array = false).await;
        let b = &t.bridge;
        b.handle_native_message(native_message("m2", None, "dm1", "u7", "hi"))
            .await
            .unwrap();

        let user = b.store.lookup_synthetic("u7").await.unwrap().unwrap();
        let e = &t.sink.events()[0];
        assert_eq!(e["message_type"], "private");
        assert_eq!(e["real_message_type"], "guild_private");
        assert!(e.get("group_id").is_none());
        assert_eq!(e["message"], "hi");
        assert_eq!(
            b.store
                .read_attribute(&user.to_string(), ATTR_TYPE)
                .await
                .unwrap(),
            "guild_private"
        );
        assert_eq!(b.correlation.last_inbound_token("u7").as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let t = TestBridge::new().await;
        t.bridge
            .handle_native_message(native_message("m3", Some("g"), "c", BOT_NATIVE_ID, "echo"))
            .await
            .unwrap();
        assert!(t.sink.events().is_empty());
        assert_eq!(t.bridge.store.lookup_synthetic("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn string_group_id_is_emitted_as_text() {
        let t = TestBridge::with_config(|c| c.string_group_id = true).await;
        t.bridge
            .handle_native_message(native_message("m4", Some("g"), "c", "u", "x"))
            .await
            .unwrap();
        let group = t.bridge.store.lookup_synthetic("c").await.unwrap().unwrap();
        assert_eq!(t.sink.events()[0]["group_id"], json!(group.to_string()));
    }

    #[tokio::test]
    async fn whitelist_miss_drops_and_replies() {
        let t = TestBridge::with_config(|c| {
            c.white_prefix_mode = true;
            c.white_prefixs = vec!["/help".to_string()];
            c.no_white_response = "不支持的指令".to_string();
        })
        .await;

        t.bridge
            .handle_native_message(native_message("m5", Some("g"), "c", "u", "random chat"))
            .await
            .unwrap();
        assert!(t.sink.events().is_empty());
        assert_eq!(t.platform.sent()[0].1.content, "不支持的指令");

        t.bridge
            .handle_native_message(native_message("m6", Some("g"), "c", "u", "<@888> /help me"))
            .await
            .unwrap();
        assert_eq!(t.sink.events().len(), 1);
    }

    #[test]
    fn filter_rules() {
        let correlation = CorrelationStore::new();
        let mut config = AppConfig {
            white_prefix_mode: true,
            white_prefixs: vec!["/a".to_string()],
            white_bypass: vec![42],
            black_prefix_mode: true,
            black_prefixs: vec!["/a-secret".to_string()],
            visual_prefixs: vec!["/a".to_string()],
            ..AppConfig::default()
        };

        assert_eq!(
            filter(&config, &correlation, 1, "hello"),
            Verdict::Drop { reply: None }
        );
        // 例外群不走白名单
        assert_eq!(
            filter(&config, &correlation, 42, "hello"),
            Verdict::Pass { strip: None }
        );
        // 临时指令视为白名单
        let token = correlation.issue_temporary_command();
        assert_eq!(
            filter(&config, &correlation, 1, &format!("{} 1 2", token)),
            Verdict::Pass { strip: None }
        );
        assert_eq!(
            filter(&config, &correlation, 1, "/a-secret x"),
            Verdict::Drop { reply: None }
        );
        assert_eq!(
            filter(&config, &correlation, 1, "[CQ:at,qq=1] /a run"),
            Verdict::Pass {
                strip: Some("/a".to_string())
            }
        );
        // 只有前缀本身时不去除
        config.black_prefix_mode = false;
        assert_eq!(
            filter(&config, &correlation, 1, "/a"),
            Verdict::Pass { strip: None }
        );
    }

    #[tokio::test]
    async fn visual_prefix_is_removed_before_broadcast() {
        let t = TestBridge::with_config(|c| c.visual_prefixs = vec!["#".to_string()]).await;
        t.bridge
            .handle_native_message(native_message("m7", Some("g"), "c", "u", "#签到"))
            .await
            .unwrap();
        let e = &t.sink.events()[0];
        assert_eq!(e["raw_message"], "签到");
        assert_eq!(e["message"][0]["data"]["text"], "签到");
    }
}
