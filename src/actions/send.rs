//! 发送消息类动作
//!
//! 按会话类型选择平台调用:
//! - guild / group: 发到 group_id 对应的频道 (guild 要求频道所属服务器已知)
//! - group_private: 经由群找到成员，打开私信发送 (需要 group_id 与 user_id)
//! - guild_private: 打开与 user_id 的私信发送

use crate::bridge::Bridge;
use crate::correlation::ConversationType;
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::ATTR_GUILD_ID;
use crate::onebot::ActionFrame;
use crate::platform::{OutgoingMessage, SendAck};
use crate::transcode::outbound;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use std::sync::Arc;

/// 动作允许的会话类型范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Any,
    Group,
    Private,
}

impl Scope {
    fn allows(self, ty: ConversationType) -> bool {
        match self {
            Scope::Any => true,
            Scope::Group => matches!(ty, ConversationType::Group | ConversationType::Guild),
            Scope::Private => matches!(
                ty,
                ConversationType::GroupPrivate | ConversationType::GuildPrivate
            ),
        }
    }

    fn from_message_type(message_type: Option<&str>) -> Self {
        match message_type {
            Some("group") => Scope::Group,
            Some("private") => Scope::Private,
            _ => Scope::Any,
        }
    }
}

fn missing(field: &str) -> BridgeError {
    BridgeError::InvalidArgument(format!("缺少 {}", field))
}

pub fn send_msg(bridge: Arc<Bridge>, frame: ActionFrame) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let scope = Scope::from_message_type(frame.params.message_type.as_deref());
        send_resolved(&bridge, &frame, scope).await
    })
}

pub fn send_group_msg(
    bridge: Arc<Bridge>,
    frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move { send_resolved(&bridge, &frame, Scope::Group).await })
}

pub fn send_private_msg(
    bridge: Arc<Bridge>,
    frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move { send_resolved(&bridge, &frame, Scope::Private).await })
}

/// channel_id 直接是平台频道 id，不需要类型解析
pub fn send_guild_channel_msg(
    bridge: Arc<Bridge>,
    frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let channel = frame
            .params
            .channel_id
            .clone()
            .ok_or_else(|| missing("channel_id"))?;
        let mut out = prepare(&bridge, &frame).await?;

        let synthetic = bridge.store.store_or_get(&channel).await?;
        let token = bridge.reply_token(&channel, frame.echo_key().as_deref(), synthetic);
        bridge.attach_reply(&mut out, token);

        let ack = bridge.platform.send_channel_message(channel, out).await?;
        message_id_response(&bridge, &ack).await
    })
}

/// 解析并渲染 message 字段，渲染一次供每次尝试复用
async fn prepare(bridge: &Bridge, frame: &ActionFrame) -> BridgeResult<OutgoingMessage> {
    let content = frame
        .params
        .message
        .as_ref()
        .ok_or_else(|| missing("message"))?;
    let parts = outbound::parse(content);
    let rendered = bridge.renderer.render(parts, bridge.render_options()).await;
    if rendered.is_empty() {
        return Err(BridgeError::InvalidArgument("消息内容为空".to_string()));
    }
    Ok(rendered)
}

async fn send_resolved(bridge: &Bridge, frame: &ActionFrame, scope: Scope) -> BridgeResult<Value> {
    let rendered = prepare(bridge, frame).await?;
    let target = frame.target();

    let rendered = &rendered;
    let ack = bridge
        .resolver
        .dispatch(&target, move |ty| deliver(bridge, frame, rendered, scope, ty))
        .await?;

    message_id_response(bridge, &ack).await
}

async fn message_id_response(bridge: &Bridge, ack: &SendAck) -> BridgeResult<Value> {
    let message_id = bridge.store.store_or_get(&ack.message_id).await?;
    Ok(json!({ "message_id": message_id }))
}

/// 按指定类型发送一次
async fn deliver(
    bridge: &Bridge,
    frame: &ActionFrame,
    rendered: &OutgoingMessage,
    scope: Scope,
    ty: ConversationType,
) -> BridgeResult<SendAck> {
    if !scope.allows(ty) {
        return Err(BridgeError::InvalidArgument(format!(
            "{} 不能按 {} 发送",
            frame.action, ty
        )));
    }

    let params = &frame.params;
    let echo = frame.echo_key();
    let mut out = rendered.clone();

    match ty {
        ConversationType::Guild | ConversationType::Group => {
            let group_id = params.group_id.ok_or_else(|| missing("group_id"))?;
            let channel = bridge.channel_native(group_id, params.user_id).await?;
            if ty == ConversationType::Guild {
                bridge.store.read_attribute(&channel, ATTR_GUILD_ID).await?;
            }

            let token = bridge.reply_token(&channel, echo.as_deref(), group_id);
            bridge.attach_reply(&mut out, token);
            bridge.platform.send_channel_message(channel, out).await
        }
        ConversationType::GroupPrivate | ConversationType::GuildPrivate => {
            let user_id = params.user_id.ok_or_else(|| missing("user_id"))?;
            let via_group = match ty {
                ConversationType::GroupPrivate => {
                    Some(params.group_id.ok_or_else(|| missing("group_id"))?)
                }
                _ => None,
            };
            let member = bridge.member_native(user_id, via_group).await?;
            let dm = bridge
                .platform
                .create_direct_channel(member.clone())
                .await?;

            let token = bridge.reply_token(&member, echo.as_deref(), user_id);
            bridge.attach_reply(&mut out, token);
            bridge.platform.send_channel_message(dm, out).await
        }
    }
}
