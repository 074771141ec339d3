//! HTTP API 实现 (v10 风格的 REST 接口)

use super::{
    Button, ButtonAction, ChannelInfo, GuildInfo, NativeUser, OutgoingMessage, Platform, SendAck,
};
use crate::debug;
use crate::error::{BridgeError, BridgeResult};
use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 平台调用统一超时
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const BUTTON_EMOJI: &str = "🌙";

pub struct RestPlatform {
    http: reqwest::Client,
    base: String,
}

impl RestPlatform {
    pub fn new(api_base: &str, token: &str) -> BridgeResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bot {}", token))
            .map_err(|e| BridgeError::InvalidArgument(format!("token 含非法字符: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        // 校验地址格式
        let base = url::Url::parse(api_base)
            .map_err(|e| BridgeError::InvalidArgument(format!("api_base 无效: {}", e)))?;

        Ok(Self {
            http,
            base: base.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base, path))
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> BridgeResult<T> {
        let resp = req.send().await?;
        let status = resp.status();
        let mut body = resp.bytes().await?.to_vec();
        if !status.is_success() {
            return Err(BridgeError::Platform(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        simd_json::serde::from_slice(&mut body)
            .map_err(|e| BridgeError::Platform(format!("响应解析失败: {}", e)))
    }

    async fn call_empty(&self, req: RequestBuilder) -> BridgeResult<()> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::Platform(format!("HTTP {}: {}", status, body)));
        }
        Ok(())
    }

    fn json_body<T: Serialize>(req: RequestBuilder, body: &T) -> BridgeResult<RequestBuilder> {
        let text = simd_json::to_string(body)
            .map_err(|e| BridgeError::Platform(format!("请求序列化失败: {}", e)))?;
        Ok(req.header(CONTENT_TYPE, "application/json").body(text))
    }
}

// ================= 请求 / 响应结构 =================

#[derive(Deserialize)]
struct RawGuild {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    approximate_member_count: Option<u32>,
    #[serde(default)]
    max_members: Option<u32>,
}

impl From<RawGuild> for GuildInfo {
    fn from(g: RawGuild) -> Self {
        GuildInfo {
            id: g.id,
            name: g.name,
            description: g.description.unwrap_or_default(),
            member_count: g.approximate_member_count.unwrap_or(0),
            max_members: g.max_members.unwrap_or(0),
            joined_at: 0,
        }
    }
}

#[derive(Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Deserialize)]
struct RawId {
    id: String,
}

#[derive(Serialize)]
struct MessageBody {
    #[serde(skip_serializing_if = "String::is_empty")]
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    components: Vec<ComponentRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_reference: Option<MessageReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
}

#[derive(Serialize)]
struct Embed {
    image: EmbedImage,
}

#[derive(Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Serialize)]
struct MessageReference {
    message_id: String,
    fail_if_not_exists: bool,
}

#[derive(Serialize)]
struct ComponentRow {
    #[serde(rename = "type")]
    kind: u8,
    components: Vec<ButtonComponent>,
}

#[derive(Serialize)]
struct ButtonComponent {
    #[serde(rename = "type")]
    kind: u8,
    style: u8,
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    emoji: Emoji,
}

#[derive(Serialize)]
struct Emoji {
    name: &'static str,
}

#[derive(Serialize)]
struct DirectChannelBody<'a> {
    recipient_id: &'a str,
}

fn to_component(b: &Button) -> ButtonComponent {
    let (style, custom_id, url) = match &b.action {
        // 5: 链接按钮 / 1: 普通按钮
        ButtonAction::Link(u) => (5, None, Some(u.clone())),
        ButtonAction::Callback(id) => (1, Some(id.clone()), None),
    };
    ButtonComponent {
        kind: 2,
        style,
        label: b.label.clone(),
        custom_id,
        url,
        emoji: Emoji { name: BUTTON_EMOJI },
    }
}

fn message_body(msg: &OutgoingMessage) -> MessageBody {
    MessageBody {
        content: msg.content.clone(),
        embeds: msg
            .image_urls
            .iter()
            .map(|u| Embed {
                image: EmbedImage { url: u.clone() },
            })
            .collect(),
        components: msg
            .button_rows
            .iter()
            .map(|row| ComponentRow {
                kind: 1,
                components: row.iter().map(to_component).collect(),
            })
            .collect(),
        message_reference: msg.reply_to.as_ref().map(|id| MessageReference {
            message_id: id.clone(),
            fail_if_not_exists: false,
        }),
        // 同一条消息的多次回复用序号区分
        nonce: msg
            .reply_to
            .as_ref()
            .map(|id| format!("{}-{}", id, msg.sequence)),
    }
}

// ================= Platform 实现 =================

impl Platform for RestPlatform {
    fn name(&self) -> &str {
        "rest"
    }

    fn current_user(&self) -> BoxFuture<'_, BridgeResult<NativeUser>> {
        Box::pin(async move {
            let raw: RawUser = self.call(self.request(Method::GET, "/users/@me")).await?;
            Ok(NativeUser {
                id: raw.id,
                username: raw.username,
                bot: raw.bot,
            })
        })
    }

    fn resolve_guild(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<GuildInfo>> {
        Box::pin(async move {
            let req = self
                .request(Method::GET, &format!("/guilds/{}", guild_id))
                .query(&[("with_counts", "true")]);
            let raw: RawGuild = self.call(req).await?;
            Ok(raw.into())
        })
    }

    fn list_user_guilds(
        &self,
        limit: u32,
        before: Option<String>,
        after: Option<String>,
    ) -> BoxFuture<'_, BridgeResult<Vec<GuildInfo>>> {
        Box::pin(async move {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(b) = before {
                query.push(("before", b));
            }
            if let Some(a) = after {
                query.push(("after", a));
            }
            let req = self.request(Method::GET, "/users/@me/guilds").query(&query);
            let raw: Vec<RawGuild> = self.call(req).await?;
            Ok(raw.into_iter().map(GuildInfo::from).collect())
        })
    }

    fn list_guild_channels(&self, guild_id: String) -> BoxFuture<'_, BridgeResult<Vec<ChannelInfo>>> {
        Box::pin(async move {
            let req = self.request(Method::GET, &format!("/guilds/{}/channels", guild_id));
            let raw: Vec<RawChannel> = self.call(req).await?;
            Ok(raw
                .into_iter()
                .map(|c| ChannelInfo {
                    id: c.id,
                    name: c.name.unwrap_or_default(),
                })
                .collect())
        })
    }

    fn send_channel_message(
        &self,
        channel_id: String,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, BridgeResult<SendAck>> {
        Box::pin(async move {
            let path = format!("/channels/{}/messages", channel_id);
            let body = message_body(&message);

            let req = if message.files.is_empty() {
                Self::json_body(self.request(Method::POST, &path), &body)?
            } else {
                let payload = simd_json::to_string(&body)
                    .map_err(|e| BridgeError::Platform(format!("请求序列化失败: {}", e)))?;
                let mut form = Form::new().text("payload_json", payload);
                for (i, file) in message.files.into_iter().enumerate() {
                    let part = Part::bytes(file.data).file_name(file.name);
                    form = form.part(format!("files[{}]", i), part);
                }
                self.request(Method::POST, &path).multipart(form)
            };

            let raw: RawId = self.call(req).await?;
            debug!(target: "Platform", "已发送到频道 {} (消息 {})", channel_id, raw.id);
            Ok(SendAck { message_id: raw.id })
        })
    }

    fn create_direct_channel(&self, user_id: String) -> BoxFuture<'_, BridgeResult<String>> {
        Box::pin(async move {
            let req = Self::json_body(
                self.request(Method::POST, "/users/@me/channels"),
                &DirectChannelBody {
                    recipient_id: &user_id,
                },
            )?;
            let raw: RawId = self.call(req).await?;
            Ok(raw.id)
        })
    }

    fn add_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            let path = format!("/guilds/{}/members/{}/roles/{}", guild_id, user_id, role_id);
            self.call_empty(self.request(Method::PUT, &path)).await
        })
    }

    fn remove_member_role(
        &self,
        guild_id: String,
        user_id: String,
        role_id: String,
    ) -> BoxFuture<'_, BridgeResult<()>> {
        Box::pin(async move {
            let path = format!("/guilds/{}/members/{}/roles/{}", guild_id, user_id, role_id);
            self.call_empty(self.request(Method::DELETE, &path)).await
        })
    }
}
