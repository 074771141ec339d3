//! 把分类后的载荷渲染为平台消息
//!
//! 单个条目失败 (文件读不到 / base64 损坏 / 下载失败) 只记录警告并跳过。

use super::markdown::{self, MarkdownDoc};
use super::outbound::{MediaSource, OutboundParts};
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::IdentityStore;
use crate::platform::{OutgoingFile, OutgoingMessage};
use crate::warn;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use tokio::fs;

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// 图片链接先下载再上传
    pub url_pic_transfer: bool,
}

pub struct Renderer {
    store: Arc<IdentityStore>,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Copy)]
enum MediaKind {
    Image,
    Record,
    Video,
}

impl MediaKind {
    fn file_name(&self, index: usize) -> String {
        match self {
            MediaKind::Image => format!("image{}.png", index),
            MediaKind::Record => format!("voice{}.mp3", index),
            MediaKind::Video => format!("video{}.mp4", index),
        }
    }
}

impl Renderer {
    pub fn new(store: Arc<IdentityStore>, http: reqwest::Client) -> Self {
        Self { store, http }
    }

    pub async fn render(&self, parts: OutboundParts, opts: RenderOptions) -> OutgoingMessage {
        let mut out = OutgoingMessage::default();

        // @ 放在正文最前
        let mut prefix = String::new();
        for qq in &parts.mentions {
            match self.store.resolve_native(*qq).await {
                Ok(native) => prefix.push_str(&format!("<@{}> ", native)),
                Err(e) => warn!(target: "Transcode", "@{} 无法还原，已跳过: {}", qq, e),
            }
        }
        out.content = format!("{}{}", prefix, parts.text);

        for (i, src) in parts.images.into_iter().enumerate() {
            match src {
                MediaSource::Url(url) if !opts.url_pic_transfer => out.image_urls.push(url),
                MediaSource::Url(url) => match self.download(&url, MediaKind::Image, i).await {
                    Ok(file) => out.files.push(file),
                    Err(e) => {
                        // 下载失败退回引用方式
                        warn!(target: "Transcode", "{}", e);
                        out.image_urls.push(url);
                    }
                },
                other => self.attach(&mut out, other, MediaKind::Image, i).await,
            }
        }

        for (i, src) in parts.records.into_iter().enumerate() {
            match src {
                MediaSource::Url(url) if !opts.url_pic_transfer => push_line(&mut out.content, &url),
                MediaSource::Url(url) => match self.download(&url, MediaKind::Record, i).await {
                    Ok(file) => out.files.push(file),
                    Err(e) => {
                        warn!(target: "Transcode", "{}", e);
                        push_line(&mut out.content, &url);
                    }
                },
                other => self.attach(&mut out, other, MediaKind::Record, i).await,
            }
        }

        for (i, src) in parts.videos.into_iter().enumerate() {
            match src {
                MediaSource::Url(url) => push_line(&mut out.content, &url),
                other => self.attach(&mut out, other, MediaKind::Video, i).await,
            }
        }

        for doc in &parts.markdown {
            let content = self.markdown_content(doc).await;
            if !content.is_empty() {
                out.content.push('\n');
                out.content.push_str(&content);
            }
            out.button_rows.extend(markdown::button_rows(doc));
        }

        for id in &parts.music {
            push_line(
                &mut out.content,
                &format!("https://i.y.qq.com/v8/playsong.html?songid={}", id),
            );
        }

        out.content = out.content.trim().to_string();
        out
    }

    async fn attach(&self, out: &mut OutgoingMessage, src: MediaSource, kind: MediaKind, index: usize) {
        match load(src, kind, index).await {
            Ok(file) => out.files.push(file),
            Err(e) => warn!(target: "Transcode", "{}", e),
        }
    }

    async fn download(&self, url: &str, kind: MediaKind, index: usize) -> BridgeResult<OutgoingFile> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BridgeError::TranscodeSkippable(format!("下载 {} 失败: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(BridgeError::TranscodeSkippable(format!(
                "下载 {} 失败: HTTP {}",
                url,
                resp.status()
            )));
        }
        let data = resp
            .bytes()
            .await
            .map_err(|e| BridgeError::TranscodeSkippable(format!("读取 {} 失败: {}", url, e)))?;
        Ok(OutgoingFile {
            name: kind.file_name(index),
            data: data.to_vec(),
        })
    }

    /// 正文中的 at 标签按虚拟 id 还原为平台 @
    async fn markdown_content(&self, doc: &MarkdownDoc) -> String {
        let content = markdown::convert_cmd_inputs(&doc.markdown.content);

        let ids: Vec<String> = markdown::at_user_regex()
            .captures_iter(&content)
            .map(|c| c[1].to_string())
            .collect();

        let mut content = content;
        for id in ids {
            let native = match id.parse::<i64>() {
                Ok(qq) => self.store.resolve_native(qq).await.unwrap_or_else(|_| id.clone()),
                Err(_) => id.clone(),
            };
            let tag = markdown::at_user_regex();
            // 每次替换第一个匹配，顺序与收集时一致
            content = tag.replacen(&content, 1, format!("<@{}>", native)).into_owned();
        }
        content
    }
}

async fn load(src: MediaSource, kind: MediaKind, index: usize) -> BridgeResult<OutgoingFile> {
    let data = match src {
        MediaSource::LocalFile(path) => fs::read(&path).await.map_err(|e| {
            BridgeError::TranscodeSkippable(format!("读取本地文件 {} 失败: {}", path.display(), e))
        })?,
        MediaSource::Base64(b64) => STANDARD
            .decode(b64.trim())
            .map_err(|e| BridgeError::TranscodeSkippable(format!("base64 解码失败: {}", e)))?,
        MediaSource::Url(url) => {
            return Err(BridgeError::TranscodeSkippable(format!("{} 需要下载", url)));
        }
    };
    Ok(OutgoingFile {
        name: kind.file_name(index),
        data,
    })
}

fn push_line(content: &mut String, line: &str) {
    if !content.is_empty() {
        content.push('\n');
    }
    content.push_str(line);
}
