//! 消息转换
//!
//! - 入站: 平台消息 -> OneBot 段数组 / CQ 码字符串 (本文件)
//! - 出站: OneBot 消息 -> 分类后的载荷 (`outbound`) -> 平台消息 (`render`)

use crate::error::BridgeResult;
use crate::idmap::IdentityStore;
use crate::message::{Message, escape_param, escape_text};
use crate::platform::{NativeAttachment, NativeMessage};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub mod markdown;
pub mod outbound;
pub mod render;

static MENTION_REGEX: OnceLock<Regex> = OnceLock::new();

fn mention_regex() -> &'static Regex {
    MENTION_REGEX.get_or_init(|| Regex::new(r"<@!?(\d+)>").expect("Invalid Regex"))
}

/// 入站转换开关
#[derive(Debug, Clone, Default)]
pub struct InboundOptions {
    /// 机器人自身在平台上的 id
    pub bot_native_id: String,
    /// @机器人 时替换成的 qq
    pub app_id: i64,
    pub remove_at: bool,
    pub remove_prefix: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece {
    Mention(i64),
    Text(usize, usize),
}

/// 一次扫描得到的中间结果
#[derive(Debug, Default)]
struct Scanned {
    mentions: Vec<i64>,
    text: String,
    inline: String,
}

async fn scan(
    store: &IdentityStore,
    msg: &NativeMessage,
    opts: &InboundOptions,
) -> BridgeResult<Scanned> {
    let content = msg.content.as_str();

    // 先收集位置，避免跨 await 持有正则迭代器
    let found: Vec<(usize, usize, String)> = mention_regex()
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), whole.end(), caps[1].to_string()))
        })
        .collect();

    let mut pieces = Vec::new();
    let mut last = 0;
    for (start, end, native) in found {
        pieces.push(Piece::Text(last, start));
        last = end;
        if native == opts.bot_native_id {
            if !opts.remove_at {
                pieces.push(Piece::Mention(opts.app_id));
            }
            continue;
        }
        pieces.push(Piece::Mention(store.store_or_get(&native).await?));
    }
    pieces.push(Piece::Text(last, content.len()));

    let mut scanned = Scanned::default();
    for piece in pieces {
        match piece {
            Piece::Text(a, b) => {
                scanned.text.push_str(&content[a..b]);
                scanned.inline.push_str(&escape_text(&content[a..b]));
            }
            Piece::Mention(qq) => {
                scanned.mentions.push(qq);
                scanned.inline.push_str(&format!("[CQ:at,qq={}]", qq));
            }
        }
    }

    // 整条消息只有一个空格时原样保留
    if content == " " {
        return Ok(scanned);
    }

    scanned.text = tidy(&scanned.text, opts.remove_prefix);
    scanned.inline = tidy(&scanned.inline, opts.remove_prefix);
    Ok(scanned)
}

fn tidy(text: &str, remove_prefix: bool) -> String {
    let trimmed = text.trim();
    if remove_prefix {
        trimmed.replacen('/', "", 1).trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn image_attachments(msg: &NativeMessage) -> impl Iterator<Item = &NativeAttachment> {
    msg.attachments.iter().filter(|a| is_image(a))
}

fn is_image(a: &NativeAttachment) -> bool {
    if !a.content_type.is_empty() {
        return a.content_type.starts_with("image");
    }
    let lower = a.filename.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// 附件文件名去掉扩展名后加 `.image`
pub fn image_file_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let cleaned: String = stem
        .chars()
        .filter(|c| !matches!(c, '{' | '}' | '-'))
        .collect();
    format!("{}.image", cleaned)
}

pub fn ensure_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url.trim_start_matches("//"))
    }
}

/// 转为段数组，顺序固定为 @ -> 文本 -> 图片
pub async fn to_segments(
    store: &IdentityStore,
    msg: &NativeMessage,
    opts: &InboundOptions,
) -> BridgeResult<Message> {
    let scanned = scan(store, msg, opts).await?;

    let mut out = Message::new();
    for qq in scanned.mentions {
        out = out.at(qq);
    }
    if !scanned.text.is_empty() {
        out = out.text(scanned.text);
    }
    for a in image_attachments(msg) {
        out = out.image(image_file_name(&a.filename), ensure_scheme(&a.url));
    }
    Ok(out)
}

/// 转为 CQ 码字符串，@ 保留在原位置，图片追加在末尾
pub async fn to_cq_string(
    store: &IdentityStore,
    msg: &NativeMessage,
    opts: &InboundOptions,
) -> BridgeResult<String> {
    let scanned = scan(store, msg, opts).await?;

    let mut out = scanned.inline;
    for a in image_attachments(msg) {
        out.push_str(&format!(
            "[CQ:image,file={},subType=0,url={}]",
            escape_param(&image_file_name(&a.filename)),
            escape_param(&ensure_scheme(&a.url))
        ));
    }
    Ok(out)
}
