//! OneBot 消息分类
//!
//! 段数组按 type 分类；CQ 码字符串按固定顺序的正则表逐个提取，
//! 提取到的部分从正文中去掉。

use super::markdown::{self, MarkdownDoc};
use crate::message::{MessageContent, Segment, unescape};
use crate::{debug, warn};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

/// 媒体来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    LocalFile(PathBuf),
    Url(String),
    Base64(String),
}

impl MediaSource {
    /// 按 file 字段的前缀判断来源
    pub fn classify(file: &str) -> Option<Self> {
        let file = file.trim();
        if file.is_empty() {
            return None;
        }
        if let Some(b64) = file.strip_prefix("base64://") {
            return Some(MediaSource::Base64(b64.to_string()));
        }
        if file.starts_with("http://") || file.starts_with("https://") {
            return Some(MediaSource::Url(file.to_string()));
        }
        let path = file
            .strip_prefix(LOCAL_FILE_PREFIX)
            .unwrap_or(file);
        Some(MediaSource::LocalFile(PathBuf::from(path)))
    }
}

#[cfg(windows)]
const LOCAL_FILE_PREFIX: &str = "file:///";
#[cfg(not(windows))]
const LOCAL_FILE_PREFIX: &str = "file://";

/// 分类后的出站载荷
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundParts {
    pub text: String,
    pub mentions: Vec<i64>,
    pub images: Vec<MediaSource>,
    pub records: Vec<MediaSource>,
    pub videos: Vec<MediaSource>,
    pub markdown: Vec<MarkdownDoc>,
    pub music: Vec<String>,
}

impl OutboundParts {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self.mentions.is_empty()
            && self.images.is_empty()
            && self.records.is_empty()
            && self.videos.is_empty()
            && self.markdown.is_empty()
            && self.music.is_empty()
    }
}

pub fn parse(content: &MessageContent) -> OutboundParts {
    match content {
        MessageContent::PlainText(s) => parse_cq(s),
        _ => parse_segments(content.segments()),
    }
}

// ================= 段数组 =================

pub fn parse_segments(segments: &[Segment]) -> OutboundParts {
    let mut parts = OutboundParts::default();

    for seg in segments {
        match seg.type_.as_str() {
            "text" => {
                if let Some(t) = seg.field("text") {
                    parts.text.push_str(&t);
                }
            }
            "image" => push_media(&mut parts.images, seg),
            "voice" | "record" => push_media(&mut parts.records, seg),
            "video" => push_media(&mut parts.videos, seg),
            "at" => match seg.field("qq").and_then(|q| q.trim().parse::<i64>().ok()) {
                Some(qq) => parts.mentions.push(qq),
                None => debug!(target: "Transcode", "忽略无效的 at 段: {:?}", seg.data),
            },
            "markdown" => match markdown::from_segment_data(&seg.data) {
                Ok(doc) => parts.markdown.push(doc),
                Err(e) => warn!(target: "Transcode", "{}", e),
            },
            "music" => {
                if seg.field("type").as_deref() == Some("qq")
                    && let Some(id) = seg.field("id")
                {
                    parts.music.push(id);
                } else {
                    warn!(target: "Transcode", "不支持的音乐段: {:?}", seg.data);
                }
            }
            "reply" => {}
            other => warn!(target: "Transcode", "未处理的消息段类型: {}", other),
        }
    }

    parts
}

fn push_media(list: &mut Vec<MediaSource>, seg: &Segment) {
    match seg
        .field("file")
        .or_else(|| seg.field("url"))
        .and_then(|f| MediaSource::classify(&f))
    {
        Some(src) => list.push(src),
        None => warn!(target: "Transcode", "{} 段缺少 file 字段", seg.type_),
    }
}

// ================= CQ 码字符串 =================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    LocalImage,
    HttpImage,
    HttpsImage,
    Base64Image,
    Base64Record,
    LocalRecord,
    HttpRecord,
    HttpsRecord,
    Markdown,
    QqMusic,
    HttpVideo,
    HttpsVideo,
    At,
}

/// 提取顺序固定
const PATTERN_ORDER: [Pattern; 13] = [
    Pattern::LocalImage,
    Pattern::HttpImage,
    Pattern::HttpsImage,
    Pattern::Base64Image,
    Pattern::Base64Record,
    Pattern::LocalRecord,
    Pattern::HttpRecord,
    Pattern::HttpsRecord,
    Pattern::Markdown,
    Pattern::QqMusic,
    Pattern::HttpVideo,
    Pattern::HttpsVideo,
    Pattern::At,
];

impl Pattern {
    fn source(&self) -> String {
        // 值后面可以跟其他参数，例如 subType
        let tail = r"[^\],]+)[^\]]*\]";
        match self {
            Pattern::LocalImage => format!(r"\[CQ:image,file={}({}", LOCAL_FILE_PREFIX, tail),
            Pattern::HttpImage => format!(r"\[CQ:image,file=http://({}", tail),
            Pattern::HttpsImage => format!(r"\[CQ:image,file=https://({}", tail),
            Pattern::Base64Image => format!(r"\[CQ:image,file=base64://({}", tail),
            Pattern::Base64Record => format!(r"\[CQ:record,file=base64://({}", tail),
            Pattern::LocalRecord => format!(r"\[CQ:record,file={}({}", LOCAL_FILE_PREFIX, tail),
            Pattern::HttpRecord => format!(r"\[CQ:record,file=http://({}", tail),
            Pattern::HttpsRecord => format!(r"\[CQ:record,file=https://({}", tail),
            Pattern::Markdown => format!(r"\[CQ:markdown,data=base64://({}", tail),
            Pattern::QqMusic => r"\[CQ:music,type=qq,id=(\d+)[^\]]*\]".to_string(),
            Pattern::HttpVideo => format!(r"\[CQ:video,file=http://({}", tail),
            Pattern::HttpsVideo => format!(r"\[CQ:video,file=https://({}", tail),
            Pattern::At => r"\[CQ:at,qq=(\d+)[^\]]*\]".to_string(),
        }
    }
}

static PATTERNS: OnceLock<Vec<(Pattern, Regex)>> = OnceLock::new();
static LEFTOVER_REGEX: OnceLock<Regex> = OnceLock::new();

fn patterns() -> &'static [(Pattern, Regex)] {
    PATTERNS.get_or_init(|| {
        PATTERN_ORDER
            .iter()
            .map(|p| (*p, Regex::new(&p.source()).expect("Invalid Regex")))
            .collect()
    })
}

fn leftover_regex() -> &'static Regex {
    LEFTOVER_REGEX.get_or_init(|| Regex::new(r"\[CQ:[^\]]*\]").expect("Invalid Regex"))
}

pub fn parse_cq(raw: &str) -> OutboundParts {
    let mut parts = OutboundParts::default();
    let mut text = raw.to_string();

    for (pattern, re) in patterns() {
        let captured: Vec<String> = re
            .captures_iter(&text)
            .map(|caps| unescape(&caps[1]))
            .collect();
        if captured.is_empty() {
            continue;
        }
        text = re.replace_all(&text, "").into_owned();

        for value in captured {
            apply(&mut parts, *pattern, value);
        }
    }

    for code in leftover_regex().find_iter(&text) {
        warn!(target: "Transcode", "未处理的 CQ 码: {}", code.as_str());
    }
    let text = leftover_regex().replace_all(&text, "");

    parts.text = unescape(&text);
    parts
}

fn apply(parts: &mut OutboundParts, pattern: Pattern, value: String) {
    match pattern {
        Pattern::LocalImage => parts.images.push(MediaSource::LocalFile(value.into())),
        Pattern::HttpImage => parts.images.push(MediaSource::Url(format!("http://{}", value))),
        Pattern::HttpsImage => parts.images.push(MediaSource::Url(format!("https://{}", value))),
        Pattern::Base64Image => parts.images.push(MediaSource::Base64(value)),
        Pattern::Base64Record => parts.records.push(MediaSource::Base64(value)),
        Pattern::LocalRecord => parts.records.push(MediaSource::LocalFile(value.into())),
        Pattern::HttpRecord => parts.records.push(MediaSource::Url(format!("http://{}", value))),
        Pattern::HttpsRecord => parts.records.push(MediaSource::Url(format!("https://{}", value))),
        Pattern::Markdown => match markdown::decode_base64(&value) {
            Ok(doc) => parts.markdown.push(doc),
            Err(e) => warn!(target: "Transcode", "{}", e),
        },
        Pattern::QqMusic => parts.music.push(value),
        Pattern::HttpVideo => parts.videos.push(MediaSource::Url(format!("http://{}", value))),
        Pattern::HttpsVideo => parts.videos.push(MediaSource::Url(format!("https://{}", value))),
        Pattern::At => match value.parse::<i64>() {
            Ok(qq) => parts.mentions.push(qq),
            Err(_) => warn!(target: "Transcode", "无效的 at: {}", value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    #[test]
    fn legacy_image_url_is_extracted() {
        let parts = parse(&MessageContent::PlainText(
            "[CQ:image,file=http://x/y.png]hi".to_string(),
        ));
        assert_eq!(parts.images, vec![MediaSource::Url("http://x/y.png".to_string())]);
        assert_eq!(parts.text, "hi");
    }

    #[test]
    fn cq_table_covers_every_kind() {
        let md = STANDARD.encode(r#"{"markdown":{"content":"hello"}}"#);
        let raw = format!(
            "a[CQ:image,file=https://h/i.jpg,subType=0]b[CQ:record,file=base64://AAAA]\
             [CQ:video,file=https://v/m.mp4][CQ:music,type=qq,id=123]\
             [CQ:markdown,data=base64://{}][CQ:at,qq=42]c",
            md
        );
        let parts = parse_cq(&raw);

        assert_eq!(parts.text, "abc");
        assert_eq!(parts.images, vec![MediaSource::Url("https://h/i.jpg".to_string())]);
        assert_eq!(parts.records, vec![MediaSource::Base64("AAAA".to_string())]);
        assert_eq!(parts.videos, vec![MediaSource::Url("https://v/m.mp4".to_string())]);
        assert_eq!(parts.music, vec!["123".to_string()]);
        assert_eq!(parts.mentions, vec![42]);
        assert_eq!(parts.markdown.len(), 1);
        assert_eq!(parts.markdown[0].markdown.content, "hello");
    }

    #[test]
    fn local_file_reference() {
        let raw = format!("[CQ:image,file={}/tmp/a.png]", LOCAL_FILE_PREFIX);
        let parts = parse_cq(&raw);
        assert_eq!(parts.images, vec![MediaSource::LocalFile("/tmp/a.png".into())]);
        assert!(parts.text.is_empty());
    }

    #[test]
    fn unknown_codes_are_dropped_and_text_unescaped() {
        let parts = parse_cq("[CQ:face,id=1]x&#91;1&#93;");
        assert_eq!(parts.text, "x[1]");
        assert!(parts.images.is_empty());
    }

    #[test]
    fn broken_markdown_is_skipped_not_fatal() {
        let parts = parse_cq("[CQ:markdown,data=base64://@@@]ok");
        assert!(parts.markdown.is_empty());
        assert_eq!(parts.text, "ok");
    }

    #[test]
    fn segment_list_is_classified() {
        let value = json!([
            {"type": "at", "data": {"qq": "7"}},
            {"type": "text", "data": {"text": "look "}},
            {"type": "image", "data": {"file": "base64://QUJD"}},
            {"type": "record", "data": {"file": "https://a/b.mp3"}},
            {"type": "face", "data": {"id": "1"}},
            {"type": "text", "data": {"text": "here"}}
        ]);
        let parts = parse(&MessageContent::from_value(&value).unwrap());
        assert_eq!(parts.text, "look here");
        assert_eq!(parts.mentions, vec![7]);
        assert_eq!(parts.images, vec![MediaSource::Base64("QUJD".to_string())]);
        assert_eq!(parts.records, vec![MediaSource::Url("https://a/b.mp3".to_string())]);
    }

    #[test]
    fn single_segment_map_is_accepted() {
        let value = json!({"type": "image", "data": {"file": "http://x/y.png"}});
        let parts = parse(&MessageContent::from_value(&value).unwrap());
        assert_eq!(parts.images, vec![MediaSource::Url("http://x/y.png".to_string())]);
    }

    #[test]
    fn classify_media_prefixes() {
        assert_eq!(
            MediaSource::classify("base64://Zg=="),
            Some(MediaSource::Base64("Zg==".to_string()))
        );
        assert_eq!(
            MediaSource::classify("https://a"),
            Some(MediaSource::Url("https://a".to_string()))
        );
        assert_eq!(
            MediaSource::classify("pic.png"),
            Some(MediaSource::LocalFile("pic.png".into()))
        );
        assert_eq!(MediaSource::classify("  "), None);
    }
}
