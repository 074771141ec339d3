//! markdown 卡片 (正文 + 按钮键盘)

use crate::error::{BridgeError, BridgeResult};
use crate::message::unescape;
use crate::platform::{Button, ButtonAction};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkdownDoc {
    #[serde(default)]
    pub markdown: MarkdownBody,
    #[serde(default)]
    pub keyboard: Keyboard,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkdownBody {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Keyboard {
    #[serde(default)]
    pub content: KeyboardContent,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KeyboardContent {
    #[serde(default)]
    pub rows: Vec<KeyboardRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KeyboardRow {
    #[serde(default)]
    pub buttons: Vec<KeyboardButton>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KeyboardButton {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub render_data: RenderData,
    #[serde(default)]
    pub action: ButtonActionSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RenderData {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub visited_label: String,
    #[serde(default)]
    pub style: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ButtonActionSpec {
    /// 0 跳转链接 / 1 回调 / 2 指令
    #[serde(rename = "type", default = "default_action_type")]
    pub kind: i32,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub permission: Permission,
}

impl Default for ButtonActionSpec {
    fn default() -> Self {
        Self {
            kind: default_action_type(),
            data: String::new(),
            enter: false,
            permission: Permission::default(),
        }
    }
}

fn default_action_type() -> i32 {
    2
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Permission {
    #[serde(rename = "type", default)]
    pub kind: i32,
}

fn skippable(what: &str, e: impl std::fmt::Display) -> BridgeError {
    BridgeError::TranscodeSkippable(format!("{}: {}", what, e))
}

/// base64 编码的 JSON 文档
pub fn decode_base64(b64: &str) -> BridgeResult<MarkdownDoc> {
    let raw = STANDARD
        .decode(b64.trim())
        .map_err(|e| skippable("markdown base64 无效", e))?;
    serde_json::from_slice(&raw).map_err(|e| skippable("markdown JSON 无效", e))
}

/// markdown 段的 data 字段: 对象 / `base64://...` / 转义过的 JSON 字符串
pub fn from_segment_data(data: &Map<String, Value>) -> BridgeResult<MarkdownDoc> {
    match data.get("data") {
        Some(Value::Object(obj)) => serde_json::from_value(Value::Object(obj.clone()))
            .map_err(|e| skippable("markdown 结构无效", e)),
        Some(Value::String(s)) => match s.strip_prefix("base64://") {
            Some(b64) => decode_base64(b64),
            None => serde_json::from_str(&unescape(s)).map_err(|e| skippable("markdown JSON 无效", e)),
        },
        Some(other) => Err(skippable("markdown data 类型不支持", other)),
        None => match data.get("content").and_then(Value::as_str) {
            // 只有正文的简写
            Some(content) => Ok(MarkdownDoc {
                markdown: MarkdownBody {
                    content: content.to_string(),
                },
                keyboard: Keyboard::default(),
            }),
            None => Err(skippable("markdown 段", "缺少 data")),
        },
    }
}

static CMD_INPUT_REGEX: OnceLock<Regex> = OnceLock::new();
static AT_USER_REGEX: OnceLock<Regex> = OnceLock::new();

fn cmd_input_regex() -> &'static Regex {
    CMD_INPUT_REGEX.get_or_init(|| {
        Regex::new(r#"<qqbot-cmd-input\s+text="([^"]*)"[^>]*?/?>"#).expect("Invalid Regex")
    })
}

pub fn at_user_regex() -> &'static Regex {
    AT_USER_REGEX
        .get_or_init(|| Regex::new(r#"<qqbot-at-user\s+id="(\d+)"\s*/?>"#).expect("Invalid Regex"))
}

/// 把指令输入标签转成粗体，at 标签由调用方替换
pub fn convert_cmd_inputs(content: &str) -> String {
    cmd_input_regex().replace_all(content, "**$1**").into_owned()
}

/// 键盘转为按钮行
pub fn button_rows(doc: &MarkdownDoc) -> Vec<Vec<Button>> {
    doc.keyboard
        .content
        .rows
        .iter()
        .map(|row| row.buttons.iter().filter_map(to_button).collect::<Vec<_>>())
        .filter(|row| !row.is_empty())
        .collect()
}

fn to_button(b: &KeyboardButton) -> Option<Button> {
    let label = if b.render_data.label.is_empty() {
        b.action.data.clone()
    } else {
        b.render_data.label.clone()
    };
    if label.is_empty() {
        return None;
    }

    let data = b.action.data.trim();
    let is_url = data.starts_with("http://") || data.starts_with("https://");
    let action = if b.action.kind == 0 || is_url {
        if !is_url {
            return None;
        }
        ButtonAction::Link(data.to_string())
    } else {
        let id = if b.id.is_empty() { data } else { b.id.as_str() };
        ButtonAction::Callback(id.to_string())
    };

    Some(Button { label, action })
}
