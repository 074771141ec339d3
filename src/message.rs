use serde::Serialize;
use serde_json::{Map, Value};

/// 消息段 (Segment)
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Segment {
    #[serde(rename = "type")]
    pub type_: String,
    pub data: Map<String, Value>,
}

impl Segment {
    pub fn new(type_: &str, data: Map<String, Value>) -> Self {
        Self {
            type_: type_.to_string(),
            data,
        }
    }

    /// 从 `{type, data}` 对象解析，缺少 type 时返回 None
    pub fn from_value(v: &Value) -> Option<Self> {
        let type_ = v.get("type")?.as_str()?.to_string();
        let data = v
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self { type_, data })
    }

    /// 读取字段，数字也按字符串返回
    pub fn field(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// 转为 CQ 码，text 段直接输出转义后的文本
    pub fn to_cq(&self) -> String {
        if self.type_ == "text" {
            return escape_text(&self.field("text").unwrap_or_default());
        }
        let mut out = format!("[CQ:{}", self.type_);
        for (k, v) in &self.data {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(',');
            out.push_str(k);
            out.push('=');
            out.push_str(&escape_param(&value));
        }
        out.push(']');
        out
    }
}

/// 消息链 (Message Chain)
#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct Message(Vec<Segment>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, type_: &str, data: Map<String, Value>) -> Self {
        self.0.push(Segment::new(type_, data));
        self
    }

    pub fn push(&mut self, segment: Segment) {
        self.0.push(segment);
    }

    /// 纯文本
    pub fn text(self, text: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("text".into(), Value::from(text.into()));
        self.add("text", data)
    }

    /// @某人 (虚拟 id)
    pub fn at(self, qq: impl ToString) -> Self {
        let mut data = Map::new();
        data.insert("qq".into(), Value::from(qq.to_string()));
        self.add("at", data)
    }

    /// 图片
    /// - `file`: 文件名
    /// - `url`: 下载地址
    pub fn image(self, file: impl Into<String>, url: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("file".into(), Value::from(file.into()));
        data.insert("subType".into(), Value::from("0"));
        data.insert("url".into(), Value::from(url.into()));
        self.add("image", data)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 去掉第一个文本段中首次出现的 prefix
    pub fn strip_text_prefix(&mut self, prefix: &str) {
        let Some(seg) = self.0.iter_mut().find(|s| s.type_ == "text") else {
            return;
        };
        if let Some(Value::String(text)) = seg.data.get_mut("text") {
            *text = text.replacen(prefix, "", 1);
        }
    }

    pub fn to_cq_string(&self) -> String {
        self.0.iter().map(Segment::to_cq).collect()
    }
}

/// OneBot 端发来的 message 字段
///
/// 字符串 (CQ 码) / 段数组 / 单个段对象 三种写法等价，入口处统一转换。
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    PlainText(String),
    SegmentList(Vec<Segment>),
    SingleSegment(Segment),
}

impl MessageContent {
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => Some(MessageContent::PlainText(s.clone())),
            Value::Array(items) => Some(MessageContent::SegmentList(
                items.iter().filter_map(Segment::from_value).collect(),
            )),
            Value::Object(_) => Segment::from_value(v).map(MessageContent::SingleSegment),
            _ => None,
        }
    }

    /// 段视图，纯文本时为空
    pub fn segments(&self) -> &[Segment] {
        match self {
            MessageContent::PlainText(_) => &[],
            MessageContent::SegmentList(list) => list,
            MessageContent::SingleSegment(seg) => std::slice::from_ref(seg),
        }
    }
}

// ================== CQ 码转义 ==================

pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('[', "&#91;")
        .replace(']', "&#93;")
}

pub fn escape_param(s: &str) -> String {
    escape_text(s).replace(',', "&#44;")
}

pub fn unescape(s: &str) -> String {
    s.replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&#44;", ",")
        .replace("&amp;", "&")
}
