//! OneBot v11 线路格式: 动作帧、响应、事件
//!
//! id 字段可能是整数、浮点或数字字符串，在这里统一成 i64，
//! 后续代码不再关心原始写法。

use crate::error::{BridgeError, BridgeResult};
use crate::message::{Message, MessageContent};
use crate::resolver::ActionTarget;
use serde::Serialize;
use serde_json::Value;

// ================= 入站动作 =================

/// 统一 id: 0 与无法解析的值视为缺省
pub fn parse_id(v: &Value) -> Option<i64> {
    let id = match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| u as i64))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (id != 0).then_some(id)
}

/// 平台原生 id (频道 / 服务器) 保持字符串
pub fn parse_native_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionParams {
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub message_type: Option<String>,
    pub message: Option<MessageContent>,
    pub duration: Option<i64>,
}

impl ActionParams {
    fn from_value(v: &Value) -> Self {
        Self {
            group_id: v.get("group_id").and_then(parse_id),
            user_id: v.get("user_id").and_then(parse_id),
            channel_id: v.get("channel_id").and_then(parse_native_id),
            guild_id: v.get("guild_id").and_then(parse_native_id),
            message_type: v
                .get("message_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            message: v.get("message").and_then(MessageContent::from_value),
            duration: v.get("duration").and_then(|d| match d {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }),
        }
    }
}

/// OneBot 客户端发来的 `{action, params, echo}`
#[derive(Debug, Clone)]
pub struct ActionFrame {
    pub action: String,
    pub params: ActionParams,
    /// 原样回传
    pub echo: Option<Value>,
}

impl ActionFrame {
    pub fn parse(bytes: &mut [u8]) -> BridgeResult<Self> {
        let value: Value = simd_json::serde::from_slice(bytes)
            .map_err(|e| BridgeError::InvalidArgument(format!("无法解析动作帧: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(v: &Value) -> BridgeResult<Self> {
        let action = v
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidArgument("缺少 action 字段".to_string()))?
            .to_string();
        let params = v
            .get("params")
            .map(ActionParams::from_value)
            .unwrap_or_default();
        let echo = v.get("echo").filter(|e| !e.is_null()).cloned();
        Ok(Self {
            action,
            params,
            echo,
        })
    }

    /// 用作关联表键的 echo 字符串
    pub fn echo_key(&self) -> Option<String> {
        match self.echo.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn target(&self) -> ActionTarget {
        ActionTarget {
            echo: self.echo_key(),
            group_id: self.params.group_id,
            user_id: self.params.user_id,
        }
    }
}

// ================= 动作响应 =================

#[derive(Debug, Serialize, Clone)]
pub struct ActionResponse {
    pub status: &'static str,
    pub retcode: i64,
    pub data: Value,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

pub const RETCODE_FAILED: i64 = 100;
pub const RETCODE_UNSUPPORTED: i64 = 1404;

impl ActionResponse {
    pub fn ok(data: Value, echo: Option<Value>) -> Self {
        Self {
            status: "ok",
            retcode: 0,
            data,
            message: String::new(),
            echo,
        }
    }

    pub fn failed(retcode: i64, message: impl Into<String>, echo: Option<Value>) -> Self {
        Self {
            status: "failed",
            retcode,
            data: Value::Null,
            message: message.into(),
            echo,
        }
    }
}

// ================= 上报事件 =================

#[derive(Debug, Serialize, Clone, Default)]
pub struct Sender {
    pub nickname: String,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiny_id: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub card: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sex: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub age: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub area: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub level: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// group_id 可按配置输出为数字或字符串
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum IdValue {
    Int(i64),
    Str(String),
}

impl IdValue {
    pub fn new(id: i64, as_string: bool) -> Self {
        if as_string {
            IdValue::Str(id.to_string())
        } else {
            IdValue::Int(id)
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum EventMessage {
    Text(String),
    Segments(Message),
}

#[derive(Debug, Serialize, Clone)]
pub struct MessageEvent {
    pub post_type: &'static str,
    pub message_type: &'static str,
    pub sub_type: &'static str,
    pub self_id: i64,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<IdValue>,
    pub message_id: i64,
    pub message: EventMessage,
    pub raw_message: String,
    pub font: i32,
    pub time: i64,
    pub echo: String,
    pub sender: Sender,
    /// 桥接层识别出的会话类型
    pub real_message_type: &'static str,
}

#[derive(Debug, Serialize, Clone)]
pub struct MetaEvent {
    pub post_type: &'static str,
    pub meta_event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<&'static str>,
    pub self_id: i64,
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl MetaEvent {
    pub fn lifecycle(self_id: i64) -> Self {
        Self {
            post_type: "meta_event",
            meta_event_type: "lifecycle",
            sub_type: Some("connect"),
            self_id,
            time: chrono::Utc::now().timestamp(),
            interval: None,
            status: None,
        }
    }

    pub fn heartbeat(self_id: i64, interval_secs: u64) -> Self {
        Self {
            post_type: "meta_event",
            meta_event_type: "heartbeat",
            sub_type: None,
            self_id,
            time: chrono::Utc::now().timestamp(),
            interval: Some(interval_secs * 1000),
            status: Some(serde_json::json!({"online": true, "good": true})),
        }
    }
}
