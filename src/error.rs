use sea_orm::DbErr;
use thiserror::Error;

/// 桥接层统一错误类型
#[derive(Debug, Error)]
pub enum BridgeError {
    /// 映射或属性不存在，调用方应当视为“未知”继续下一步
    #[error("未找到: {0}")]
    NotFound(String),

    /// 指令格式错误 / 参数不是数字 / 参数个数不对
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 单个消息段无法转换，仅丢弃该段
    #[error("消息段已跳过: {0}")]
    TranscodeSkippable(String),

    #[error("存储失败: {0}")]
    Persistence(#[from] DbErr),

    /// 类型探测 4 次全部失败
    #[error("无法确定会话类型 (id: {0})")]
    ExhaustedRetries(i64),

    #[error("平台调用失败: {0}")]
    Platform(String),

    #[error("推送失败: {0}")]
    Transport(String),
}

impl BridgeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Platform(e.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
