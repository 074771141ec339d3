//! 会话类型解析
//!
//! 出站动作只带有虚拟 user_id / group_id，需要先确定它属于哪种会话，
//! 才能选对平台调用。依次查询:
//! 1. echo 记住的类型
//! 2. `{app_id}_{group_id}` 记住的类型
//! 3. `{app_id}_{user_id}` 记住的类型
//! 4. group_id 的持久化 type 属性
//! 5. user_id 的持久化 type 属性
//!
//! 都查不到时进入探测: 依次假设不同类型实际发送，最多 4 次。

use crate::correlation::{ConversationType, CorrelationStore};
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::{ATTR_TYPE, IdentityStore};
use crate::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// 探测总次数
pub const TRIAL_BUDGET: i32 = 4;

/// 探测顺序，按第几次尝试取下标
const TRIAL_ORDER: [ConversationType; TRIAL_BUDGET as usize] = [
    ConversationType::GroupPrivate,
    ConversationType::GuildPrivate,
    ConversationType::Guild,
    ConversationType::Group,
];

/// 出站动作指向的目标
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionTarget {
    pub echo: Option<String>,
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl ActionTarget {
    /// 探测时以哪个 id 记账: 有 user_id 用 user_id，否则 group_id
    pub fn involved_id(&self) -> Option<i64> {
        self.user_id.or(self.group_id)
    }
}

pub struct TypeResolver {
    store: Arc<IdentityStore>,
    correlation: Arc<CorrelationStore>,
    app_id: i64,
    delay: Duration,
    /// 同一 id 的探测串行执行
    trial_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl TypeResolver {
    pub fn new(
        store: Arc<IdentityStore>,
        correlation: Arc<CorrelationStore>,
        app_id: i64,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            correlation,
            app_id,
            delay,
            trial_locks: Mutex::new(HashMap::new()),
        }
    }

    fn trial_lock(&self, id: i64) -> Arc<AsyncMutex<()>> {
        self.trial_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    /// 没有其他任务在等待时移除该 id 的锁
    fn release_trial_lock(&self, id: i64, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self
            .trial_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // 表里一份 + 手上一份
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&id);
        }
    }

    /// 关联表中的键
    pub fn memo_key(&self, synthetic_id: i64) -> String {
        format!("{}_{}", self.app_id, synthetic_id)
    }

    /// 前 5 步，只读
    pub async fn known_type(&self, target: &ActionTarget) -> Option<ConversationType> {
        if let Some(echo) = &target.echo
            && let Some(ty) = self.correlation.get_type(echo)
        {
            return Some(ty);
        }

        for id in [target.group_id, target.user_id].into_iter().flatten() {
            if let Some(ty) = self.correlation.get_type(&self.memo_key(id)) {
                return Some(ty);
            }
        }

        for id in [target.group_id, target.user_id].into_iter().flatten() {
            match self.store.read_attribute_opt(&id.to_string(), ATTR_TYPE).await {
                Ok(Some(value)) => match ConversationType::parse(&value) {
                    Some(ty) => return Some(ty),
                    None => warn!(target: "Resolver", "{} 的 type 属性无法识别: {}", id, value),
                },
                Ok(None) => {}
                Err(e) => warn!(target: "Resolver", "读取 {} 的 type 属性失败: {}", id, e),
            }
        }

        None
    }

    /// 确定类型后调用 send；类型未知时按探测表逐个尝试
    pub async fn dispatch<T, F, Fut>(&self, target: &ActionTarget, mut send: F) -> BridgeResult<T>
    where
        F: FnMut(ConversationType) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        if let Some(ty) = self.known_type(target).await {
            debug!(target: "Resolver", "{:?} 已知类型 {}", target, ty);
            return send(ty).await;
        }

        let id = target.involved_id().ok_or_else(|| {
            BridgeError::InvalidArgument("缺少 group_id 或 user_id".to_string())
        })?;

        let lock = self.trial_lock(id);
        let result = {
            let _guard = lock.lock().await;
            // 等锁期间前一个探测可能已经得出结果
            match self.known_type(target).await {
                Some(ty) => {
                    debug!(target: "Resolver", "{:?} 等待期间已确定类型 {}", target, ty);
                    send(ty).await
                }
                None => self.trial(id, send).await,
            }
        };
        self.release_trial_lock(id, lock);
        result
    }

    /// 调用方持有该 id 的探测锁；猜测中的类型只在本地，成功后才写入关联表
    async fn trial<T, F, Fut>(&self, id: i64, mut send: F) -> BridgeResult<T>
    where
        F: FnMut(ConversationType) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let key = self.memo_key(id);
        self.correlation.set_retry_budget(id, TRIAL_BUDGET);

        for (attempt, assumed) in TRIAL_ORDER.into_iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(self.delay).await;
            }

            let outcome = send(assumed).await;
            self.correlation.decrement_retry_budget(id);

            match outcome {
                Ok(v) => {
                    self.correlation.set_type(&key, assumed);
                    self.correlation.clear_retry_budget(id);
                    info!(target: "Resolver", "{} 的会话类型探测为 {} (第 {} 次)", id, assumed, attempt + 1);
                    return Ok(v);
                }
                Err(e) => {
                    warn!(target: "Resolver", "{} 按 {} 发送失败: {}", id, assumed, e);
                }
            }
        }

        self.correlation.clear_type(&key);
        self.correlation.clear_retry_budget(id);
        warn!(target: "Resolver", "{} 的会话类型探测失败，已放弃", id);
        Err(BridgeError::ExhaustedRetries(id))
    }
}
