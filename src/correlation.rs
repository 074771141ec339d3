//! 运行期关联表 (echo / 回复序号 / 探测次数 / 临时指令 ...)
//!
//! 只是缓存，进程重启后全部丢失也不影响正确性。每张表一把锁，
//! 锁内只做 HashMap 读写。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// 每个会话保留的最近入站消息 id 数量
const LAZY_KEEP: usize = 5;
const LAZY_TTL: Duration = Duration::from_secs(5 * 60);
/// 群列表分页游标的闲置重置时间
const CURSOR_TTL: Duration = Duration::from_secs(5 * 60);

/// 会话类型，决定回复时走哪种平台调用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationType {
    Group,
    GroupPrivate,
    Guild,
    GuildPrivate,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Group => "group",
            ConversationType::GroupPrivate => "group_private",
            ConversationType::Guild => "guild",
            ConversationType::GuildPrivate => "guild_private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group" => Some(ConversationType::Group),
            "group_private" => Some(ConversationType::GroupPrivate),
            "guild" => Some(ConversationType::Guild),
            "guild_private" => Some(ConversationType::GuildPrivate),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct LazyToken {
    token: String,
    seen_at: Instant,
}

/// 频道列表分页游标
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildCursor {
    pub before: Option<String>,
    pub after: Option<String>,
}

struct CursorSlot {
    cursor: GuildCursor,
    touched: Option<Instant>,
}

pub struct CorrelationStore {
    types: Mutex<HashMap<String, ConversationType>>,
    message_tokens: Mutex<HashMap<String, String>>,
    reply_seq: Mutex<HashMap<String, u32>>,
    retry_budgets: Mutex<HashMap<i64, i32>>,
    lazy_tokens: Mutex<HashMap<String, VecDeque<LazyToken>>>,
    temp_commands: Mutex<Vec<String>>,
    guild_cursor: Mutex<CursorSlot>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self {
            types: Mutex::new(HashMap::new()),
            message_tokens: Mutex::new(HashMap::new()),
            reply_seq: Mutex::new(HashMap::new()),
            retry_budgets: Mutex::new(HashMap::new()),
            lazy_tokens: Mutex::new(HashMap::new()),
            temp_commands: Mutex::new(Vec::new()),
            guild_cursor: Mutex::new(CursorSlot {
                cursor: GuildCursor::default(),
                touched: None,
            }),
        }
    }

    // ===== 会话类型 =====

    pub fn get_type(&self, key: &str) -> Option<ConversationType> {
        lock(&self.types).get(key).copied()
    }

    pub fn set_type(&self, key: &str, ty: ConversationType) {
        lock(&self.types).insert(key.to_string(), ty);
    }

    pub fn clear_type(&self, key: &str) {
        lock(&self.types).remove(key);
    }

    // ===== 消息 id =====

    pub fn message_token(&self, key: &str) -> Option<String> {
        lock(&self.message_tokens).get(key).cloned()
    }

    pub fn remember_message_token(&self, key: &str, message_id: &str) {
        lock(&self.message_tokens).insert(key.to_string(), message_id.to_string());
    }

    // ===== 回复序号 =====

    pub fn reply_sequence(&self, token: &str) -> u32 {
        lock(&self.reply_seq).get(token).copied().unwrap_or(0)
    }

    /// 自增并返回新值，同一 token 的并发回复拿到的序号互不相同
    pub fn bump_reply_sequence(&self, token: &str) -> u32 {
        let mut table = lock(&self.reply_seq);
        let seq = table.entry(token.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    // ===== 探测次数 =====

    pub fn retry_budget(&self, id: i64) -> Option<i32> {
        lock(&self.retry_budgets).get(&id).copied()
    }

    pub fn set_retry_budget(&self, id: i64, budget: i32) {
        lock(&self.retry_budgets).insert(id, budget);
    }

    /// 减一并返回剩余次数，降到 0 时移除条目
    pub fn decrement_retry_budget(&self, id: i64) -> i32 {
        let mut table = lock(&self.retry_budgets);
        let remaining = match table.get_mut(&id) {
            Some(budget) => {
                *budget -= 1;
                *budget
            }
            None => 0,
        };
        if remaining <= 0 {
            table.remove(&id);
        }
        remaining
    }

    pub fn clear_retry_budget(&self, id: i64) {
        lock(&self.retry_budgets).remove(&id);
    }

    // ===== 懒回复 =====

    pub fn remember_last_inbound_token(&self, conversation: &str, token: &str) {
        let mut table = lock(&self.lazy_tokens);
        let ring = table.entry(conversation.to_string()).or_default();
        ring.push_back(LazyToken {
            token: token.to_string(),
            seen_at: Instant::now(),
        });
        while ring.len() > LAZY_KEEP {
            ring.pop_front();
        }
    }

    /// 最近一条未过期的入站消息 id
    pub fn last_inbound_token(&self, conversation: &str) -> Option<String> {
        let mut table = lock(&self.lazy_tokens);
        let ring = table.get_mut(conversation)?;
        ring.retain(|t| t.seen_at.elapsed() < LAZY_TTL);
        ring.back().map(|t| t.token.clone())
    }

    // ===== 临时指令 =====

    /// 生成一个 2 位十六进制的一次性指令
    pub fn issue_temporary_command(&self) -> String {
        let token = format!("{:02x}", rand::random::<u8>());
        let mut set = lock(&self.temp_commands);
        if !set.contains(&token) {
            set.push(token.clone());
        }
        token
    }

    pub fn is_temporary_command(&self, token: &str) -> bool {
        lock(&self.temp_commands).iter().any(|t| t == token)
    }

    /// 匹配成功则移除并返回 true
    pub fn consume_temporary_command(&self, token: &str) -> bool {
        let mut set = lock(&self.temp_commands);
        match set.iter().position(|t| t == token) {
            Some(idx) => {
                set.remove(idx);
                true
            }
            None => false,
        }
    }

    // ===== 分页游标 =====

    /// 闲置超过 5 分钟后从头开始
    pub fn guild_cursor(&self) -> GuildCursor {
        let mut slot = lock(&self.guild_cursor);
        if let Some(t) = slot.touched
            && t.elapsed() >= CURSOR_TTL
        {
            slot.cursor = GuildCursor::default();
            slot.touched = None;
        }
        slot.cursor.clone()
    }

    pub fn set_guild_cursor(&self, cursor: GuildCursor) {
        let mut slot = lock(&self.guild_cursor);
        slot.cursor = cursor;
        slot.touched = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn type_names_round_trip() {
        for ty in [
            ConversationType::Group,
            ConversationType::GroupPrivate,
            ConversationType::Guild,
            ConversationType::GuildPrivate,
        ] {
            assert_eq!(ConversationType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ConversationType::parse("channel"), None);
    }

    #[test]
    fn type_memo_can_be_cleared() {
        let store = CorrelationStore::new();
        store.set_type("12345_7", ConversationType::Guild);
        assert_eq!(store.get_type("12345_7"), Some(ConversationType::Guild));
        store.clear_type("12345_7");
        assert_eq!(store.get_type("12345_7"), None);
    }

    #[tokio::test]
    async fn concurrent_bumps_yield_distinct_increasing_sequences() {
        let store = Arc::new(CorrelationStore::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.bump_reply_sequence("msg-1") }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(store.reply_sequence("msg-1"), 64);
        assert_eq!(store.bump_reply_sequence("msg-1"), 65);
    }

    #[test]
    fn retry_budget_counts_down_and_clears() {
        let store = CorrelationStore::new();
        store.set_retry_budget(9, 4);
        assert_eq!(store.decrement_retry_budget(9), 3);
        assert_eq!(store.decrement_retry_budget(9), 2);
        assert_eq!(store.decrement_retry_budget(9), 1);
        assert_eq!(store.decrement_retry_budget(9), 0);
        assert_eq!(store.retry_budget(9), None);
        assert_eq!(store.decrement_retry_budget(9), 0);
    }

    #[test]
    fn temporary_command_is_single_use() {
        let store = CorrelationStore::new();
        let token = store.issue_temporary_command();
        assert_eq!(token.len(), 2);
        assert!(store.is_temporary_command(&token));
        assert!(store.consume_temporary_command(&token));
        assert!(!store.consume_temporary_command(&token));
    }

    #[test]
    fn lazy_token_returns_latest_of_ring() {
        let store = CorrelationStore::new();
        assert_eq!(store.last_inbound_token("chan"), None);
        for i in 0..8 {
            store.remember_last_inbound_token("chan", &format!("m{}", i));
        }
        assert_eq!(store.last_inbound_token("chan").as_deref(), Some("m7"));
    }

    #[test]
    fn guild_cursor_is_kept_between_calls() {
        let store = CorrelationStore::new();
        assert_eq!(store.guild_cursor(), GuildCursor::default());
        store.set_guild_cursor(GuildCursor {
            before: None,
            after: Some("42".to_string()),
        });
        assert_eq!(store.guild_cursor().after.as_deref(), Some("42"));
    }
}
