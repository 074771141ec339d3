//! 身份映射存储
//!
//! 把平台的字符串 id 映射成 OneBot 端使用的 64 位整数 id，并附带一个按真实 id
//! 存放的属性表 (所属服务器 / 会话类型 等)。
//!
//! 普通模式下一个真实 id 对应一个虚拟 id；pro 模式下以 (频道, 用户) 这一对
//! 真实 id 为键，多个真实组合可以被绑定到同一个虚拟组合上。

use crate::error::{BridgeError, BridgeResult};
use crate::{debug, info, warn};
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Schema, TransactionTrait,
};
use tokio::sync::Mutex as AsyncMutex;

pub mod entity;

use entity::{attribute, forward, pair_forward, pair_reverse, reverse};

/// 哈希模式下换盐重试的上限
const MAX_ALLOC_ATTEMPTS: u32 = 64;

/// 哈希结果落在 10 位数区间
const HASH_FLOOR: u64 = 1_000_000_000;
const HASH_SPAN: u64 = 9_000_000_000;

// ===== 常用属性名 =====
pub const ATTR_GUILD_ID: &str = "guild_id";
pub const ATTR_CHANNEL_ID: &str = "channel_id";
pub const ATTR_TYPE: &str = "type";

/// 虚拟 id 分配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// md5(真实 id)，重启后结果稳定
    Hash,
    /// 当前最大值 + 1
    Counter,
}

pub struct IdentityStore {
    db: DatabaseConnection,
    mode: AllocMode,
    // 普通映射与组合映射各自一把写锁，读操作不加锁
    basic_lock: AsyncMutex<()>,
    pair_lock: AsyncMutex<()>,
}

impl IdentityStore {
    pub fn new(db: DatabaseConnection, mode: AllocMode) -> Self {
        Self {
            db,
            mode,
            basic_lock: AsyncMutex::new(()),
            pair_lock: AsyncMutex::new(()),
        }
    }

    pub fn mode(&self) -> AllocMode {
        self.mode
    }

    /// 建表 (已存在则跳过)
    pub async fn init_schema(&self) -> BridgeResult<()> {
        create_table(&self.db, forward::Entity).await?;
        create_table(&self.db, reverse::Entity).await?;
        create_table(&self.db, pair_forward::Entity).await?;
        create_table(&self.db, pair_reverse::Entity).await?;
        create_table(&self.db, attribute::Entity).await?;
        info!(target: "IdMap", "映射表就绪 (分配方式: {:?})", self.mode);
        Ok(())
    }

    // ================== 普通映射 ==================

    /// 只查询，不分配
    pub async fn lookup_synthetic(&self, native_id: &str) -> BridgeResult<Option<i64>> {
        let row = forward::Entity::find_by_id(native_id.to_string())
            .one(&self.db)
            .await?;
        Ok(row.map(|r| r.synthetic_id))
    }

    /// 获取真实 id 对应的虚拟 id，不存在时分配一个新的并落库
    pub async fn store_or_get(&self, native_id: &str) -> BridgeResult<i64> {
        if let Some(id) = self.lookup_synthetic(native_id).await? {
            return Ok(id);
        }

        let _guard = self.basic_lock.lock().await;

        // 等锁期间可能已被其他任务写入
        if let Some(id) = self.lookup_synthetic(native_id).await? {
            return Ok(id);
        }

        let txn = self.db.begin().await?;
        let synthetic_id = self.allocate(&txn, native_id).await?;

        forward::Entity::insert(forward::ActiveModel {
            native_id: Set(native_id.to_string()),
            synthetic_id: Set(synthetic_id),
        })
        .exec_without_returning(&txn)
        .await?;

        reverse::Entity::insert(reverse::ActiveModel {
            synthetic_id: Set(synthetic_id),
            native_id: Set(native_id.to_string()),
            rebound_from: Set(None),
        })
        .exec_without_returning(&txn)
        .await?;

        txn.commit().await?;

        debug!(target: "IdMap", "新映射 {} -> {}", native_id, synthetic_id);
        Ok(synthetic_id)
    }

    pub async fn resolve_native(&self, synthetic_id: i64) -> BridgeResult<String> {
        reverse::Entity::find_by_id(synthetic_id)
            .one(&self.db)
            .await?
            .map(|r| r.native_id)
            .ok_or_else(|| BridgeError::NotFound(format!("虚拟 id {}", synthetic_id)))
    }

    /// 把当前指向 old 的真实 id 改为指向 new
    pub async fn rebind(&self, old: i64, new: i64) -> BridgeResult<()> {
        check_target(new)?;
        let _guard = self.basic_lock.lock().await;
        let txn = self.db.begin().await?;

        let Some(old_row) = reverse::Entity::find_by_id(old).one(&txn).await? else {
            // 同样的绑定重复执行
            if let Some(row) = reverse::Entity::find_by_id(new).one(&txn).await?
                && row.rebound_from == Some(old)
            {
                return Ok(());
            }
            return Err(BridgeError::InvalidArgument(format!(
                "虚拟值 {} 没有对应的真实值",
                old
            )));
        };

        if old == new {
            return Ok(());
        }

        if let Some(occupant) = reverse::Entity::find_by_id(new).one(&txn).await?
            && occupant.native_id != old_row.native_id
        {
            return Err(BridgeError::InvalidArgument(format!(
                "虚拟值 {} 已被 {} 占用",
                new, occupant.native_id
            )));
        }

        forward::Entity::insert(forward::ActiveModel {
            native_id: Set(old_row.native_id.clone()),
            synthetic_id: Set(new),
        })
        .on_conflict(
            OnConflict::column(forward::Column::NativeId)
                .update_column(forward::Column::SyntheticId)
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        reverse::Entity::delete_by_id(old).exec(&txn).await?;

        reverse::Entity::insert(reverse::ActiveModel {
            synthetic_id: Set(new),
            native_id: Set(old_row.native_id.clone()),
            rebound_from: Set(Some(old)),
        })
        .on_conflict(
            OnConflict::column(reverse::Column::SyntheticId)
                .update_columns([reverse::Column::NativeId, reverse::Column::ReboundFrom])
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        txn.commit().await?;

        info!(target: "IdMap", "绑定 {} : {} -> {}", old_row.native_id, old, new);
        Ok(())
    }

    async fn allocate<C: ConnectionTrait>(&self, conn: &C, native_id: &str) -> BridgeResult<i64> {
        match self.mode {
            AllocMode::Hash => {
                for attempt in 0..MAX_ALLOC_ATTEMPTS {
                    let candidate = hashed_id(native_id, attempt);
                    if !is_taken(conn, candidate).await? {
                        return Ok(candidate);
                    }
                    warn!(target: "IdMap", "哈希冲突 {} (第 {} 次)，换盐重试", native_id, attempt + 1);
                }
                Err(exhausted(native_id))
            }
            AllocMode::Counter => {
                let max = reverse::Entity::find()
                    .order_by_desc(reverse::Column::SyntheticId)
                    .one(conn)
                    .await?
                    .map(|r| r.synthetic_id)
                    .unwrap_or(0);
                let mut candidate = max
                    .max(0)
                    .checked_add(1)
                    .ok_or_else(|| exhausted(native_id))?;
                while is_taken(conn, candidate).await? {
                    candidate = candidate.checked_add(1).ok_or_else(|| exhausted(native_id))?;
                }
                Ok(candidate)
            }
        }
    }

    // ================== 组合映射 (pro) ==================

    pub async fn lookup_pair(
        &self,
        container: &str,
        member: &str,
    ) -> BridgeResult<Option<(i64, i64)>> {
        let row = pair_forward::Entity::find_by_id((container.to_string(), member.to_string()))
            .one(&self.db)
            .await?;
        Ok(row.map(|r| (r.container_synthetic, r.member_synthetic)))
    }

    /// 初次出现的组合使用两者各自的普通虚拟 id
    pub async fn store_or_get_pair(&self, container: &str, member: &str) -> BridgeResult<(i64, i64)> {
        if let Some(pair) = self.lookup_pair(container, member).await? {
            return Ok(pair);
        }

        let container_id = self.store_or_get(container).await?;
        let member_id = self.store_or_get(member).await?;

        let _guard = self.pair_lock.lock().await;

        if let Some(pair) = self.lookup_pair(container, member).await? {
            return Ok(pair);
        }

        let now = now_micros();
        let txn = self.db.begin().await?;

        pair_forward::Entity::insert(pair_forward::ActiveModel {
            container_native: Set(container.to_string()),
            member_native: Set(member.to_string()),
            container_synthetic: Set(container_id),
            member_synthetic: Set(member_id),
            bound_at: Set(now),
        })
        .exec_without_returning(&txn)
        .await?;

        // 已有其他真实组合绑定到这里时保留原反向记录
        if pair_reverse::Entity::find_by_id((container_id, member_id))
            .one(&txn)
            .await?
            .is_none()
        {
            pair_reverse::Entity::insert(pair_reverse::ActiveModel {
                container_synthetic: Set(container_id),
                member_synthetic: Set(member_id),
                container_native: Set(container.to_string()),
                member_native: Set(member.to_string()),
                bound_at: Set(now),
                rebound_from_container: Set(None),
                rebound_from_member: Set(None),
            })
            .exec_without_returning(&txn)
            .await?;
        }

        txn.commit().await?;

        debug!(target: "IdMap", "新组合映射 ({}, {}) -> ({}, {})", container, member, container_id, member_id);
        Ok((container_id, member_id))
    }

    pub async fn resolve_pair(&self, container_id: i64, member_id: i64) -> BridgeResult<(String, String)> {
        pair_reverse::Entity::find_by_id((container_id, member_id))
            .one(&self.db)
            .await?
            .map(|r| (r.container_native, r.member_native))
            .ok_or_else(|| {
                BridgeError::NotFound(format!("虚拟组合 ({}, {})", container_id, member_id))
            })
    }

    /// 把所有指向 old 组合的真实组合迁移到 new，反向查询返回最近一次绑定的那一组
    pub async fn rebind_pair(&self, old: (i64, i64), new: (i64, i64)) -> BridgeResult<()> {
        check_target(new.0)?;
        check_target(new.1)?;
        let _guard = self.pair_lock.lock().await;
        let txn = self.db.begin().await?;

        let movers = pair_forward::Entity::find()
            .filter(pair_forward::Column::ContainerSynthetic.eq(old.0))
            .filter(pair_forward::Column::MemberSynthetic.eq(old.1))
            .order_by_asc(pair_forward::Column::BoundAt)
            .all(&txn)
            .await?;

        if movers.is_empty() {
            if let Some(row) = pair_reverse::Entity::find_by_id(new).one(&txn).await?
                && row.rebound_from_container == Some(old.0)
                && row.rebound_from_member == Some(old.1)
            {
                return Ok(());
            }
            return Err(BridgeError::InvalidArgument(format!(
                "虚拟组合 ({}, {}) 没有对应的真实值",
                old.0, old.1
            )));
        }

        if old == new {
            return Ok(());
        }

        // 原反向记录指向的组合视为最近绑定的一组
        let current = pair_reverse::Entity::find_by_id(old).one(&txn).await?;
        let latest = current
            .as_ref()
            .and_then(|c| {
                movers.iter().find(|m| {
                    m.container_native == c.container_native && m.member_native == c.member_native
                })
            })
            .or_else(|| movers.last())
            .cloned()
            .ok_or_else(|| BridgeError::InvalidArgument("没有可迁移的组合".to_string()))?;

        let now = now_micros();

        pair_forward::Entity::update_many()
            .col_expr(pair_forward::Column::ContainerSynthetic, Expr::value(new.0))
            .col_expr(pair_forward::Column::MemberSynthetic, Expr::value(new.1))
            .col_expr(pair_forward::Column::BoundAt, Expr::value(now))
            .filter(pair_forward::Column::ContainerSynthetic.eq(old.0))
            .filter(pair_forward::Column::MemberSynthetic.eq(old.1))
            .exec(&txn)
            .await?;

        pair_reverse::Entity::delete_by_id(old).exec(&txn).await?;

        pair_reverse::Entity::insert(pair_reverse::ActiveModel {
            container_synthetic: Set(new.0),
            member_synthetic: Set(new.1),
            container_native: Set(latest.container_native.clone()),
            member_native: Set(latest.member_native.clone()),
            bound_at: Set(now),
            rebound_from_container: Set(Some(old.0)),
            rebound_from_member: Set(Some(old.1)),
        })
        .on_conflict(
            OnConflict::columns([
                pair_reverse::Column::ContainerSynthetic,
                pair_reverse::Column::MemberSynthetic,
            ])
            .update_columns([
                pair_reverse::Column::ContainerNative,
                pair_reverse::Column::MemberNative,
                pair_reverse::Column::BoundAt,
                pair_reverse::Column::ReboundFromContainer,
                pair_reverse::Column::ReboundFromMember,
            ])
            .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        txn.commit().await?;

        info!(
            target: "IdMap",
            "组合绑定 ({}, {}) -> ({}, {})，共 {} 组",
            old.0, old.1, new.0, new.1, movers.len()
        );
        Ok(())
    }

    // ================== 属性 ==================

    pub async fn read_attribute(&self, subject: &str, key: &str) -> BridgeResult<String> {
        attribute::Entity::find_by_id((subject.to_string(), key.to_string()))
            .one(&self.db)
            .await?
            .map(|r| r.value)
            .ok_or_else(|| BridgeError::NotFound(format!("{} 的属性 {}", subject, key)))
    }

    /// 读属性，NotFound 视为 None，其余错误照常返回
    pub async fn read_attribute_opt(&self, subject: &str, key: &str) -> BridgeResult<Option<String>> {
        match self.read_attribute(subject, key).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_attribute(&self, subject: &str, key: &str, value: &str) -> BridgeResult<()> {
        attribute::Entity::insert(attribute::ActiveModel {
            subject: Set(subject.to_string()),
            field: Set(key.to_string()),
            value: Set(value.to_string()),
        })
        .on_conflict(
            OnConflict::columns([attribute::Column::Subject, attribute::Column::Field])
                .update_column(attribute::Column::Value)
                .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await?;
        Ok(())
    }
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    db.execute(builder.build(schema.create_table_from_entity(entity).if_not_exists()))
        .await?;
    Ok(())
}

fn exhausted(native_id: &str) -> BridgeError {
    BridgeError::Persistence(DbErr::Custom(format!("无法为 {} 分配虚拟 id", native_id)))
}

/// 0 在 OneBot 端表示缺省，负数不会由分配器产生
fn check_target(id: i64) -> BridgeResult<()> {
    if id <= 0 {
        return Err(BridgeError::InvalidArgument(format!("虚拟值 {} 必须为正数", id)));
    }
    Ok(())
}

async fn is_taken<C: ConnectionTrait>(conn: &C, synthetic_id: i64) -> Result<bool, DbErr> {
    Ok(reverse::Entity::find_by_id(synthetic_id)
        .one(conn)
        .await?
        .is_some())
}

/// attempt 为 0 时直接哈希真实 id，之后加盐
fn hashed_id(native_id: &str, attempt: u32) -> i64 {
    let digest = if attempt == 0 {
        md5::compute(native_id.as_bytes())
    } else {
        md5::compute(format!("{}#{}", native_id, attempt).as_bytes())
    };
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    (u64::from_be_bytes(head) % HASH_SPAN + HASH_FLOOR) as i64
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn store(mode: AllocMode) -> IdentityStore {
        let conn = db::memory().await.unwrap();
        let store = IdentityStore::new(conn, mode);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn first_store_is_stable() {
        let store = store(AllocMode::Hash).await;
        let s = store.store_or_get("123456789012345678").await.unwrap();
        let again = store.store_or_get("123456789012345678").await.unwrap();
        assert_eq!(s, again);
        assert_eq!(store.resolve_native(s).await.unwrap(), "123456789012345678");
    }

    #[tokio::test]
    async fn hash_mode_is_deterministic_across_stores() {
        let a = store(AllocMode::Hash).await;
        let b = store(AllocMode::Hash).await;
        assert_eq!(
            a.store_or_get("555").await.unwrap(),
            b.store_or_get("555").await.unwrap()
        );
    }

    #[tokio::test]
    async fn counter_mode_is_monotonic() {
        let store = store(AllocMode::Counter).await;
        assert_eq!(store.store_or_get("a").await.unwrap(), 1);
        assert_eq!(store.store_or_get("b").await.unwrap(), 2);
        assert_eq!(store.store_or_get("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn distinct_natives_never_share_an_id() {
        for mode in [AllocMode::Hash, AllocMode::Counter] {
            let store = store(mode).await;
            let mut seen = HashSet::new();
            for i in 0..200 {
                let id = store.store_or_get(&format!("1000{}", i)).await.unwrap();
                assert!(seen.insert(id), "{:?} 模式下出现重复 id {}", mode, id);
            }
        }
    }

    #[tokio::test]
    async fn hash_collision_falls_through_to_salted_candidate() {
        let store = store(AllocMode::Hash).await;
        // 抢占 "x" 的首选哈希值
        let taken = hashed_id("x", 0);
        let other = store.store_or_get("occupier").await.unwrap();
        store.rebind(other, taken).await.unwrap();

        let id = store.store_or_get("x").await.unwrap();
        assert_ne!(id, taken);
        assert_eq!(id, hashed_id("x", 1));
        assert_eq!(store.resolve_native(taken).await.unwrap(), "occupier");
    }

    #[tokio::test]
    async fn concurrent_first_store_agrees() {
        let store = Arc::new(store(AllocMode::Counter).await);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.store_or_get("shared").await.unwrap() }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn rebind_moves_native_to_new_id() {
        let store = store(AllocMode::Counter).await;
        let a = store.store_or_get("native-a").await.unwrap();

        store.rebind(a, 20).await.unwrap();

        assert_eq!(store.resolve_native(20).await.unwrap(), "native-a");
        assert!(store.resolve_native(a).await.unwrap_err().is_not_found());
        assert_eq!(store.store_or_get("native-a").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn repeated_rebind_is_idempotent() {
        let store = store(AllocMode::Counter).await;
        let a = store.store_or_get("native-a").await.unwrap();
        store.rebind(a, 20).await.unwrap();
        store.rebind(a, 20).await.unwrap();
        assert_eq!(store.resolve_native(20).await.unwrap(), "native-a");
    }

    #[tokio::test]
    async fn rebind_unknown_old_is_invalid() {
        let store = store(AllocMode::Counter).await;
        let err = store.rebind(99, 100).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn rebind_onto_live_id_is_rejected() {
        let store = store(AllocMode::Counter).await;
        let a = store.store_or_get("a").await.unwrap();
        let b = store.store_or_get("b").await.unwrap();
        let err = store.rebind(a, b).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
        assert_eq!(store.resolve_native(a).await.unwrap(), "a");
        assert_eq!(store.resolve_native(b).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn rebind_to_zero_or_negative_is_rejected() {
        let store = store(AllocMode::Counter).await;
        let a = store.store_or_get("a").await.unwrap();
        for target in [0, -5] {
            let err = store.rebind(a, target).await.unwrap_err();
            assert!(matches!(err, BridgeError::InvalidArgument(_)));
        }
        assert_eq!(store.resolve_native(a).await.unwrap(), "a");

        let pair = store.store_or_get_pair("c", "u").await.unwrap();
        let err = store.rebind_pair(pair, (0, 500)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
        assert_eq!(store.lookup_pair("c", "u").await.unwrap(), Some(pair));
    }

    #[tokio::test]
    async fn counter_exhaustion_is_an_error_not_an_overflow() {
        let store = store(AllocMode::Counter).await;
        let a = store.store_or_get("a").await.unwrap();
        store.rebind(a, i64::MAX).await.unwrap();

        let err = store.store_or_get("b").await.unwrap_err();
        assert!(matches!(err, BridgeError::Persistence(_)));
        assert_eq!(store.lookup_synthetic("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn attribute_miss_then_overwrite() {
        let store = store(AllocMode::Hash).await;
        let miss = store.read_attribute("chan", ATTR_GUILD_ID).await.unwrap_err();
        assert!(miss.is_not_found());
        assert_eq!(store.read_attribute_opt("chan", ATTR_GUILD_ID).await.unwrap(), None);

        store.write_attribute("chan", ATTR_GUILD_ID, "g1").await.unwrap();
        store.write_attribute("chan", ATTR_GUILD_ID, "g2").await.unwrap();
        assert_eq!(store.read_attribute("chan", ATTR_GUILD_ID).await.unwrap(), "g2");
    }

    #[tokio::test]
    async fn pair_defaults_to_basic_ids() {
        let store = store(AllocMode::Counter).await;
        let pair = store.store_or_get_pair("chan", "user").await.unwrap();
        assert_eq!(pair.0, store.store_or_get("chan").await.unwrap());
        assert_eq!(pair.1, store.store_or_get("user").await.unwrap());
        assert_eq!(store.store_or_get_pair("chan", "user").await.unwrap(), pair);
        assert_eq!(
            store.resolve_pair(pair.0, pair.1).await.unwrap(),
            ("chan".to_string(), "user".to_string())
        );
    }

    #[tokio::test]
    async fn pairs_fold_onto_one_virtual_pair_last_bind_wins() {
        let store = store(AllocMode::Counter).await;
        let first = store.store_or_get_pair("c1", "u1").await.unwrap();
        let second = store.store_or_get_pair("c2", "u2").await.unwrap();

        store.rebind_pair(first, (100, 200)).await.unwrap();
        assert_eq!(
            store.resolve_pair(100, 200).await.unwrap(),
            ("c1".to_string(), "u1".to_string())
        );

        store.rebind_pair(second, (100, 200)).await.unwrap();
        assert_eq!(
            store.resolve_pair(100, 200).await.unwrap(),
            ("c2".to_string(), "u2".to_string())
        );

        // 两个真实组合都指向同一虚拟组合
        assert_eq!(store.lookup_pair("c1", "u1").await.unwrap(), Some((100, 200)));
        assert_eq!(store.lookup_pair("c2", "u2").await.unwrap(), Some((100, 200)));
        assert!(store.resolve_pair(first.0, first.1).await.unwrap_err().is_not_found());

        // 重复执行不报错
        store.rebind_pair(second, (100, 200)).await.unwrap();
    }
}
