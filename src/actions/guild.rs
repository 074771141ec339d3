//! 群 / 服务器信息类动作与禁言

use crate::bridge::Bridge;
use crate::correlation::{ConversationType, GuildCursor};
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::{ATTR_GUILD_ID, ATTR_TYPE};
use crate::onebot::{ActionFrame, IdValue};
use crate::platform::GuildInfo;
use crate::{debug, info, warn};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// get_group_list 每页拉取的服务器数
const GROUP_PAGE: u32 = 10;
const GUILD_PAGE: u32 = 50;
/// 未指定 duration 时的禁言时长 (秒)
const DEFAULT_BAN_SECS: i64 = 30 * 60;

#[derive(Debug, Serialize, Clone, PartialEq)]
struct GroupRecord {
    group_id: IdValue,
    group_name: String,
    group_memo: String,
    group_create_time: i64,
    group_level: i32,
    member_count: u32,
    max_member_count: u32,
}

impl GroupRecord {
    fn placeholder(group_id: IdValue) -> Self {
        Self {
            group_id,
            group_name: String::new(),
            group_memo: String::new(),
            group_create_time: 0,
            group_level: 0,
            member_count: 0,
            max_member_count: 0,
        }
    }

    fn from_guild(group_id: IdValue, name: String, guild: &GuildInfo) -> Self {
        Self {
            group_id,
            group_name: name,
            group_memo: guild.description.clone(),
            group_create_time: guild.joined_at,
            group_level: 0,
            member_count: guild.member_count,
            max_member_count: guild.max_members,
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> BridgeResult<Value> {
    serde_json::to_value(v).map_err(|e| BridgeError::Platform(format!("结果序列化失败: {}", e)))
}

fn required(v: Option<i64>, field: &str) -> BridgeResult<i64> {
    v.ok_or_else(|| BridgeError::InvalidArgument(format!("缺少 {}", field)))
}

pub fn get_group_info(
    bridge: Arc<Bridge>,
    frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let group_id = required(frame.params.group_id, "group_id")?;
        let as_string = bridge.config().string_group_id;
        let id_value = IdValue::new(group_id, as_string);

        if bridge.resolver.known_type(&frame.target()).await != Some(ConversationType::Guild) {
            return to_value(&GroupRecord::placeholder(id_value));
        }

        let channel = bridge
            .channel_native(group_id, frame.params.user_id)
            .await?;
        let guild_id = bridge.store.read_attribute(&channel, ATTR_GUILD_ID).await?;
        let guild = bridge.platform.resolve_guild(guild_id).await?;

        to_value(&GroupRecord::from_guild(id_value, guild.name.clone(), &guild))
    })
}

/// 分页列出服务器及其频道
///
/// 每个服务器输出一个 `*名称` 的伪群，随后是它的每个频道；
/// 游标保存在关联表里，下次调用接着上次的位置。
pub fn get_group_list(
    bridge: Arc<Bridge>,
    _frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let as_string = bridge.config().string_group_id;
        let cursor = bridge.correlation.guild_cursor();
        let guilds = bridge
            .platform
            .list_user_guilds(GROUP_PAGE, cursor.before.clone(), cursor.after.clone())
            .await?;

        let mut groups = Vec::new();
        for guild in &guilds {
            let guild_synthetic = bridge.store.store_or_get(&guild.id).await?;
            groups.push(GroupRecord::from_guild(
                IdValue::new(guild_synthetic, as_string),
                format!("*{}", guild.name),
                guild,
            ));

            let channels = match bridge.platform.list_guild_channels(guild.id.clone()).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(target: "Action", "获取服务器 {} 的频道失败: {}", guild.id, e);
                    continue;
                }
            };

            for channel in channels {
                let synthetic = bridge.store.store_or_get(&channel.id).await?;
                bridge
                    .store
                    .write_attribute(&channel.id, ATTR_GUILD_ID, &guild.id)
                    .await?;
                // 平台给出的层级关系，可以直接确定类型
                bridge
                    .store
                    .write_attribute(
                        &synthetic.to_string(),
                        ATTR_TYPE,
                        ConversationType::Guild.as_str(),
                    )
                    .await?;
                groups.push(GroupRecord::from_guild(
                    IdValue::new(synthetic, as_string),
                    channel.name,
                    guild,
                ));
            }
        }

        // 不足一页说明已经到底，下次从头开始
        let next = if guilds.len() < GROUP_PAGE as usize {
            GuildCursor::default()
        } else {
            GuildCursor {
                before: None,
                after: guilds.last().map(|g| g.id.clone()),
            }
        };
        bridge.correlation.set_guild_cursor(next);

        debug!(target: "Action", "get_group_list 返回 {} 条", groups.len());
        to_value(&groups)
    })
}

pub fn get_guild_list(
    bridge: Arc<Bridge>,
    _frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let guilds = bridge
            .platform
            .list_user_guilds(GUILD_PAGE, None, None)
            .await?;
        let list: Vec<Value> = guilds
            .into_iter()
            .map(|g| {
                json!({
                    "guild_id": g.id,
                    "guild_name": g.name,
                    "guild_display_id": g.id,
                })
            })
            .collect();
        Ok(Value::Array(list))
    })
}

/// 通过给成员加一个禁言角色实现，duration 秒后移除
pub fn set_group_ban(
    bridge: Arc<Bridge>,
    frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let group_id = required(frame.params.group_id, "group_id")?;
        let user_id = required(frame.params.user_id, "user_id")?;
        let duration = frame.params.duration.unwrap_or(DEFAULT_BAN_SECS);

        let role = bridge.config().mute_role_id;
        if role.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "未配置 mute_role_id".to_string(),
            ));
        }

        let channel = bridge.channel_native(group_id, Some(user_id)).await?;
        let guild = bridge.store.read_attribute(&channel, ATTR_GUILD_ID).await?;
        let member = bridge.member_native(user_id, Some(group_id)).await?;

        if duration <= 0 {
            bridge
                .platform
                .remove_member_role(guild, member, role)
                .await?;
            return Ok(Value::Null);
        }

        bridge
            .platform
            .add_member_role(guild.clone(), member.clone(), role.clone())
            .await?;
        info!(target: "Action", "禁言 {} ({}) {} 秒", member, guild, duration);

        let platform = bridge.platform.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration as u64)).await;
            if let Err(e) = platform.remove_member_role(guild, member.clone(), role).await {
                warn!(target: "Action", "解除 {} 的禁言失败: {}", member, e);
            }
        });

        Ok(Value::Null)
    })
}

pub fn get_login_info(
    bridge: Arc<Bridge>,
    _frame: ActionFrame,
) -> BoxFuture<'static, BridgeResult<Value>> {
    Box::pin(async move {
        let config = bridge.config();
        Ok(json!({
            "user_id": config.app_id,
            "nickname": config.bot_name,
        }))
    })
}
