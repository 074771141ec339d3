//! 框架内置指令
//!
//! - `me`: 查看自己的真实值与虚拟值
//! - `bind 旧 新 [旧群 新群]`: 改写虚拟值，需要管理员权限
//! - `unlock`: 频道内发起，机器人私信回复一句问候
//!
//! 没有权限的 bind 会生成一个一次性的临时指令并打印在日志里，
//! 把它放在消息开头即可跳过一次权限检查。

use crate::bridge::Bridge;
use crate::correlation::ConversationType;
use crate::error::{BridgeError, BridgeResult};
use crate::platform::NativeMessage;
use crate::{info, warn};
use regex::Regex;
use std::sync::OnceLock;

const GREETING: &str = "欢迎使用 OneBridge，私信通道已就绪";

static MENTION_REGEX: OnceLock<Regex> = OnceLock::new();

fn mention_regex() -> &'static Regex {
    MENTION_REGEX
        .get_or_init(|| Regex::new(r"\[CQ:at,qq=\d+\]|<@!?\d+>").expect("Invalid Regex"))
}

/// 去掉所有 @ 后的指令文本
pub fn clean_text(text: &str) -> String {
    mention_regex().replace_all(text, "").trim().to_string()
}

/// 一条入站消息的指令上下文
pub struct Invocation<'a> {
    pub msg: &'a NativeMessage,
    pub ty: ConversationType,
    /// 当前群 (频道) 的虚拟值
    pub group_id: i64,
    /// 发送者的虚拟值
    pub user_id: i64,
}

/// 识别并执行指令，返回消息是否被当作指令处理
pub async fn handle(bridge: &Bridge, inv: &Invocation<'_>) -> BridgeResult<bool> {
    let config = bridge.config();
    let text = clean_text(&inv.msg.content);

    if text == "t" {
        let token = bridge.correlation.issue_temporary_command();
        info!(target: "Bind", "临时bind指令: {} 可忽略权限检查1次，或将 master_id 设置为空数组", token);
        return Ok(true);
    }

    let permitted = config.is_master(&inv.msg.author.id, inv.user_id);

    if inv.ty == ConversationType::Guild && text.starts_with(&config.unlock_prefix) {
        bridge
            .reply_text(inv.msg, ConversationType::GuildPrivate, GREETING)
            .await?;
        return Ok(true);
    }

    if text.starts_with(&config.me_prefix) {
        let report = me_report(bridge, inv).await?;
        reply(bridge, inv, &report).await;
        return Ok(true);
    }

    let fields: Vec<&str> = text.split_whitespace().collect();

    if let Some(first) = fields.first()
        && bridge.correlation.consume_temporary_command(first)
    {
        info!(target: "Bind", "{} 使用了临时指令 {}", inv.msg.author.id, first);
        run_bind(bridge, inv, &fields).await;
        return Ok(true);
    }

    if !text.starts_with(&config.bind_prefix) {
        return Ok(false);
    }

    if permitted {
        run_bind(bridge, inv, &fields).await;
    } else {
        let token = bridge.correlation.issue_temporary_command();
        warn!(
            target: "Bind",
            "{} 没有权限，使用临时指令: {} 忽略权限检查，或将 master_id 设置为空数组",
            inv.msg.author.id, token
        );
        reply(bridge, inv, "您没有权限，请配置 config.toml 或查看日志，使用临时指令").await;
    }
    Ok(true)
}

async fn reply(bridge: &Bridge, inv: &Invocation<'_>, text: &str) {
    if let Err(e) = bridge.reply_text(inv.msg, inv.ty, text).await {
        warn!(target: "Bind", "指令回复发送失败: {}", e);
    }
}

async fn me_report(bridge: &Bridge, inv: &Invocation<'_>) -> BridgeResult<String> {
    let config = bridge.config();
    let author = &inv.msg.author.id;

    if config.idmap_pro {
        let (group, user) = bridge
            .store
            .store_or_get_pair(&inv.msg.channel_id, author)
            .await?;
        return Ok(format!(
            "idmaps-pro状态:\n当前真实值(用户)/当前虚拟值(用户) = [{}/{}]\n当前真实值(群/频道)/当前虚拟值(群/频道) = [{}/{}]\nbind 指令: {} 当前虚拟值(用户) 目标虚拟值(用户) [当前虚拟值(群/频道) 目标虚拟值(群/频道)]",
            author, user, inv.msg.channel_id, group, config.bind_prefix
        ));
    }

    let current = bridge.store.store_or_get(author).await?;
    Ok(format!(
        "目前状态:\n当前真实值 {}\n当前虚拟值 {}\nbind指令: {} 当前虚拟值 目标虚拟值",
        author, current, config.bind_prefix
    ))
}

/// 执行 bind 并把结果 (成功或错误原因) 回复到原会话
async fn run_bind(bridge: &Bridge, inv: &Invocation<'_>, fields: &[&str]) {
    let result = if bridge.config().idmap_pro {
        bind_pair(bridge, inv, fields).await
    } else {
        bind_basic(bridge, fields).await
    };

    let text = match result {
        Ok(text) => text,
        Err(e) => {
            warn!(target: "Bind", "bind 失败: {}", e);
            e.to_string()
        }
    };
    reply(bridge, inv, &text).await;
}

fn parse_arg(raw: &str) -> BridgeResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| BridgeError::InvalidArgument(format!("{} 不是有效的虚拟值", raw)))
}

async fn bind_basic(bridge: &Bridge, fields: &[&str]) -> BridgeResult<String> {
    let &[_, old, new] = fields else {
        return Err(BridgeError::InvalidArgument(format!(
            "bind指令参数错误\n正确的格式: {} 当前虚拟值 新虚拟值",
            bridge.config().bind_prefix
        )));
    };
    let (old, new) = (parse_arg(old)?, parse_arg(new)?);

    bridge.store.rebind(old, new).await?;
    let native = bridge.store.resolve_native(new).await?;
    Ok(format!(
        "绑定成功,目前状态:\n当前真实值 {}\n当前虚拟值 {}",
        native, new
    ))
}

/// 群值缺省、为 0 或无法解析时使用当前群
fn group_arg(raw: Option<&&str>, current: i64) -> i64 {
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|v| *v != 0)
        .unwrap_or(current)
}

async fn bind_pair(bridge: &Bridge, inv: &Invocation<'_>, fields: &[&str]) -> BridgeResult<String> {
    if !(3..=5).contains(&fields.len()) || fields.len() == 4 {
        return Err(BridgeError::InvalidArgument(format!(
            "bind指令参数错误\n正确的格式: {} 当前虚拟值(用户) 新虚拟值(用户) [当前虚拟值(群) 新虚拟值(群)]",
            bridge.config().bind_prefix
        )));
    }

    let old_user = parse_arg(fields[1])?;
    let new_user = parse_arg(fields[2])?;
    let old_group = group_arg(fields.get(3), inv.group_id);
    let new_group = group_arg(fields.get(4), old_group);

    // 普通映射尽量一并迁移；目标已被其他用户占用时只折叠组合映射
    if old_user != new_user {
        match bridge.store.rebind(old_user, new_user).await {
            Ok(()) => {}
            Err(BridgeError::InvalidArgument(reason)) => {
                info!(target: "Bind", "普通映射未迁移 ({} -> {}): {}", old_user, new_user, reason);
            }
            Err(e) => return Err(e),
        }
    }
    bridge
        .store
        .rebind_pair((old_group, old_user), (new_group, new_user))
        .await?;

    let (group_native, user_native) = bridge.store.resolve_pair(new_group, new_user).await?;
    Ok(format!(
        "绑定成功,目前状态:\n当前真实值(群) {}\n当前真实值(用户) {}\n当前虚拟值(群) {}\n当前虚拟值(用户) {}",
        group_native, user_native, new_group, new_user
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestBridge, native_message};

    async fn invoke(t: &TestBridge, content: &str) -> bool {
        invoke_as(t, "u1", content).await
    }

    async fn invoke_as(t: &TestBridge, author: &str, content: &str) -> bool {
        let msg = native_message("m1", Some("g1"), "c1", author, content);
        let (group_id, user_id) = if t.bridge.config().idmap_pro {
            t.bridge.store.store_or_get_pair("c1", author).await.unwrap()
        } else {
            (
                t.bridge.store.store_or_get("c1").await.unwrap(),
                t.bridge.store.store_or_get(author).await.unwrap(),
            )
        };
        let inv = Invocation {
            msg: &msg,
            ty: ConversationType::Guild,
            group_id,
            user_id,
        };
        handle(&t.bridge, &inv).await.unwrap()
    }

    fn last_reply(t: &TestBridge) -> String {
        t.platform.sent().last().unwrap().1.content.clone()
    }

    #[test]
    fn mentions_are_stripped_before_matching() {
        assert_eq!(clean_text("[CQ:at,qq=5] /me "), "/me");
        assert_eq!(clean_text("<@!888> /bind 1 2"), "/bind 1 2");
    }

    #[tokio::test]
    async fn bind_then_me_shows_new_virtual_value() {
        let t = TestBridge::new().await;
        let s = &t.bridge.store;
        let ten = s.store_or_get("victim").await.unwrap();
        let twenty = ten + 1000;

        assert!(invoke(&t, &format!("/bind {} {}", ten, twenty)).await);
        assert!(last_reply(&t).starts_with("绑定成功"));
        assert_eq!(s.resolve_native(twenty).await.unwrap(), "victim");
        assert!(s.resolve_native(ten).await.is_err());

        // 调用者自己的虚拟值也能改写后查询
        let me = s.store_or_get("u1").await.unwrap();
        invoke(&t, &format!("/bind {} 20", me)).await;
        invoke(&t, "/me").await;
        assert!(last_reply(&t).contains("当前虚拟值 20"));
    }

    #[tokio::test]
    async fn denied_bind_issues_a_token_that_bypasses_once() {
        let t = TestBridge::with_config(|c| c.master_id = vec!["someone-else".to_string()]).await;
        let victim = t.bridge.store.store_or_get("victim").await.unwrap();

        invoke(&t, &format!("/bind {} 777", victim)).await;
        assert!(last_reply(&t).contains("您没有权限"));
        assert_eq!(t.bridge.store.resolve_native(victim).await.unwrap(), "victim");

        // 直接从关联表取出刚生成的口令
        let token = (0..=255u8)
            .map(|b| format!("{:02x}", b))
            .find(|c| t.bridge.correlation.is_temporary_command(c))
            .unwrap();

        invoke(&t, &format!("{} {} 777", token, victim)).await;
        assert_eq!(t.bridge.store.resolve_native(777).await.unwrap(), "victim");
        assert!(!t.bridge.correlation.is_temporary_command(&token));
    }

    #[tokio::test]
    async fn malformed_bind_replies_with_usage() {
        let t = TestBridge::new().await;
        invoke(&t, "/bind 1").await;
        assert!(last_reply(&t).contains("参数错误"));

        invoke(&t, "/bind abc 2").await;
        assert!(last_reply(&t).contains("不是有效的虚拟值"));
    }

    #[tokio::test]
    async fn unlock_greets_in_private() {
        let t = TestBridge::new().await;
        assert!(invoke(&t, "/unlock").await);
        assert_eq!(t.platform.sent()[0].0, "dm:u1");
    }

    #[tokio::test]
    async fn plain_text_is_not_a_command() {
        let t = TestBridge::new().await;
        assert!(!invoke(&t, "hello there").await);
        assert!(t.platform.sent().is_empty());
    }

    #[tokio::test]
    async fn pro_bind_moves_the_pair() {
        let t = TestBridge::with_config(|c| c.idmap_pro = true).await;
        let (g, u) = t.bridge.store.store_or_get_pair("c1", "u1").await.unwrap();

        invoke(&t, &format!("/bind {} 500 {} 600", u, g)).await;
        assert!(last_reply(&t).starts_with("绑定成功"), "{}", last_reply(&t));
        assert_eq!(
            t.bridge.store.resolve_pair(600, 500).await.unwrap(),
            ("c1".to_string(), "u1".to_string())
        );

        invoke(&t, "/me").await;
        assert!(last_reply(&t).contains("[u1/500]"));
        assert!(last_reply(&t).contains("[c1/600]"));
    }

    #[tokio::test]
    async fn second_user_folds_onto_the_same_pair() {
        let t = TestBridge::with_config(|c| c.idmap_pro = true).await;
        let (g, u1) = t.bridge.store.store_or_get_pair("c1", "u1").await.unwrap();
        let (_, u2) = t.bridge.store.store_or_get_pair("c1", "u2").await.unwrap();

        invoke_as(&t, "u1", &format!("/bind {} 500 {} 600", u1, g)).await;
        assert!(last_reply(&t).starts_with("绑定成功"), "{}", last_reply(&t));

        invoke_as(&t, "u2", &format!("/bind {} 500 {} 600", u2, g)).await;
        assert!(last_reply(&t).starts_with("绑定成功"), "{}", last_reply(&t));

        let s = &t.bridge.store;
        assert_eq!(s.lookup_pair("c1", "u1").await.unwrap(), Some((600, 500)));
        assert_eq!(s.lookup_pair("c1", "u2").await.unwrap(), Some((600, 500)));
        // 反向查询返回最近一次绑定
        assert_eq!(
            s.resolve_pair(600, 500).await.unwrap(),
            ("c1".to_string(), "u2".to_string())
        );
        // 普通映射仍然一对一
        assert_eq!(s.resolve_native(500).await.unwrap(), "u1");
        assert_eq!(s.resolve_native(u2).await.unwrap(), "u2");
    }
}
