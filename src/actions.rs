//! OneBot 动作注册表
//!
//! 每个动作是一个返回 `BoxFuture` 的函数指针，按名字查找后执行，
//! 结果统一包装为 `{status, retcode, data, message, echo}`。

use crate::bridge::Bridge;
use crate::error::BridgeResult;
use crate::onebot::{ActionFrame, ActionResponse, RETCODE_FAILED, RETCODE_UNSUPPORTED};
use crate::{debug, warn};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

pub mod guild;
pub mod send;

pub type ActionHandler = fn(Arc<Bridge>, ActionFrame) -> BoxFuture<'static, BridgeResult<Value>>;

pub struct Action {
    pub name: &'static str,
    pub handler: ActionHandler,
}

static ACTIONS: OnceLock<Vec<Action>> = OnceLock::new();

pub fn get_actions() -> &'static [Action] {
    ACTIONS.get_or_init(|| {
        vec![
            Action {
                name: "send_msg",
                handler: send::send_msg,
            },
            Action {
                name: "send_group_msg",
                handler: send::send_group_msg,
            },
            Action {
                name: "send_private_msg",
                handler: send::send_private_msg,
            },
            Action {
                name: "send_guild_channel_msg",
                handler: send::send_guild_channel_msg,
            },
            Action {
                name: "get_group_info",
                handler: guild::get_group_info,
            },
            Action {
                name: "get_group_list",
                handler: guild::get_group_list,
            },
            Action {
                name: "get_guild_list",
                handler: guild::get_guild_list,
            },
            Action {
                name: "set_group_ban",
                handler: guild::set_group_ban,
            },
            Action {
                name: "get_login_info",
                handler: guild::get_login_info,
            },
        ]
    })
}

pub fn find_action(name: &str) -> Option<&'static Action> {
    get_actions().iter().find(|a| a.name == name)
}

/// 执行一个动作帧，错误不会向外传播，只体现在响应里
pub async fn handle(bridge: Arc<Bridge>, frame: ActionFrame) -> ActionResponse {
    let echo = frame.echo.clone();

    let Some(action) = find_action(&frame.action) else {
        warn!(target: "Action", "不支持的动作: {}", frame.action);
        return ActionResponse::failed(
            RETCODE_UNSUPPORTED,
            format!("不支持的动作 {}", frame.action),
            echo,
        );
    };

    debug!(target: "Action", "执行 {}", action.name);
    match (action.handler)(bridge, frame).await {
        Ok(data) => ActionResponse::ok(data, echo),
        Err(e) => {
            warn!(target: "Action", "{} 执行失败: {}", action.name, e);
            ActionResponse::failed(RETCODE_FAILED, e.to_string(), echo)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestBridge;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_action_is_unsupported() {
        let t = TestBridge::new().await;
        let frame = ActionFrame::from_value(&json!({"action": "reboot", "echo": 5})).unwrap();
        let resp = handle(t.bridge.clone(), frame).await;
        assert_eq!(resp.status, "failed");
        assert_eq!(resp.retcode, RETCODE_UNSUPPORTED);
        assert_eq!(resp.echo, Some(json!(5)));
    }

    #[tokio::test]
    async fn login_info_reports_app_identity() {
        let t = TestBridge::new().await;
        let frame =
            ActionFrame::from_value(&json!({"action": "get_login_info", "echo": "e"})).unwrap();
        let resp = handle(t.bridge.clone(), frame).await;
        assert_eq!(resp.retcode, 0);
        assert_eq!(resp.data["user_id"], json!(12345));
        assert_eq!(resp.echo, Some(json!("e")));
    }

    #[test]
    fn every_action_name_is_unique() {
        let names: std::collections::HashSet<_> = get_actions().iter().map(|a| a.name).collect();
        assert_eq!(names.len(), get_actions().len());
    }
}
