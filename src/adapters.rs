use crate::bridge::Bridge;
use futures_util::future::BoxFuture;
use std::sync::{Arc, OnceLock};

pub mod console;
pub mod onebot;

/// 适配器处理函数签名
pub type AdapterHandler = fn(Arc<Bridge>) -> BoxFuture<'static, ()>;

/// 适配器定义
pub struct Adapter {
    /// 名称，"onebot" 面向 OneBot 端，"console" 面向本地输入
    pub name: &'static str,
    /// 启动处理函数
    pub handler: AdapterHandler,
}

static ADAPTERS: OnceLock<Vec<Adapter>> = OnceLock::new();

/// 获取所有注册的适配器
pub fn get_adapters() -> &'static [Adapter] {
    ADAPTERS.get_or_init(|| {
        vec![
            Adapter {
                name: "onebot",
                handler: onebot::entry,
            },
            // 控制台输入 (用于本地调试)
            Adapter {
                name: "console",
                handler: console::entry,
            },
        ]
    })
}

/// 根据名称查找适配器
pub fn find_adapter(name: &str) -> Option<&'static Adapter> {
    get_adapters().iter().find(|a| a.name == name)
}
