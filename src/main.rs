use anyhow::Context;
use onebridge::adapters::console::ConsolePlatform;
use onebridge::adapters::find_adapter;
use onebridge::bridge::Bridge;
use onebridge::config::AppConfig;
use onebridge::idmap::{AllocMode, IdentityStore};
use onebridge::log::{self, Level};
use onebridge::platform::Platform;
use onebridge::platform::rest::RestPlatform;
use onebridge::{db, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = AppConfig::load(&config_path).await?;
    log::set_level(Level::parse(&config.log_level));

    let db = db::init(&config.db_path)
        .await
        .context("数据库初始化失败")?;
    let mode = if config.hash_id {
        AllocMode::Hash
    } else {
        AllocMode::Counter
    };
    let store = Arc::new(IdentityStore::new(db, mode));
    store.init_schema().await.context("建表失败")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()?;

    let console_mode = config.platform == "console";
    let platform: Arc<dyn Platform> = if console_mode {
        Arc::new(ConsolePlatform::default())
    } else {
        Arc::new(RestPlatform::new(&config.api_base, &config.token)?)
    };
    info!(target: "Main", "平台: {}", platform.name());

    let bridge = Arc::new(Bridge::new(config, store, platform, http));

    match bridge.platform.current_user().await {
        Ok(me) => {
            info!(target: "Main", "机器人账号: {} ({})", me.username, me.id);
            bridge.set_bot_native_id(&me.id);
        }
        Err(e) => warn!(target: "Main", "获取机器人账号失败: {}", e),
    }

    let mut adapters = vec!["onebot"];
    if console_mode {
        adapters.push("console");
    }
    for name in adapters {
        match find_adapter(name) {
            Some(adapter) => {
                tokio::spawn((adapter.handler)(bridge.clone()));
            }
            None => error!(target: "Main", "未找到适配器: {}", name),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!(target: "Main", "收到退出信号，正在关闭");
    Ok(())
}
