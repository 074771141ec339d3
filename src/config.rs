use crate::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    // ===== 身份 =====
    /// 对 OneBot 端宣称的机器人 QQ 号 (self_id)
    #[serde(default = "default_app_id")]
    pub app_id: i64,

    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    // ===== 平台 =====
    /// "discord" 或 "console"
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    // ===== OneBot 连接 =====
    /// 反向 WebSocket 地址，可配置多个
    #[serde(default = "default_ws_address")]
    pub ws_address: Vec<String>,

    /// 与 ws_address 按下标对应
    #[serde(default)]
    pub ws_token: Vec<String>,

    /// 事件镜像推送的 HTTP 地址
    #[serde(default)]
    pub post_url: Vec<String>,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval: u64,

    // ===== 指令 =====
    #[serde(default)]
    pub master_id: Vec<String>,

    #[serde(default = "default_bind_prefix")]
    pub bind_prefix: String,

    #[serde(default = "default_me_prefix")]
    pub me_prefix: String,

    #[serde(default = "default_unlock_prefix")]
    pub unlock_prefix: String,

    // ===== 文本过滤 =====
    #[serde(default)]
    pub remove_prefix: bool,

    #[serde(default)]
    pub remove_at: bool,

    #[serde(default)]
    pub white_prefix_mode: bool,

    #[serde(default)]
    pub white_prefixs: Vec<String>,

    /// 白名单模式下直接放行的虚拟群号
    #[serde(default)]
    pub white_bypass: Vec<i64>,

    #[serde(default)]
    pub no_white_response: String,

    #[serde(default)]
    pub black_prefix_mode: bool,

    #[serde(default)]
    pub black_prefixs: Vec<String>,

    /// 只用于显示的前缀，转发前去除
    #[serde(default)]
    pub visual_prefixs: Vec<String>,

    // ===== 行为开关 =====
    #[serde(default)]
    pub url_pic_transfer: bool,

    #[serde(default)]
    pub idmap_pro: bool,

    #[serde(default)]
    pub hash_id: bool,

    #[serde(default)]
    pub lazy_message_id: bool,

    /// 类型探测两次尝试之间的间隔 (毫秒)
    #[serde(default = "default_send_delay")]
    pub send_delay: u64,

    /// true 时上报消息段数组，false 时上报 CQ 码字符串
    #[serde(default = "default_true")]
    pub array: bool,

    #[serde(default)]
    pub string_group_id: bool,

    #[serde(default)]
    pub mute_role_id: String,

    // ===== 运行环境 =====
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_app_id() -> i64 {
    12345
}

fn default_bot_name() -> String {
    "onebridge".to_string()
}

fn default_platform() -> String {
    "discord".to_string()
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_ws_address() -> Vec<String> {
    vec!["ws://127.0.0.1:8080".to_string()]
}

fn default_heartbeat() -> u64 {
    5
}

fn default_bind_prefix() -> String {
    "/bind".to_string()
}

fn default_me_prefix() -> String {
    "/me".to_string()
}

fn default_unlock_prefix() -> String {
    "/unlock".to_string()
}

fn default_send_delay() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "data/idmap.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            bot_name: default_bot_name(),
            platform: default_platform(),
            token: String::new(),
            api_base: default_api_base(),
            ws_address: default_ws_address(),
            ws_token: Vec::new(),
            post_url: Vec::new(),
            heartbeat_interval: default_heartbeat(),
            master_id: Vec::new(),
            bind_prefix: default_bind_prefix(),
            me_prefix: default_me_prefix(),
            unlock_prefix: default_unlock_prefix(),
            remove_prefix: false,
            remove_at: false,
            white_prefix_mode: false,
            white_prefixs: Vec::new(),
            white_bypass: Vec::new(),
            no_white_response: String::new(),
            black_prefix_mode: false,
            black_prefixs: Vec::new(),
            visual_prefixs: Vec::new(),
            url_pic_transfer: false,
            idmap_pro: false,
            hash_id: false,
            lazy_message_id: false,
            send_delay: default_send_delay(),
            array: true,
            string_group_id: false,
            mute_role_id: String::new(),
            db_path: default_db_path(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 读取配置文件，不存在时写出默认配置
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            let config = AppConfig::default();
            config.save(path).await?;
            warn!(target: "Config", "未找到 {}，已生成默认配置，请填写 token 后重启", path);
            return Ok(config);
        }

        let text = fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&text)?;
        info!(target: "Config", "已加载配置: {}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &str) -> anyhow::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, toml_string).await?;
        Ok(())
    }

    /// 第 index 个反向 WS 地址对应的 token
    pub fn ws_token_for(&self, index: usize) -> Option<&str> {
        self.ws_token
            .get(index)
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }

    /// 调用者的真实 id 或虚拟 id 在管理员列表中，列表为空时所有人都有权限
    pub fn is_master(&self, native_id: &str, synthetic_id: i64) -> bool {
        if self.master_id.is_empty() {
            return true;
        }
        let synthetic = synthetic_id.to_string();
        self.master_id
            .iter()
            .any(|m| m == native_id || *m == synthetic)
    }
}
