use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::path::Path;
use tokio::fs;

use crate::{info, warn};

/// 初始化数据库连接
pub async fn init(db_path: &str) -> Result<DatabaseConnection, DbErr> {
    if let Some(dir) = Path::new(db_path).parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
        && let Err(e) = fs::create_dir_all(dir).await
    {
        warn!(target: "Database", "创建目录 {} 失败: {}", dir.display(), e);
    }

    // mode=rwc 允许 读/写/创建
    let db_url = format!("sqlite:{}?mode=rwc", db_path);

    let mut opt = ConnectOptions::new(db_url.clone());
    opt.sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!(target: "Database", "连接成功: {}", db_url);

    Ok(db)
}

/// 内存数据库，单连接保证所有查询看到同一个库
pub async fn memory() -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    Database::connect(opt).await
}
