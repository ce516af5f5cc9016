//! SQLite 连接池
//!
//! 会话冷存储、知识库、长期记忆共用一个 sqlx 连接池；各模块在首次使用前自行建表。

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// 连接数据库（文件库自动创建）
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    if database_url.contains(":memory:") {
        return memory_pool().await;
    }
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

/// 内存库：单连接且永不回收，否则每个新连接都是一个空库
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("squad.db").display());
        let pool = connect(&url).await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)").execute(&pool).await.unwrap();
        assert!(dir.path().join("squad.db").exists());
    }
}
