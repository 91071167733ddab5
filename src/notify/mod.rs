use std::sync::Arc;

use redis::{AsyncCommands, Client as RedisClient};

// 未读计数的键前缀
const UNREAD_KEY_PREFIX: &str = "notify:chat:"; // notify:chat:{user_id}:{group_id}
const UNREAD_TOTAL_PREFIX: &str = "notify:chat:total:"; // 每用户的未读总数

/// 通知计数服务的客户端。计数本身由外部消费（客户端角标等），
/// 所有调用都是尽力而为：失败只记日志，绝不让触发它的请求失败。
#[derive(Clone)]
pub struct NotificationCounter {
    redis: Arc<RedisClient>,
}

impl NotificationCounter {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }

    /// 新帖对该成员可见且非其本人所发，未读数加一
    pub async fn increment_unread(&self, user_id: &str, group_id: &str) {
        let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await else {
            tracing::warn!("Notification counter unreachable, skip increment");
            return;
        };
        let key = format!("{}{}:{}", UNREAD_KEY_PREFIX, user_id, group_id);
        let total_key = format!("{}{}", UNREAD_TOTAL_PREFIX, user_id);
        if let Err(e) = conn.incr::<_, _, i64>(&key, 1).await {
            tracing::warn!("Failed to increment unread for {}: {}", user_id, e);
            return;
        }
        if let Err(e) = conn.incr::<_, _, i64>(&total_key, 1).await {
            tracing::warn!("Failed to increment unread total for {}: {}", user_id, e);
        }
    }

    /// 帖子被删除，对尚未读到它的成员未读数减一
    pub async fn decrement_unread(&self, user_id: &str, group_id: &str) {
        let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await else {
            tracing::warn!("Notification counter unreachable, skip decrement");
            return;
        };
        let key = format!("{}{}:{}", UNREAD_KEY_PREFIX, user_id, group_id);
        let total_key = format!("{}{}", UNREAD_TOTAL_PREFIX, user_id);
        match conn.decr::<_, _, i64>(&key, 1).await {
            Ok(remaining) if remaining < 0 => {
                // 计数只容忍短暂偏差，不允许变成负数
                let _: Result<(), redis::RedisError> = conn.set(&key, 0).await;
            }
            Ok(_) => {
                let _: Result<i64, redis::RedisError> = conn.decr(&total_key, 1).await;
            }
            Err(e) => {
                tracing::warn!("Failed to decrement unread for {}: {}", user_id, e);
            }
        }
    }

    /// 成员退出或被移出群组，清掉该群的全部未读
    pub async fn clear_unread(&self, user_id: &str, group_id: &str) {
        self.reset(user_id, group_id).await;
    }

    /// 成员读完了所有可见帖子，把该群的通知标记为已读
    pub async fn mark_viewed(&self, user_id: &str, group_id: &str) {
        self.reset(user_id, group_id).await;
    }

    async fn reset(&self, user_id: &str, group_id: &str) {
        let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await else {
            tracing::warn!("Notification counter unreachable, skip reset");
            return;
        };
        let key = format!("{}{}:{}", UNREAD_KEY_PREFIX, user_id, group_id);
        let total_key = format!("{}{}", UNREAD_TOTAL_PREFIX, user_id);
        let pending: i64 = match conn.get::<_, Option<i64>>(&key).await {
            Ok(value) => value.unwrap_or(0),
            Err(e) => {
                tracing::warn!("Failed to read unread count for {}: {}", user_id, e);
                return;
            }
        };
        if pending > 0 {
            let _: Result<i64, redis::RedisError> = conn.decr(&total_key, pending).await;
        }
        let _: Result<(), redis::RedisError> = conn.del(&key).await;
    }
}
