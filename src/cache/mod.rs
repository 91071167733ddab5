use std::sync::Arc;

use redis::{AsyncCommands, Client as RedisClient};

use crate::store::{BlockSets, ChatStore, UserHeader};

// 缓存相关常量
const USER_CACHE_EXPIRE: u64 = 600; // 用户缓存过期时间，单位秒
const USER_HEADER_CACHE_PREFIX: &str = "user:header:"; // 用户展示头缓存前缀
const USER_BLOCKS_CACHE_PREFIX: &str = "user:blocks:"; // 屏蔽/静音集合缓存前缀

/// 用户身份缓存：展示头与屏蔽/静音集合。
/// Redis 不可用时直接回退到数据库，缓存只是加速。
#[derive(Clone)]
pub struct UserCache {
    redis: Arc<RedisClient>,
}

impl UserCache {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }

    pub async fn user_header(
        &self,
        store: &dyn ChatStore,
        user_id: &str,
    ) -> Result<Option<UserHeader>, sqlx::Error> {
        let cache_key = format!("{}{}", USER_HEADER_CACHE_PREFIX, user_id);

        if let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await {
            let cached: redis::RedisResult<String> = conn.get(&cache_key).await;
            if let Ok(json_str) = cached {
                if let Ok(header) = serde_json::from_str::<UserHeader>(&json_str) {
                    tracing::debug!("Get user header from cache: {}", cache_key);
                    return Ok(Some(header));
                }
            }
        }

        let Some(user) = store.find_user(user_id).await? else {
            return Ok(None);
        };
        let header = UserHeader::from(&user);

        if let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await {
            if let Ok(json_str) = serde_json::to_string(&header) {
                let _: Result<(), redis::RedisError> =
                    conn.set_ex(&cache_key, json_str, USER_CACHE_EXPIRE).await;
                tracing::debug!("Set user header to cache: {}", cache_key);
            }
        }

        Ok(Some(header))
    }

    pub async fn block_sets(
        &self,
        store: &dyn ChatStore,
        user_id: &str,
    ) -> Result<BlockSets, sqlx::Error> {
        let cache_key = format!("{}{}", USER_BLOCKS_CACHE_PREFIX, user_id);

        if let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await {
            let cached: redis::RedisResult<String> = conn.get(&cache_key).await;
            if let Ok(json_str) = cached {
                if let Ok(sets) = serde_json::from_str::<BlockSets>(&json_str) {
                    tracing::debug!("Get block sets from cache: {}", cache_key);
                    return Ok(sets);
                }
            }
        }

        let sets = store.load_block_sets(user_id).await?;

        if let Ok(mut conn) = self.redis.get_multiplexed_async_connection().await {
            if let Ok(json_str) = serde_json::to_string(&sets) {
                let _: Result<(), redis::RedisError> =
                    conn.set_ex(&cache_key, json_str, USER_CACHE_EXPIRE).await;
                tracing::debug!("Set block sets to cache: {}", cache_key);
            }
        }

        Ok(sets)
    }
}
