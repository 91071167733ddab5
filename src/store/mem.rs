//! 测试用内存实现，语义与 Postgres 实现保持一致。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use redis::Client as RedisClient;

use super::{
    BlockSets, ChatGroup, ChatStore, JoinedGroup, NewGroup, OpenGroupFilter, Participant, Post,
    UserRecord,
};
use crate::cache::UserCache;
use crate::config::Config;
use crate::fanout::FanoutRegistry;
use crate::notify::NotificationCounter;
use crate::AppState;

#[derive(Default)]
struct Inner {
    groups: HashMap<String, ChatGroup>,
    participants: HashMap<(String, String), Participant>,
    posts: BTreeMap<i64, Post>,
    next_post_id: i64,
    users: HashMap<String, UserRecord>,
    relations: HashMap<String, BlockSets>,
    reports: Vec<(String, String, String, Option<String>)>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: &str, display_name: &str, role: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.users.insert(
            user_id.to_string(),
            UserRecord {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                password_hash: String::new(),
                role: role.to_string(),
            },
        );
    }

    pub fn set_blocks(&self, user_id: &str, sets: BlockSets) {
        let mut inner = self.inner.lock().unwrap();
        inner.relations.insert(user_id.to_string(), sets);
    }

    pub fn set_moderation_status(&self, group_id: &str, status: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group) = inner.groups.get_mut(group_id) {
            group.moderation_status = status.to_string();
        }
    }

    pub fn report_count(&self) -> usize {
        self.inner.lock().unwrap().reports.len()
    }
}

/// 测试用的应用状态。Redis 指向一个没有监听的端口，
/// 缓存与通知计数都会走降级路径。
pub fn test_state(store: Arc<MemStore>) -> AppState {
    let config = Config::default();
    let redis = Arc::new(RedisClient::open(config.redis_url.as_str()).unwrap());
    let store: Arc<dyn ChatStore> = store;
    AppState {
        config,
        redis: redis.clone(),
        store,
        cache: UserCache::new(redis.clone()),
        notifier: NotificationCounter::new(redis),
        fanout: Arc::new(FanoutRegistry::new()),
    }
}

/// 测试用的请求方身份
pub fn test_claims(user_id: &str, role: &str) -> crate::utils::Claims {
    crate::utils::Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        exp: i64::MAX,
        iat: 0,
    }
}

#[async_trait]
impl ChatStore for MemStore {
    async fn insert_group(&self, group: &NewGroup) -> Result<ChatGroup, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let created = ChatGroup {
            group_id: group.group_id.clone(),
            group_type: group.group_type.clone(),
            title: group.title.clone(),
            info: group.info.clone(),
            location: group.location.clone(),
            start_time: group.start_time,
            end_time: group.end_time,
            min_capacity: group.min_capacity,
            max_capacity: group.max_capacity,
            cancelled: false,
            moderation_status: "normal".into(),
            owner_id: group.owner_id.clone(),
            post_count: 0,
            participant_array: group.participant_array.clone(),
            created_at: Utc::now(),
        };
        for user_id in &group.participant_array {
            inner.participants.insert(
                (group.group_id.clone(), user_id.clone()),
                Participant {
                    group_id: group.group_id.clone(),
                    user_id: user_id.clone(),
                    read_count: 0,
                    hidden_count: 0,
                    joined_at: Utc::now(),
                },
            );
        }
        inner.groups.insert(group.group_id.clone(), created.clone());
        Ok(created)
    }

    async fn find_group(&self, group_id: &str) -> Result<Option<ChatGroup>, sqlx::Error> {
        Ok(self.inner.lock().unwrap().groups.get(group_id).cloned())
    }

    async fn list_open_groups(
        &self,
        filter: &OpenGroupFilter,
    ) -> Result<Vec<ChatGroup>, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        let mut groups: Vec<ChatGroup> = inner
            .groups
            .values()
            .filter(|g| g.group_type != "closed")
            .filter(|g| {
                filter
                    .group_type
                    .as_ref()
                    .is_none_or(|t| &g.group_type == t)
            })
            .filter(|g| {
                filter
                    .day
                    .is_none_or(|day| g.start_time.is_some_and(|t| t.date_naive() == day))
            })
            .cloned()
            .collect();
        groups.sort_by_key(|g| (g.start_time.is_none(), g.start_time, g.created_at));
        Ok(groups
            .into_iter()
            .skip(filter.start as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn list_joined_groups(
        &self,
        user_id: &str,
        group_type: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<JoinedGroup>, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        let mut joined: Vec<JoinedGroup> = inner
            .participants
            .values()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| {
                inner.groups.get(&p.group_id).map(|g| JoinedGroup {
                    group: g.clone(),
                    pivot: p.clone(),
                })
            })
            .filter(|j| group_type.is_none_or(|t| j.group.group_type == t))
            .collect();
        joined.sort_by(|a, b| b.group.created_at.cmp(&a.group.created_at));
        Ok(joined
            .into_iter()
            .skip(start as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_owned_groups(
        &self,
        owner_id: &str,
        group_type: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<ChatGroup>, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        let mut groups: Vec<ChatGroup> = inner
            .groups
            .values()
            .filter(|g| g.owner_id == owner_id)
            .filter(|g| group_type.is_none_or(|t| g.group_type == t))
            .cloned()
            .collect();
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(groups
            .into_iter()
            .skip(start as usize)
            .take(limit as usize)
            .collect())
    }

    async fn set_cancelled(&self, group_id: &str) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.groups.get_mut(group_id) {
            Some(group) => {
                group.cancelled = true;
                Ok(())
            }
            None => Err(sqlx::Error::RowNotFound),
        }
    }

    async fn find_participant(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .participants
            .get(&(group_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn list_participants(&self, group_id: &str) -> Result<Vec<Participant>, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        let mut pivots: Vec<Participant> = inner
            .participants
            .values()
            .filter(|p| p.group_id == group_id)
            .cloned()
            .collect();
        pivots.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(pivots)
    }

    async fn add_participant(
        &self,
        group_id: &str,
        user_id: &str,
        hidden_count: i32,
    ) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.groups.get_mut(group_id) {
            Some(group) => group.participant_array.push(user_id.to_string()),
            None => return Err(sqlx::Error::RowNotFound),
        }
        inner.participants.insert(
            (group_id.to_string(), user_id.to_string()),
            Participant {
                group_id: group_id.to_string(),
                user_id: user_id.to_string(),
                read_count: 0,
                hidden_count,
                joined_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove_participant(&self, group_id: &str, user_id: &str) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.groups.get_mut(group_id) {
            Some(group) => group.participant_array.retain(|id| id != user_id),
            None => return Err(sqlx::Error::RowNotFound),
        }
        inner
            .participants
            .remove(&(group_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn count_posts_by_authors(
        &self,
        group_id: &str,
        authors: &[String],
    ) -> Result<i64, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .posts
            .values()
            .filter(|p| p.group_id == group_id && authors.contains(&p.author_id))
            .count() as i64)
    }

    async fn insert_post(
        &self,
        group_id: &str,
        author_id: &str,
        text: &str,
        image: Option<&str>,
        hidden_from: &[String],
    ) -> Result<Post, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let post_count = match inner.groups.get_mut(group_id) {
            Some(group) => {
                group.post_count += 1;
                group.post_count
            }
            None => return Err(sqlx::Error::RowNotFound),
        };

        inner.next_post_id += 1;
        let post = Post {
            post_id: inner.next_post_id,
            group_id: group_id.to_string(),
            author_id: author_id.to_string(),
            text: text.to_string(),
            image: image.map(str::to_string),
            created_at: Utc::now(),
        };
        inner.posts.insert(post.post_id, post.clone());

        for user_id in hidden_from {
            if let Some(pivot) = inner
                .participants
                .get_mut(&(group_id.to_string(), user_id.clone()))
            {
                pivot.hidden_count += 1;
            }
        }
        if let Some(pivot) = inner
            .participants
            .get_mut(&(group_id.to_string(), author_id.to_string()))
        {
            pivot.read_count = post_count - pivot.hidden_count;
        }
        Ok(post)
    }

    async fn find_post(&self, post_id: i64) -> Result<Option<Post>, sqlx::Error> {
        Ok(self.inner.lock().unwrap().posts.get(&post_id).cloned())
    }

    async fn delete_post(
        &self,
        post: &Post,
        post_index: i64,
        hidden_for: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.posts.remove(&post.post_id).is_none() {
            return Err(sqlx::Error::RowNotFound);
        }

        match inner.groups.get_mut(&post.group_id) {
            Some(group) => group.post_count -= 1,
            None => return Err(sqlx::Error::RowNotFound),
        }

        for user_id in hidden_for {
            if let Some(pivot) = inner
                .participants
                .get_mut(&(post.group_id.clone(), user_id.clone()))
            {
                pivot.hidden_count = (pivot.hidden_count - 1).max(0);
            }
        }
        for pivot in inner
            .participants
            .values_mut()
            .filter(|p| p.group_id == post.group_id)
        {
            if i64::from(pivot.read_count) > post_index {
                pivot.read_count -= 1;
            }
        }
        Ok(())
    }

    async fn list_posts(
        &self,
        group_id: &str,
        excluded_authors: &[String],
        start: i64,
        limit: i64,
    ) -> Result<Vec<Post>, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .posts
            .values()
            .filter(|p| p.group_id == group_id && !excluded_authors.contains(&p.author_id))
            .skip(start as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_posts_before(&self, group_id: &str, post_id: i64) -> Result<i64, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .posts
            .values()
            .filter(|p| p.group_id == group_id && p.post_id < post_id)
            .count() as i64)
    }

    async fn set_read_count(
        &self,
        group_id: &str,
        user_id: &str,
        read_count: i32,
    ) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pivot) = inner
            .participants
            .get_mut(&(group_id.to_string(), user_id.to_string()))
        {
            pivot.read_count = read_count;
        }
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        Ok(self.inner.lock().unwrap().users.get(user_id).cloned())
    }

    async fn load_block_sets(&self, user_id: &str) -> Result<BlockSets, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .relations
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_report(
        &self,
        reporter_id: &str,
        target_type: &str,
        target_id: &str,
        message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        self.inner.lock().unwrap().reports.push((
            reporter_id.to_string(),
            target_type.to_string(),
            target_id.to_string(),
            message.map(str::to_string),
        ));
        Ok(())
    }
}
