use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::cache::UserCache;
use crate::store::{ChatStore, Post, UserHeader};

/// 推送给在线观看者的事件。通道只有服务端到客户端方向，
/// 所有写操作都走 HTTP 接口。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveEvent {
    NewPost {
        group_id: String,
        post_id: i64,
        author: UserHeader,
        text: String,
        image: Option<String>,
        created_at: DateTime<Utc>,
    },
    MembershipChange {
        group_id: String,
        user: UserHeader,
        joined: bool,
    },
}

struct LiveConnection {
    conn_id: u64,
    user_id: String,
    sender: mpsc::UnboundedSender<LiveEvent>,
}

/// 按群组维护的在线连接注册表，进程内存，随连接生灭。
pub struct FanoutRegistry {
    connections: Mutex<HashMap<String, Vec<LiveConnection>>>,
    next_conn_id: AtomicU64,
}

impl Default for FanoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// 注册一个观看连接。可见性由调用方在订阅前检查，
    /// 发布时还会按当下状态复查。
    pub async fn subscribe(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<LiveEvent>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut connections = self.connections.lock().await;
        connections
            .entry(group_id.to_string())
            .or_default()
            .push(LiveConnection {
                conn_id,
                user_id: user_id.to_string(),
                sender,
            });
        tracing::debug!("Live connection {} opened for group {}", conn_id, group_id);
        (conn_id, receiver)
    }

    /// 断开连接时必须调用，之后不会再有事件投递到该连接
    pub async fn unsubscribe(&self, group_id: &str, conn_id: u64) {
        let mut connections = self.connections.lock().await;
        if let Some(list) = connections.get_mut(group_id) {
            list.retain(|conn| conn.conn_id != conn_id);
            if list.is_empty() {
                connections.remove(group_id);
            }
        }
        tracing::debug!("Live connection {} closed for group {}", conn_id, group_id);
    }

    pub async fn connection_count(&self, group_id: &str) -> usize {
        self.connections
            .lock()
            .await
            .get(group_id)
            .map_or(0, Vec::len)
    }

    /// 新帖事件。对每个连接按当前成员关系与屏蔽状态复查后投递，
    /// 投递失败只会使该连接被清理，绝不影响触发它的请求。
    pub async fn publish_post(
        &self,
        store: &dyn ChatStore,
        cache: &UserCache,
        group_id: &str,
        post: &Post,
    ) {
        let targets = self.snapshot(group_id).await;
        if targets.is_empty() {
            return;
        }

        let author = match cache.user_header(store, &post.author_id).await {
            Ok(Some(header)) => header,
            Ok(None) => UserHeader {
                user_id: post.author_id.clone(),
                display_name: post.author_id.clone(),
            },
            Err(e) => {
                tracing::warn!("Skip post fan-out, author lookup failed: {}", e);
                return;
            }
        };

        let mut dead = Vec::new();
        for (conn_id, user_id, sender) in targets {
            if !self.visible_to(store, group_id, &user_id).await {
                continue;
            }
            match cache.block_sets(store, &user_id).await {
                Ok(sets) if sets.hides(&post.author_id) => continue,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Skip connection {}, block lookup failed: {}", conn_id, e);
                    continue;
                }
            }
            let event = LiveEvent::NewPost {
                group_id: group_id.to_string(),
                post_id: post.post_id,
                author: author.clone(),
                text: post.text.clone(),
                image: post.image.clone(),
                created_at: post.created_at,
            };
            if sender.send(event).is_err() {
                dead.push(conn_id);
            }
        }
        self.prune(group_id, &dead).await;
    }

    /// 成员加入/退出事件。观看者屏蔽了该成员时投递打码身份。
    pub async fn publish_membership_change(
        &self,
        store: &dyn ChatStore,
        cache: &UserCache,
        group_id: &str,
        changed_user: &UserHeader,
        joined: bool,
    ) {
        let targets = self.snapshot(group_id).await;
        if targets.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for (conn_id, user_id, sender) in targets {
            if !self.visible_to(store, group_id, &user_id).await {
                continue;
            }
            let user = match cache.block_sets(store, &user_id).await {
                Ok(sets) if sets.blocked.contains(&changed_user.user_id) => UserHeader::masked(),
                Ok(_) => changed_user.clone(),
                Err(e) => {
                    tracing::warn!("Skip connection {}, block lookup failed: {}", conn_id, e);
                    continue;
                }
            };
            let event = LiveEvent::MembershipChange {
                group_id: group_id.to_string(),
                user,
                joined,
            };
            if sender.send(event).is_err() {
                dead.push(conn_id);
            }
        }
        self.prune(group_id, &dead).await;
    }

    async fn snapshot(
        &self,
        group_id: &str,
    ) -> Vec<(u64, String, mpsc::UnboundedSender<LiveEvent>)> {
        let connections = self.connections.lock().await;
        connections
            .get(group_id)
            .map(|list| {
                list.iter()
                    .map(|conn| (conn.conn_id, conn.user_id.clone(), conn.sender.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 发布时的可见性复查：订阅之后成员关系可能已经变化
    async fn visible_to(&self, store: &dyn ChatStore, group_id: &str, user_id: &str) -> bool {
        match store.find_participant(group_id, user_id).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Visibility check failed for {}: {}", user_id, e);
                return false;
            }
        }
        let elevated = match store.find_user(user_id).await {
            Ok(Some(user)) => user.role == "moderator" || user.role == "admin",
            _ => false,
        };
        if !elevated {
            return false;
        }
        match store.find_group(group_id).await {
            Ok(Some(group)) => group
                .group_type()
                .map(|t| !t.is_private())
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn prune(&self, group_id: &str, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        let mut connections = self.connections.lock().await;
        if let Some(list) = connections.get_mut(group_id) {
            list.retain(|conn| !dead.contains(&conn.conn_id));
            if list.is_empty() {
                connections.remove(group_id);
            }
        }
    }
}
