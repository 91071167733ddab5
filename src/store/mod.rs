use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::AppError;

pub mod pg;

#[cfg(test)]
pub mod mem;

/// 群组类型。closed 为私密群组，不允许自助加入/退出，
/// 其余类型均为可自助加入的公开活动类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Open,
    Closed,
    Activity,
    Dining,
    Gaming,
    Meetup,
    Other,
}

impl GroupType {
    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "open" => Ok(GroupType::Open),
            "closed" => Ok(GroupType::Closed),
            "activity" => Ok(GroupType::Activity),
            "dining" => Ok(GroupType::Dining),
            "gaming" => Ok(GroupType::Gaming),
            "meetup" => Ok(GroupType::Meetup),
            "other" => Ok(GroupType::Other),
            unknown => Err(AppError::Internal(format!(
                "unknown group type '{}'",
                unknown
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupType::Open => "open",
            GroupType::Closed => "closed",
            GroupType::Activity => "activity",
            GroupType::Dining => "dining",
            GroupType::Gaming => "gaming",
            GroupType::Meetup => "meetup",
            GroupType::Other => "other",
        }
    }

    pub fn is_private(self) -> bool {
        matches!(self, GroupType::Closed)
    }

    pub fn allows_self_service(self) -> bool {
        !self.is_private()
    }

    /// 私密群组不允许带图，公开类型最多一张
    pub fn max_images(self) -> usize {
        if self.is_private() { 0 } else { 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChatGroup {
    pub group_id: String,
    pub group_type: String,
    pub title: String,
    pub info: String,
    pub location: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub min_capacity: i32,
    pub max_capacity: i32,
    pub cancelled: bool,
    pub moderation_status: String,
    pub owner_id: String,
    pub post_count: i32,
    pub participant_array: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatGroup {
    pub fn group_type(&self) -> Result<GroupType, AppError> {
        GroupType::parse(&self.group_type)
    }

    /// 被锁定或隔离的群组禁止发帖
    pub fn posting_locked(&self) -> bool {
        self.moderation_status != "normal"
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.participant_array.iter().any(|id| id == user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Participant {
    pub group_id: String,
    pub user_id: String,
    pub read_count: i32,
    pub hidden_count: i32,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Post {
    pub post_id: i64,
    pub group_id: String,
    pub author_id: String,
    pub text: String,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub user_id: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: String,
}

/// 用户展示头信息，经由用户缓存提供
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserHeader {
    pub user_id: String,
    pub display_name: String,
}

impl UserHeader {
    /// 打码身份：观看者屏蔽了对方时用它顶替，长度与顺序都不变，
    /// 不暴露屏蔽关系本身
    pub fn masked() -> Self {
        UserHeader {
            user_id: String::new(),
            display_name: "未知用户".into(),
        }
    }
}

impl From<&UserRecord> for UserHeader {
    fn from(user: &UserRecord) -> Self {
        UserHeader {
            user_id: user.user_id.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

/// 用户当前的屏蔽/静音集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockSets {
    pub blocked: HashSet<String>,
    pub muted: HashSet<String>,
}

impl BlockSets {
    /// 该作者的帖子对本用户是否不可见
    pub fn hides(&self, author_id: &str) -> bool {
        self.blocked.contains(author_id) || self.muted.contains(author_id)
    }

    pub fn excluded_authors(&self) -> Vec<String> {
        self.blocked.iter().chain(self.muted.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub group_id: String,
    pub group_type: String,
    pub title: String,
    pub info: String,
    pub location: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub min_capacity: i32,
    pub max_capacity: i32,
    pub owner_id: String,
    /// 含群主在内的初始成员，顺序即容量边界
    pub participant_array: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OpenGroupFilter {
    pub group_type: Option<String>,
    pub day: Option<NaiveDate>,
    pub start: i64,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct JoinedGroup {
    pub group: ChatGroup,
    pub pivot: Participant,
}

/// 群聊存储接口。核心逻辑只依赖这个接口，便于用内存实现做测试。
/// 带副作用的方法内部保证一次调用的全部写入在同一事务中生效。
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert_group(&self, group: &NewGroup) -> Result<ChatGroup, sqlx::Error>;
    async fn find_group(&self, group_id: &str) -> Result<Option<ChatGroup>, sqlx::Error>;
    async fn list_open_groups(&self, filter: &OpenGroupFilter)
    -> Result<Vec<ChatGroup>, sqlx::Error>;
    async fn list_joined_groups(
        &self,
        user_id: &str,
        group_type: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<JoinedGroup>, sqlx::Error>;
    async fn list_owned_groups(
        &self,
        owner_id: &str,
        group_type: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<ChatGroup>, sqlx::Error>;
    async fn set_cancelled(&self, group_id: &str) -> Result<(), sqlx::Error>;

    async fn find_participant(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, sqlx::Error>;
    async fn list_participants(&self, group_id: &str) -> Result<Vec<Participant>, sqlx::Error>;
    /// 追加到 participant_array 并创建计数记录，同一事务
    async fn add_participant(
        &self,
        group_id: &str,
        user_id: &str,
        hidden_count: i32,
    ) -> Result<(), sqlx::Error>;
    /// 从 participant_array 移除并删除计数记录，同一事务
    async fn remove_participant(&self, group_id: &str, user_id: &str) -> Result<(), sqlx::Error>;

    async fn count_posts_by_authors(
        &self,
        group_id: &str,
        authors: &[String],
    ) -> Result<i64, sqlx::Error>;
    /// 写入帖子并在同一事务内完成 post_count 自增、屏蔽成员的
    /// hidden_count 自增、作者 read_count 前移
    async fn insert_post(
        &self,
        group_id: &str,
        author_id: &str,
        text: &str,
        image: Option<&str>,
        hidden_from: &[String],
    ) -> Result<Post, sqlx::Error>;
    async fn find_post(&self, post_id: i64) -> Result<Option<Post>, sqlx::Error>;
    /// 软删除帖子并在同一事务内回退 post_count、屏蔽成员的
    /// hidden_count（下限 0）、以及所有 read_count > post_index 的成员
    async fn delete_post(
        &self,
        post: &Post,
        post_index: i64,
        hidden_for: &[String],
    ) -> Result<(), sqlx::Error>;
    async fn list_posts(
        &self,
        group_id: &str,
        excluded_authors: &[String],
        start: i64,
        limit: i64,
    ) -> Result<Vec<Post>, sqlx::Error>;
    /// 该帖子在群内的 0 起始位置，即 ID 更小的存活帖子数
    async fn count_posts_before(&self, group_id: &str, post_id: i64) -> Result<i64, sqlx::Error>;
    async fn set_read_count(
        &self,
        group_id: &str,
        user_id: &str,
        read_count: i32,
    ) -> Result<(), sqlx::Error>;

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, sqlx::Error>;
    async fn load_block_sets(&self, user_id: &str) -> Result<BlockSets, sqlx::Error>;
    async fn insert_report(
        &self,
        reporter_id: &str,
        target_type: &str,
        target_id: &str,
        message: Option<&str>,
    ) -> Result<(), sqlx::Error>;
}
