use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use super::{
    BlockSets, ChatGroup, ChatStore, JoinedGroup, NewGroup, OpenGroupFilter, Participant, Post,
    UserRecord,
};

const GROUP_COLUMNS: &str = "group_id, group_type, title, info, location, start_time, end_time, \
     min_capacity, max_capacity, cancelled, moderation_status, owner_id, post_count, \
     participant_array, created_at";

const POST_COLUMNS: &str = "post_id, group_id, author_id, text, image, created_at";

/// Postgres 实现。所有跨行的计数更新都放在同一事务里，
/// 保证并发的发帖/删帖不会造成计数漂移。
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// list_joined_groups 的联查行，拆成群组和计数记录两部分
#[derive(FromRow)]
struct JoinedRow {
    group_id: String,
    group_type: String,
    title: String,
    info: String,
    location: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    min_capacity: i32,
    max_capacity: i32,
    cancelled: bool,
    moderation_status: String,
    owner_id: String,
    post_count: i32,
    participant_array: Vec<String>,
    created_at: DateTime<Utc>,
    member_id: String,
    read_count: i32,
    hidden_count: i32,
    joined_at: DateTime<Utc>,
}

impl From<JoinedRow> for JoinedGroup {
    fn from(row: JoinedRow) -> Self {
        JoinedGroup {
            pivot: Participant {
                group_id: row.group_id.clone(),
                user_id: row.member_id,
                read_count: row.read_count,
                hidden_count: row.hidden_count,
                joined_at: row.joined_at,
            },
            group: ChatGroup {
                group_id: row.group_id,
                group_type: row.group_type,
                title: row.title,
                info: row.info,
                location: row.location,
                start_time: row.start_time,
                end_time: row.end_time,
                min_capacity: row.min_capacity,
                max_capacity: row.max_capacity,
                cancelled: row.cancelled,
                moderation_status: row.moderation_status,
                owner_id: row.owner_id,
                post_count: row.post_count,
                participant_array: row.participant_array,
                created_at: row.created_at,
            },
        }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn insert_group(&self, group: &NewGroup) -> Result<ChatGroup, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, ChatGroup>(&format!(
            r#"
            INSERT INTO chat_groups (
                group_id, group_type, title, info, location, start_time, end_time,
                min_capacity, max_capacity, cancelled, moderation_status, owner_id,
                post_count, participant_array, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, 'normal', $10, 0, $11, NOW())
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(&group.group_id)
        .bind(&group.group_type)
        .bind(&group.title)
        .bind(&group.info)
        .bind(&group.location)
        .bind(group.start_time)
        .bind(group.end_time)
        .bind(group.min_capacity)
        .bind(group.max_capacity)
        .bind(&group.owner_id)
        .bind(&group.participant_array)
        .fetch_one(&mut *tx)
        .await?;

        // 初始成员（含群主）同时拿到计数记录
        for user_id in &group.participant_array {
            sqlx::query(
                r#"
                INSERT INTO participants (group_id, user_id, read_count, hidden_count, joined_at)
                VALUES ($1, $2, 0, 0, NOW())
                "#,
            )
            .bind(&group.group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn find_group(&self, group_id: &str) -> Result<Option<ChatGroup>, sqlx::Error> {
        sqlx::query_as::<_, ChatGroup>(&format!(
            "SELECT {GROUP_COLUMNS} FROM chat_groups WHERE group_id = $1 AND deleted_at IS NULL"
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_open_groups(
        &self,
        filter: &OpenGroupFilter,
    ) -> Result<Vec<ChatGroup>, sqlx::Error> {
        sqlx::query_as::<_, ChatGroup>(&format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM chat_groups
            WHERE deleted_at IS NULL
                AND group_type <> 'closed'
                AND ($1::TEXT IS NULL OR group_type = $1)
                AND ($2::DATE IS NULL OR start_time::date = $2)
            ORDER BY start_time ASC NULLS LAST, created_at ASC
            OFFSET $3 LIMIT $4
            "#
        ))
        .bind(&filter.group_type)
        .bind(filter.day)
        .bind(filter.start)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn list_joined_groups(
        &self,
        user_id: &str,
        group_type: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<JoinedGroup>, sqlx::Error> {
        let rows = sqlx::query_as::<_, JoinedRow>(
            r#"
            SELECT g.group_id, g.group_type, g.title, g.info, g.location, g.start_time,
                   g.end_time, g.min_capacity, g.max_capacity, g.cancelled,
                   g.moderation_status, g.owner_id, g.post_count, g.participant_array,
                   g.created_at,
                   p.user_id AS member_id, p.read_count, p.hidden_count, p.joined_at
            FROM chat_groups g
            JOIN participants p ON p.group_id = g.group_id
            WHERE p.user_id = $1
                AND g.deleted_at IS NULL
                AND ($2::TEXT IS NULL OR g.group_type = $2)
            ORDER BY g.created_at DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(group_type)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(JoinedGroup::from).collect())
    }

    async fn list_owned_groups(
        &self,
        owner_id: &str,
        group_type: Option<&str>,
        start: i64,
        limit: i64,
    ) -> Result<Vec<ChatGroup>, sqlx::Error> {
        sqlx::query_as::<_, ChatGroup>(&format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM chat_groups
            WHERE owner_id = $1
                AND deleted_at IS NULL
                AND ($2::TEXT IS NULL OR group_type = $2)
            ORDER BY created_at DESC
            OFFSET $3 LIMIT $4
            "#
        ))
        .bind(owner_id)
        .bind(group_type)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn set_cancelled(&self, group_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE chat_groups SET cancelled = TRUE WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_participant(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, sqlx::Error> {
        sqlx::query_as::<_, Participant>(
            r#"
            SELECT group_id, user_id, read_count, hidden_count, joined_at
            FROM participants
            WHERE group_id = $1 AND user_id = $2
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_participants(&self, group_id: &str) -> Result<Vec<Participant>, sqlx::Error> {
        sqlx::query_as::<_, Participant>(
            r#"
            SELECT group_id, user_id, read_count, hidden_count, joined_at
            FROM participants
            WHERE group_id = $1
            ORDER BY joined_at ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn add_participant(
        &self,
        group_id: &str,
        user_id: &str,
        hidden_count: i32,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE chat_groups
            SET participant_array = array_append(participant_array, $2)
            WHERE group_id = $1
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO participants (group_id, user_id, read_count, hidden_count, joined_at)
            VALUES ($1, $2, 0, $3, NOW())
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(hidden_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    async fn remove_participant(&self, group_id: &str, user_id: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE chat_groups
            SET participant_array = array_remove(participant_array, $2)
            WHERE group_id = $1
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM participants WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    async fn count_posts_by_authors(
        &self,
        group_id: &str,
        authors: &[String],
    ) -> Result<i64, sqlx::Error> {
        if authors.is_empty() {
            return Ok(0);
        }
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM posts
            WHERE group_id = $1 AND author_id = ANY($2) AND deleted_at IS NULL
            "#,
        )
        .bind(group_id)
        .bind(authors)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("count")
    }

    async fn insert_post(
        &self,
        group_id: &str,
        author_id: &str,
        text: &str,
        image: Option<&str>,
        hidden_from: &[String],
    ) -> Result<Post, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // 行锁住群组行，拿到自增后的 post_count
        let row = sqlx::query(
            r#"
            UPDATE chat_groups SET post_count = post_count + 1
            WHERE group_id = $1
            RETURNING post_count
            "#,
        )
        .bind(group_id)
        .fetch_one(&mut *tx)
        .await?;
        let post_count: i32 = row.try_get("post_count")?;

        let post = sqlx::query_as::<_, Post>(&format!(
            r#"
            INSERT INTO posts (group_id, author_id, text, image, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING {POST_COLUMNS}
            "#
        ))
        .bind(group_id)
        .bind(author_id)
        .bind(text)
        .bind(image)
        .fetch_one(&mut *tx)
        .await?;

        // 屏蔽/静音作者的成员看不到这条帖子
        if !hidden_from.is_empty() {
            sqlx::query(
                r#"
                UPDATE participants SET hidden_count = hidden_count + 1
                WHERE group_id = $1 AND user_id = ANY($2)
                "#,
            )
            .bind(group_id)
            .bind(hidden_from)
            .execute(&mut *tx)
            .await?;
        }

        // 作者的已读数推进到自己可见的末尾
        sqlx::query(
            r#"
            UPDATE participants SET read_count = $3 - hidden_count
            WHERE group_id = $1 AND user_id = $2
            "#,
        )
        .bind(group_id)
        .bind(author_id)
        .bind(post_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(post)
    }

    async fn find_post(&self, post_id: i64) -> Result<Option<Post>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE post_id = $1 AND deleted_at IS NULL"
        ))
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete_post(
        &self,
        post: &Post,
        post_index: i64,
        hidden_for: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE posts SET deleted_at = NOW() WHERE post_id = $1")
            .bind(post.post_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE chat_groups SET post_count = post_count - 1 WHERE group_id = $1")
            .bind(&post.group_id)
            .execute(&mut *tx)
            .await?;

        if !hidden_for.is_empty() {
            sqlx::query(
                r#"
                UPDATE participants SET hidden_count = GREATEST(hidden_count - 1, 0)
                WHERE group_id = $1 AND user_id = ANY($2)
                "#,
            )
            .bind(&post.group_id)
            .bind(hidden_for)
            .execute(&mut *tx)
            .await?;
        }

        // 已读越过被删帖子的成员整体回退一位
        sqlx::query(
            r#"
            UPDATE participants SET read_count = read_count - 1
            WHERE group_id = $1 AND read_count > $2
            "#,
        )
        .bind(&post.group_id)
        .bind(post_index as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    async fn list_posts(
        &self,
        group_id: &str,
        excluded_authors: &[String],
        start: i64,
        limit: i64,
    ) -> Result<Vec<Post>, sqlx::Error> {
        sqlx::query_as::<_, Post>(&format!(
            r#"
            SELECT {POST_COLUMNS} FROM posts
            WHERE group_id = $1 AND deleted_at IS NULL
                AND NOT (author_id = ANY($2))
            ORDER BY post_id ASC
            OFFSET $3 LIMIT $4
            "#
        ))
        .bind(group_id)
        .bind(excluded_authors)
        .bind(start)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn count_posts_before(&self, group_id: &str, post_id: i64) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM posts
            WHERE group_id = $1 AND post_id < $2 AND deleted_at IS NULL
            "#,
        )
        .bind(group_id)
        .bind(post_id)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("count")
    }

    async fn set_read_count(
        &self,
        group_id: &str,
        user_id: &str,
        read_count: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE participants SET read_count = $3
            WHERE group_id = $1 AND user_id = $2
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(read_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, display_name, password_hash, role FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn load_block_sets(&self, user_id: &str) -> Result<BlockSets, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT target_id, relation FROM user_relations WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut sets = BlockSets::default();
        for row in rows {
            let target: String = row.try_get("target_id")?;
            let relation: String = row.try_get("relation")?;
            match relation.as_str() {
                "block" => {
                    sets.blocked.insert(target);
                }
                "mute" => {
                    sets.muted.insert(target);
                }
                other => {
                    tracing::warn!("Unknown relation '{}' for user {}", other, user_id);
                }
            }
        }
        Ok(sets)
    }

    async fn insert_report(
        &self,
        reporter_id: &str,
        target_type: &str,
        target_id: &str,
        message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO reports (report_id, reporter_id, target_type, target_id, message, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(reporter_id)
        .bind(target_type)
        .bind(target_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
