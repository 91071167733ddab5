use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::routes::group::model::has_detail_access;
use crate::store::{ChatGroup, Post, UserHeader};
use crate::utils::Claims;

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub group_id: String,
    pub text: String,
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PostInfo {
    pub post_id: i64,
    pub group_id: String,
    pub author: UserHeader,
    pub text: String,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 帖子读取窗口。不指定起点时从观看者上次读到的位置附近续读
#[derive(Debug, Clone, Copy, Default)]
pub struct PostWindow {
    pub start: Option<i64>,
    pub limit: Option<i64>,
}

async fn post_info(state: &AppState, post: Post) -> Result<PostInfo, AppError> {
    let author = state
        .cache
        .user_header(state.store.as_ref(), &post.author_id)
        .await?
        .unwrap_or_else(|| UserHeader {
            user_id: post.author_id.clone(),
            display_name: post.author_id.clone(),
        });
    Ok(PostInfo {
        post_id: post.post_id,
        group_id: post.group_id,
        author,
        text: post.text,
        image: post.image,
        created_at: post.created_at,
    })
}

pub async fn add_post(
    state: &AppState,
    claims: &Claims,
    req: CreatePostRequest,
) -> Result<PostInfo, AppError> {
    let group = state
        .store
        .find_group(&req.group_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let pivot = state
        .store
        .find_participant(&group.group_id, &claims.sub)
        .await?;
    if pivot.is_none() && !claims.is_moderator() {
        return Err(AppError::Forbidden);
    }
    if group.owner_id != claims.sub {
        let owner_sets = state
            .cache
            .block_sets(state.store.as_ref(), &group.owner_id)
            .await?;
        let author_sets = state
            .cache
            .block_sets(state.store.as_ref(), &claims.sub)
            .await?;
        if owner_sets.blocked.contains(&claims.sub) || author_sets.blocked.contains(&group.owner_id)
        {
            return Err(AppError::Unavailable);
        }
    }
    if group.posting_locked() {
        return Err(AppError::Locked);
    }

    if req.text.trim().is_empty() {
        return Err(AppError::InvalidContent("帖子内容不能为空"));
    }
    if req.text.chars().count() > state.config.max_post_length {
        return Err(AppError::InvalidContent("帖子内容过长"));
    }
    let image_count = usize::from(req.image.is_some());
    if image_count > group.group_type()?.max_images() {
        return Err(AppError::InvalidContent("该群组类型不允许携带这么多图片"));
    }

    // 先算出哪些成员屏蔽了作者：他们的 hidden_count 在写入事务里自增，
    // 其余非作者成员在提交后收到未读通知
    let members = state.store.list_participants(&group.group_id).await?;
    let mut hidden_from = Vec::new();
    let mut to_notify = Vec::new();
    for member in &members {
        if member.user_id == claims.sub {
            continue;
        }
        let sets = state
            .cache
            .block_sets(state.store.as_ref(), &member.user_id)
            .await?;
        if sets.hides(&claims.sub) {
            hidden_from.push(member.user_id.clone());
        } else {
            to_notify.push(member.user_id.clone());
        }
    }

    let post = state
        .store
        .insert_post(
            &group.group_id,
            &claims.sub,
            req.text.trim(),
            req.image.as_deref(),
            &hidden_from,
        )
        .await?;

    for user_id in &to_notify {
        state.notifier.increment_unread(user_id, &group.group_id).await;
    }
    state
        .fanout
        .publish_post(state.store.as_ref(), &state.cache, &group.group_id, &post)
        .await;

    post_info(state, post).await
}

pub async fn delete_post(
    state: &AppState,
    claims: &Claims,
    post_id: i64,
) -> Result<(), AppError> {
    let post = state
        .store
        .find_post(post_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if post.author_id != claims.sub && !claims.is_moderator() {
        return Err(AppError::Forbidden);
    }

    // 被删帖子的 0 起始位置：ID 更小的存活帖子数
    let post_index = state
        .store
        .count_posts_before(&post.group_id, post.post_id)
        .await?;

    let members = state.store.list_participants(&post.group_id).await?;
    let mut hidden_for = Vec::new();
    let mut to_decrement = Vec::new();
    for member in &members {
        let sets = state
            .cache
            .block_sets(state.store.as_ref(), &member.user_id)
            .await?;
        if sets.hides(&post.author_id) {
            hidden_for.push(member.user_id.clone());
        } else if i64::from(member.read_count) <= post_index && member.user_id != claims.sub {
            // 计数不需要调整的成员，少了一条没读过的帖子
            to_decrement.push(member.user_id.clone());
        }
    }

    state.store.delete_post(&post, post_index, &hidden_for).await?;

    for user_id in &to_decrement {
        state.notifier.decrement_unread(user_id, &post.group_id).await;
    }
    Ok(())
}

/// 读取帖子窗口并推进观看者的已读位置。
/// 静音词过滤特意不用在这里：群聊内容只受用户级屏蔽/静音影响。
pub async fn list_posts(
    state: &AppState,
    claims: &Claims,
    group: &ChatGroup,
    window: PostWindow,
) -> Result<Vec<PostInfo>, AppError> {
    if !has_detail_access(state.store.as_ref(), group, claims).await? {
        return Err(AppError::Forbidden);
    }

    let viewer_sets = state
        .cache
        .block_sets(state.store.as_ref(), &claims.sub)
        .await?;
    let pivot = state
        .store
        .find_participant(&group.group_id, &claims.sub)
        .await?;

    let limit = window
        .limit
        .unwrap_or(state.config.post_page_limit)
        .clamp(1, state.config.post_page_limit);
    let read_count = pivot.as_ref().map_or(0, |p| i64::from(p.read_count));
    // 默认从上次读到的那一页开始续读
    let start = window
        .start
        .unwrap_or_else(|| ((read_count - 1).max(0) / limit) * limit)
        .max(0);

    let posts = state
        .store
        .list_posts(
            &group.group_id,
            &viewer_sets.excluded_authors(),
            start,
            limit,
        )
        .await?;

    let mut headers: HashMap<String, UserHeader> = HashMap::new();
    let mut infos = Vec::with_capacity(posts.len());
    for post in posts {
        let author = match headers.get(&post.author_id) {
            Some(header) => header.clone(),
            None => {
                let header = state
                    .cache
                    .user_header(state.store.as_ref(), &post.author_id)
                    .await?
                    .unwrap_or_else(|| UserHeader {
                        user_id: post.author_id.clone(),
                        display_name: post.author_id.clone(),
                    });
                headers.insert(post.author_id.clone(), header.clone());
                header
            }
        };
        infos.push(PostInfo {
            post_id: post.post_id,
            group_id: post.group_id,
            author,
            text: post.text,
            image: post.image,
            created_at: post.created_at,
        });
    }

    // 窗口越过已读位置时推进 read_count；重复读同一窗口不再变化
    if let Some(pivot) = &pivot {
        let end = start + limit;
        if end > i64::from(pivot.read_count) {
            let visible_total = i64::from(group.post_count - pivot.hidden_count);
            let new_read = end.min(visible_total).max(i64::from(pivot.read_count));
            if new_read > i64::from(pivot.read_count) {
                state
                    .store
                    .set_read_count(&group.group_id, &claims.sub, new_read as i32)
                    .await?;
            }
            if new_read >= visible_total {
                state.notifier.mark_viewed(&claims.sub, &group.group_id).await;
            }
        }
    }

    Ok(infos)
}

pub async fn report_post(
    state: &AppState,
    claims: &Claims,
    post_id: i64,
    message: Option<&str>,
) -> Result<(), AppError> {
    if state.store.find_post(post_id).await?.is_none() {
        return Err(AppError::NotFound);
    }
    state
        .store
        .insert_report(&claims.sub, "post", &post_id.to_string(), message)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::store::mem::{MemStore, test_claims, test_state};
    use crate::store::{BlockSets, ChatStore, NewGroup};

    fn blocks(targets: &[&str]) -> BlockSets {
        BlockSets {
            blocked: targets.iter().map(|t| t.to_string()).collect(),
            muted: HashSet::new(),
        }
    }

    fn mutes(targets: &[&str]) -> BlockSets {
        BlockSets {
            blocked: HashSet::new(),
            muted: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    async fn setup(group_type: &str, members: &[&str]) -> (Arc<MemStore>, crate::AppState, String) {
        let store = Arc::new(MemStore::new());
        for id in ["alice", "bob", "carol", "dave"] {
            store.add_user(id, id, "user");
        }
        store.add_user("heidi", "heidi", "moderator");
        let group = NewGroup {
            group_id: "g1".into(),
            group_type: group_type.into(),
            title: "夜间闲聊".into(),
            info: String::new(),
            location: None,
            start_time: None,
            end_time: None,
            min_capacity: 0,
            max_capacity: 0,
            owner_id: members[0].to_string(),
            participant_array: members.iter().map(|s| s.to_string()).collect(),
        };
        store.insert_group(&group).await.unwrap();
        let state = test_state(store.clone());
        (store, state, "g1".into())
    }

    fn post_req(group_id: &str, text: &str) -> CreatePostRequest {
        CreatePostRequest {
            group_id: group_id.into(),
            text: text.into(),
            image: None,
        }
    }

    async fn assert_counter_invariant(store: &MemStore, group_id: &str) {
        let group = store.find_group(group_id).await.unwrap().unwrap();
        for pivot in store.list_participants(group_id).await.unwrap() {
            assert!(
                pivot.read_count + pivot.hidden_count <= group.post_count,
                "counter invariant broken for {}: {} + {} > {}",
                pivot.user_id,
                pivot.read_count,
                pivot.hidden_count,
                group.post_count
            );
        }
    }

    #[tokio::test]
    async fn post_hidden_from_blocking_member() {
        let (store, state, group_id) = setup("open", &["alice", "bob", "carol"]).await;
        store.set_blocks("bob", blocks(&["alice"]));

        let alice = test_claims("alice", "user");
        add_post(&state, &alice, post_req(&group_id, "大家好")).await.unwrap();

        let bob = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.hidden_count, 1);
        assert_eq!(bob.read_count, 0);

        let carol = store.find_participant(&group_id, "carol").await.unwrap().unwrap();
        assert_eq!(carol.hidden_count, 0);
        assert_eq!(carol.read_count, 0);

        // 作者的已读数推进到自己可见的末尾
        let alice_pivot = store.find_participant(&group_id, "alice").await.unwrap().unwrap();
        let group = store.find_group(&group_id).await.unwrap().unwrap();
        assert_eq!(alice_pivot.read_count, group.post_count - alice_pivot.hidden_count);

        assert_counter_invariant(&store, &group_id).await;
    }

    #[tokio::test]
    async fn muted_author_also_hidden() {
        let (store, state, group_id) = setup("open", &["alice", "bob"]).await;
        store.set_blocks("bob", mutes(&["alice"]));

        let alice = test_claims("alice", "user");
        add_post(&state, &alice, post_req(&group_id, "喂喂")).await.unwrap();

        let bob = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.hidden_count, 1);
        assert_counter_invariant(&store, &group_id).await;
    }

    #[tokio::test]
    async fn delete_shifts_read_counts_past_position() {
        let (store, state, group_id) = setup("open", &["alice", "bob", "carol"]).await;
        let alice = test_claims("alice", "user");
        let mut post_ids = Vec::new();
        for i in 0..5 {
            let info = add_post(&state, &alice, post_req(&group_id, &format!("第{}条", i)))
                .await
                .unwrap();
            post_ids.push(info.post_id);
        }
        store.set_read_count(&group_id, "bob", 5).await.unwrap();
        store.set_read_count(&group_id, "carol", 2).await.unwrap();

        // 版主删掉位置 3（0 起始）的帖子
        let heidi = test_claims("heidi", "moderator");
        delete_post(&state, &heidi, post_ids[3]).await.unwrap();

        let group = store.find_group(&group_id).await.unwrap().unwrap();
        assert_eq!(group.post_count, 4);
        let bob = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.read_count, 4);
        let carol = store.find_participant(&group_id, "carol").await.unwrap().unwrap();
        assert_eq!(carol.read_count, 2);
        assert_counter_invariant(&store, &group_id).await;
    }

    #[tokio::test]
    async fn delete_decrements_hidden_count_for_hiding_members() {
        let (store, state, group_id) = setup("open", &["alice", "bob"]).await;
        store.set_blocks("bob", blocks(&["alice"]));

        let alice = test_claims("alice", "user");
        let info = add_post(&state, &alice, post_req(&group_id, "看不见我")).await.unwrap();
        let bob = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.hidden_count, 1);

        delete_post(&state, &alice, info.post_id).await.unwrap();
        let bob = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(bob.hidden_count, 0);
        assert_counter_invariant(&store, &group_id).await;
    }

    #[tokio::test]
    async fn delete_requires_author_or_moderator() {
        let (_store, state, group_id) = setup("open", &["alice", "bob"]).await;
        let alice = test_claims("alice", "user");
        let info = add_post(&state, &alice, post_req(&group_id, "别动我的帖子")).await.unwrap();

        let bob = test_claims("bob", "user");
        let err = delete_post(&state, &bob, info.post_id).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn list_posts_advances_read_count_idempotently() {
        let (store, state, group_id) = setup("open", &["alice", "bob"]).await;
        let alice = test_claims("alice", "user");
        for i in 0..3 {
            add_post(&state, &alice, post_req(&group_id, &format!("第{}条", i)))
                .await
                .unwrap();
        }

        let bob = test_claims("bob", "user");
        let group = store.find_group(&group_id).await.unwrap().unwrap();
        let posts = list_posts(&state, &bob, &group, PostWindow::default()).await.unwrap();
        assert_eq!(posts.len(), 3);
        let pivot = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(pivot.read_count, 3);

        // 同一窗口再读一次，read_count 不再变化
        let group = store.find_group(&group_id).await.unwrap().unwrap();
        list_posts(&state, &bob, &group, PostWindow::default()).await.unwrap();
        let pivot = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(pivot.read_count, 3);
        assert_counter_invariant(&store, &group_id).await;
    }

    #[tokio::test]
    async fn list_posts_excludes_blocked_authors_and_caps_read() {
        let (store, state, group_id) = setup("open", &["alice", "bob", "carol"]).await;
        store.set_blocks("bob", blocks(&["alice"]));

        let alice = test_claims("alice", "user");
        add_post(&state, &alice, post_req(&group_id, "一")).await.unwrap();
        add_post(&state, &alice, post_req(&group_id, "二")).await.unwrap();
        let carol = test_claims("carol", "user");
        add_post(&state, &carol, post_req(&group_id, "三")).await.unwrap();

        let bob = test_claims("bob", "user");
        let group = store.find_group(&group_id).await.unwrap().unwrap();
        let posts = list_posts(&state, &bob, &group, PostWindow::default()).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].author.user_id, "carol");

        // read_count 封顶在 post_count - hidden_count
        let pivot = store.find_participant(&group_id, "bob").await.unwrap().unwrap();
        assert_eq!(pivot.read_count, 1);
        assert_eq!(pivot.hidden_count, 2);
        assert_counter_invariant(&store, &group_id).await;
    }

    #[tokio::test]
    async fn list_posts_requires_visibility() {
        let (store, state, group_id) = setup("open", &["alice"]).await;
        let group = store.find_group(&group_id).await.unwrap().unwrap();
        let dave = test_claims("dave", "user");
        let err = list_posts(&state, &dave, &group, PostWindow::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn add_post_policy_violations() {
        let (store, state, group_id) = setup("closed", &["alice", "bob"]).await;
        let alice = test_claims("alice", "user");

        // 私密群组不允许带图
        let mut req = post_req(&group_id, "带图的");
        req.image = Some("photo.jpg".into());
        let err = add_post(&state, &alice, req).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidContent(_)));

        // 空文本
        let err = add_post(&state, &alice, post_req(&group_id, "   ")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidContent(_)));

        // 非成员且非版主
        let dave = test_claims("dave", "user");
        let err = add_post(&state, &dave, post_req(&group_id, "我进不来")).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        // 锁定的群组禁止发帖
        store.set_moderation_status(&group_id, "locked");
        let err = add_post(&state, &alice, post_req(&group_id, "锁了")).await.unwrap_err();
        assert!(matches!(err, AppError::Locked));
    }

    #[tokio::test]
    async fn owner_block_makes_posting_unavailable() {
        let (store, state, group_id) = setup("open", &["alice", "bob"]).await;
        store.set_blocks("alice", blocks(&["bob"]));

        let bob = test_claims("bob", "user");
        let err = add_post(&state, &bob, post_req(&group_id, "你好")).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable));
    }
}
