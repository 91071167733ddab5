use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::AppError;
use crate::routes::post::model::{PostInfo, PostWindow, list_posts};
use crate::store::{
    ChatGroup, ChatStore, GroupType, NewGroup, OpenGroupFilter, Participant, UserHeader,
};
use crate::utils::Claims;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub group_type: String,
    pub title: String,
    pub info: String,
    pub location: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub min_capacity: i32,
    pub max_capacity: i32,
    #[serde(default)]
    pub initial_users: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct GroupSummary {
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
    pub owner: UserHeader,
    pub participant_count: usize,
    pub post_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<i32>,
}

/// 按容量边界切分后的成员列表。打码后的长度和顺序保持不变，
/// 否则候补位计算就会错位。
#[derive(Debug, Serialize)]
pub struct MemberSections {
    pub active: Vec<UserHeader>,
    pub waitlist: Vec<UserHeader>,
}

#[derive(Debug, Serialize)]
pub struct GroupDetail {
    #[serde(flatten)]
    pub summary: GroupSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<MemberSections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posts: Option<Vec<PostInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_count: Option<i32>,
}

/// 成员列表打码：观看者屏蔽的用户换成占位身份而不是剔除
pub fn mask_members(ordered: &[UserHeader], viewer_blocked: &HashSet<String>) -> Vec<UserHeader> {
    ordered
        .iter()
        .map(|header| {
            if viewer_blocked.contains(&header.user_id) {
                UserHeader::masked()
            } else {
                header.clone()
            }
        })
        .collect()
}

/// 容量切分：数组前 max_capacity 位是正式成员，其余是候补。
/// max_capacity 为 0 表示不限容量。
pub fn split_capacity(mut members: Vec<UserHeader>, max_capacity: i32) -> MemberSections {
    if max_capacity <= 0 {
        return MemberSections {
            active: members,
            waitlist: Vec::new(),
        };
    }
    let cut = members.len().min(max_capacity as usize);
    let waitlist = members.split_off(cut);
    MemberSections {
        active: members,
        waitlist,
    }
}

/// 统一的详情可见性门槛：成员可见；
/// 版主及以上对非私密群组也可见
pub async fn has_detail_access(
    store: &dyn ChatStore,
    group: &ChatGroup,
    claims: &Claims,
) -> Result<bool, AppError> {
    if store
        .find_participant(&group.group_id, &claims.sub)
        .await?
        .is_some()
    {
        return Ok(true);
    }
    Ok(claims.is_moderator() && !group.group_type()?.is_private())
}

/// 双向屏蔽检查。任意一方屏蔽另一方都按资源不存在处理
async fn blocks_between(state: &AppState, a: &str, b: &str) -> Result<bool, AppError> {
    let a_sets = state.cache.block_sets(state.store.as_ref(), a).await?;
    if a_sets.blocked.contains(b) {
        return Ok(true);
    }
    let b_sets = state.cache.block_sets(state.store.as_ref(), b).await?;
    Ok(b_sets.blocked.contains(a))
}

async fn resolve_header(state: &AppState, user_id: &str) -> Result<UserHeader, AppError> {
    let header = state
        .cache
        .user_header(state.store.as_ref(), user_id)
        .await?
        .unwrap_or_else(|| UserHeader {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
        });
    Ok(header)
}

async fn summarize(
    state: &AppState,
    group: &ChatGroup,
    pivot: Option<&Participant>,
) -> Result<GroupSummary, AppError> {
    let owner = resolve_header(state, &group.owner_id).await?;
    let unread_count = pivot
        .map(|p| (group.post_count - p.read_count - p.hidden_count).max(0));
    Ok(GroupSummary {
        group_id: group.group_id.clone(),
        group_type: group.group_type.clone(),
        title: group.title.clone(),
        info: group.info.clone(),
        location: group.location.clone(),
        start_time: group.start_time,
        end_time: group.end_time,
        min_capacity: group.min_capacity,
        max_capacity: group.max_capacity,
        cancelled: group.cancelled,
        owner,
        participant_count: group.participant_array.len(),
        post_count: group.post_count,
        unread_count,
    })
}

/// 组装群组详情。成员列表与帖子只对通过可见性门槛的观看者展开
async fn build_detail(
    state: &AppState,
    group: &ChatGroup,
    claims: &Claims,
    window: PostWindow,
) -> Result<GroupDetail, AppError> {
    let mut pivot = state
        .store
        .find_participant(&group.group_id, &claims.sub)
        .await?;
    let visible =
        pivot.is_some() || (claims.is_moderator() && !group.group_type()?.is_private());

    let mut members = None;
    let mut posts = None;
    if visible {
        let viewer_sets = state
            .cache
            .block_sets(state.store.as_ref(), &claims.sub)
            .await?;
        let mut headers = Vec::with_capacity(group.participant_array.len());
        for user_id in &group.participant_array {
            headers.push(resolve_header(state, user_id).await?);
        }
        let masked = mask_members(&headers, &viewer_sets.blocked);
        members = Some(split_capacity(masked, group.max_capacity));

        posts = Some(list_posts(state, claims, group, window).await?);
        // list_posts 可能推进了已读数，重新取计数记录
        pivot = state
            .store
            .find_participant(&group.group_id, &claims.sub)
            .await?;
    }

    let summary = summarize(state, group, pivot.as_ref()).await?;
    Ok(GroupDetail {
        summary,
        members,
        posts,
        read_count: pivot.as_ref().map(|p| p.read_count),
        hidden_count: pivot.as_ref().map(|p| p.hidden_count),
    })
}

pub async fn create_group(
    state: &AppState,
    claims: &Claims,
    req: CreateGroupRequest,
) -> Result<GroupDetail, AppError> {
    let group_type = GroupType::parse(&req.group_type)
        .map_err(|_| AppError::InvalidContent("未知的群组类型"))?;
    if req.title.trim().is_empty() {
        return Err(AppError::InvalidContent("标题不能为空"));
    }
    if req.min_capacity < 0 || req.max_capacity < 0 {
        return Err(AppError::InvalidContent("容量不能为负数"));
    }
    if req.max_capacity > 0 && req.min_capacity > req.max_capacity {
        return Err(AppError::InvalidContent("最小容量不能大于最大容量"));
    }

    // 创建者自动成为第一个成员；初始成员去重，
    // 与创建者存在屏蔽关系的直接略过
    let mut participant_array = vec![claims.sub.clone()];
    for user_id in &req.initial_users {
        if participant_array.contains(user_id) {
            continue;
        }
        if state.store.find_user(user_id).await?.is_none() {
            return Err(AppError::NotFound);
        }
        if blocks_between(state, &claims.sub, user_id).await? {
            continue;
        }
        participant_array.push(user_id.clone());
    }

    let new_group = NewGroup {
        group_id: Uuid::new_v4().to_string(),
        group_type: group_type.as_str().to_string(),
        title: req.title,
        info: req.info,
        location: req.location,
        start_time: req.start_time,
        end_time: req.end_time,
        min_capacity: req.min_capacity,
        max_capacity: req.max_capacity,
        owner_id: claims.sub.clone(),
        participant_array,
    };
    let group = state.store.insert_group(&new_group).await?;

    build_detail(state, &group, claims, PostWindow::default()).await
}

pub async fn join_group(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
) -> Result<GroupDetail, AppError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;

    if group.is_member(&claims.sub) {
        return Err(AppError::AlreadyMember);
    }
    if blocks_between(state, &group.owner_id, &claims.sub).await? {
        return Err(AppError::Unavailable);
    }
    if !group.group_type()?.allows_self_service() {
        return Err(AppError::InvalidOperation("该群组类型不允许自行加入"));
    }

    // 加入前就存在的帖子里，凡是被自己屏蔽/静音的作者发的，
    // 直接记入 hidden_count
    let joiner_sets = state
        .cache
        .block_sets(state.store.as_ref(), &claims.sub)
        .await?;
    let hidden = state
        .store
        .count_posts_by_authors(group_id, &joiner_sets.excluded_authors())
        .await? as i32;

    state
        .store
        .add_participant(group_id, &claims.sub, hidden)
        .await?;

    let header = resolve_header(state, &claims.sub).await?;
    state
        .fanout
        .publish_membership_change(state.store.as_ref(), &state.cache, group_id, &header, true)
        .await;
    state.notifier.clear_unread(&claims.sub, group_id).await;

    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    build_detail(state, &group, claims, PostWindow::default()).await
}

pub async fn unjoin_group(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
) -> Result<GroupDetail, AppError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;

    if !group.group_type()?.allows_self_service() {
        return Err(AppError::InvalidOperation("该群组类型不允许退出"));
    }
    if !group.is_member(&claims.sub) {
        return Err(AppError::NotMember);
    }

    state.store.remove_participant(group_id, &claims.sub).await?;

    let header = resolve_header(state, &claims.sub).await?;
    state
        .fanout
        .publish_membership_change(state.store.as_ref(), &state.cache, group_id, &header, false)
        .await;
    state.notifier.clear_unread(&claims.sub, group_id).await;

    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    build_detail(state, &group, claims, PostWindow::default()).await
}

pub async fn add_member(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
    target_user: &str,
) -> Result<GroupDetail, AppError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if group.owner_id != claims.sub {
        return Err(AppError::Forbidden);
    }
    if state.store.find_user(target_user).await?.is_none() {
        return Err(AppError::NotFound);
    }
    if group.is_member(target_user) {
        return Err(AppError::AlreadyMember);
    }
    if blocks_between(state, &group.owner_id, target_user).await? {
        return Err(AppError::Unavailable);
    }

    let target_sets = state
        .cache
        .block_sets(state.store.as_ref(), target_user)
        .await?;
    let hidden = state
        .store
        .count_posts_by_authors(group_id, &target_sets.excluded_authors())
        .await? as i32;

    state
        .store
        .add_participant(group_id, target_user, hidden)
        .await?;

    let header = resolve_header(state, target_user).await?;
    state
        .fanout
        .publish_membership_change(state.store.as_ref(), &state.cache, group_id, &header, true)
        .await;

    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    build_detail(state, &group, claims, PostWindow::default()).await
}

pub async fn remove_member(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
    target_user: &str,
) -> Result<GroupDetail, AppError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if group.owner_id != claims.sub {
        return Err(AppError::Forbidden);
    }
    if !group.is_member(target_user) {
        return Err(AppError::NotMember);
    }

    state.store.remove_participant(group_id, target_user).await?;

    let header = resolve_header(state, target_user).await?;
    state
        .fanout
        .publish_membership_change(state.store.as_ref(), &state.cache, group_id, &header, false)
        .await;
    state.notifier.clear_unread(target_user, group_id).await;

    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    build_detail(state, &group, claims, PostWindow::default()).await
}

pub async fn cancel_group(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
) -> Result<GroupDetail, AppError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if group.owner_id != claims.sub {
        return Err(AppError::Forbidden);
    }
    state.store.set_cancelled(group_id).await?;

    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    build_detail(state, &group, claims, PostWindow::default()).await
}

pub async fn group_detail(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
    window: PostWindow,
) -> Result<GroupDetail, AppError> {
    let group = state
        .store
        .find_group(group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if group.owner_id != claims.sub
        && blocks_between(state, &group.owner_id, &claims.sub).await?
    {
        return Err(AppError::Unavailable);
    }
    build_detail(state, &group, claims, window).await
}

pub async fn list_open_groups(
    state: &AppState,
    claims: &Claims,
    group_type: Option<String>,
    day: Option<NaiveDate>,
    start: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<GroupSummary>, AppError> {
    let group_type = match group_type {
        Some(value) => {
            let parsed = GroupType::parse(&value)
                .map_err(|_| AppError::InvalidContent("未知的群组类型"))?;
            Some(parsed.as_str().to_string())
        }
        None => None,
    };
    let filter = OpenGroupFilter {
        group_type,
        day,
        start: start.unwrap_or(0).max(0),
        limit: limit
            .unwrap_or(state.config.post_page_limit)
            .clamp(1, state.config.post_page_limit),
    };
    let groups = state.store.list_open_groups(&filter).await?;

    let mut summaries = Vec::with_capacity(groups.len());
    for group in groups {
        // 与群主存在屏蔽关系的群组不出现在列表里
        if group.owner_id != claims.sub
            && blocks_between(state, &group.owner_id, &claims.sub).await?
        {
            continue;
        }
        let pivot = state
            .store
            .find_participant(&group.group_id, &claims.sub)
            .await?;
        summaries.push(summarize(state, &group, pivot.as_ref()).await?);
    }
    Ok(summaries)
}

pub async fn list_joined_groups(
    state: &AppState,
    claims: &Claims,
    group_type: Option<String>,
    start: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<GroupSummary>, AppError> {
    let joined = state
        .store
        .list_joined_groups(
            &claims.sub,
            group_type.as_deref(),
            start.unwrap_or(0).max(0),
            limit
                .unwrap_or(state.config.post_page_limit)
                .clamp(1, state.config.post_page_limit),
        )
        .await?;

    let mut summaries = Vec::with_capacity(joined.len());
    for entry in joined {
        summaries.push(summarize(state, &entry.group, Some(&entry.pivot)).await?);
    }
    Ok(summaries)
}

pub async fn list_owned_groups(
    state: &AppState,
    claims: &Claims,
    group_type: Option<String>,
    start: Option<i64>,
    limit: Option<i64>,
) -> Result<Vec<GroupSummary>, AppError> {
    let owned = state
        .store
        .list_owned_groups(
            &claims.sub,
            group_type.as_deref(),
            start.unwrap_or(0).max(0),
            limit
                .unwrap_or(state.config.post_page_limit)
                .clamp(1, state.config.post_page_limit),
        )
        .await?;

    let mut summaries = Vec::with_capacity(owned.len());
    for group in owned {
        let pivot = state
            .store
            .find_participant(&group.group_id, &claims.sub)
            .await?;
        summaries.push(summarize(state, &group, pivot.as_ref()).await?);
    }
    Ok(summaries)
}

pub async fn report_group(
    state: &AppState,
    claims: &Claims,
    group_id: &str,
    message: Option<&str>,
) -> Result<(), AppError> {
    if state.store.find_group(group_id).await?.is_none() {
        return Err(AppError::NotFound);
    }
    state
        .store
        .insert_report(&claims.sub, "chat_group", group_id, message)
        .await?;
    Ok(())
}
