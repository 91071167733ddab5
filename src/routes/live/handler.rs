use axum::{
    Extension,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::routes::group::model::has_detail_access;
use crate::utils::Claims;

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    pub group_id: String,
}

/// 订阅群组的实时事件。订阅时就做一次可见性检查，
/// 之后每次发布还会按当下状态复查。
#[axum::debug_handler]
pub async fn live_updates(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LiveQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let group = state
        .store
        .find_group(&query.group_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if !has_detail_access(state.store.as_ref(), &group, &claims).await? {
        return Err(AppError::Forbidden);
    }

    let group_id = group.group_id;
    let user_id = claims.sub;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, group_id, user_id)))
}

async fn handle_socket(state: AppState, socket: WebSocket, group_id: String, user_id: String) {
    let (conn_id, mut receiver) = state.fanout.subscribe(&group_id, &user_id).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = receiver.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Failed to serialize live event: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    // 推送单向通道：客户端除关闭外的消息一律忽略
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // 断开后必须注销，之后不会再向该连接投递
    state.fanout.unsubscribe(&group_id, conn_id).await;
}
