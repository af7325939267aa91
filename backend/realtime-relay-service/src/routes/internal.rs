//! Push endpoints for the services that own chat data, e.g. fanning out a
//! freshly stored message.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::websocket::message_types::ServerFrame;
use actix_web::{post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPush {
    pub event: ServerFrame,
    #[serde(default, alias = "exclude_user_id")]
    pub exclude_user_id: Option<Uuid>,
}

fn authorize(req: &HttpRequest, state: &AppState) -> AppResult<()> {
    let Some(expected) = state.config.internal_api_token.as_deref() else {
        return Ok(());
    };
    let presented = req
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(AppError::Unauthorized)
    }
}

#[post("/internal/users/{user_id}/events")]
pub async fn push_to_user(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ServerFrame>,
) -> AppResult<HttpResponse> {
    authorize(&req, &state)?;
    let user_id = path.into_inner();
    let frame = body.into_inner();
    tracing::debug!(%user_id, kind = frame.kind(), "internal push to user");

    state.registry.broadcast_to_user(user_id, frame).await;
    Ok(HttpResponse::Accepted().finish())
}

#[post("/internal/conversations/{conversation_id}/events")]
pub async fn push_to_conversation(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ConversationPush>,
) -> AppResult<HttpResponse> {
    authorize(&req, &state)?;
    let conversation_id = path.into_inner();
    let ConversationPush {
        event,
        exclude_user_id,
    } = body.into_inner();
    tracing::debug!(%conversation_id, kind = event.kind(), "internal push to conversation");

    state
        .registry
        .broadcast_to_conversation(conversation_id, event, exclude_user_id)
        .await;
    Ok(HttpResponse::Accepted().finish())
}
