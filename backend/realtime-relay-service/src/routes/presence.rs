use crate::error::AppResult;
use crate::state::AppState;
use actix_web::{get, web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    pub viewer_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewingResponse {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub viewing: bool,
}

#[get("/presence/{user_id}")]
pub async fn get_presence(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<PresenceQuery>,
) -> AppResult<HttpResponse> {
    let user_id = path.into_inner();
    let status = state
        .presence
        .status_for(state.directory.as_ref(), query.viewer_id, user_id)
        .await?;
    Ok(HttpResponse::Ok().json(status))
}

#[get("/presence/{user_id}/viewing/{conversation_id}")]
pub async fn get_viewing(
    state: web::Data<AppState>,
    path: web::Path<(Uuid, Uuid)>,
) -> AppResult<HttpResponse> {
    let (user_id, conversation_id) = path.into_inner();
    let viewing = state.presence.is_viewing(user_id, conversation_id).await?;
    Ok(HttpResponse::Ok().json(ViewingResponse {
        user_id,
        conversation_id,
        viewing,
    }))
}
