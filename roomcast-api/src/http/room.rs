//! Read-only room inspection

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use roomcast_sfu::{ConnectionId, RoomName};
use serde::Serialize;

use crate::http::{AppError, AppResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub name: RoomName,
    pub members: Vec<ConnectionId>,
    pub created_at: DateTime<Utc>,
}

pub fn create_room_router() -> Router<AppState> {
    Router::new().route("/api/rooms/{room}", get(get_room))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> AppResult<Json<RoomSummary>> {
    let name = RoomName::new(room);
    let room = state
        .manager
        .room(&name)
        .ok_or_else(|| AppError::not_found(format!("Room {name} not found")))?;

    Ok(Json(RoomSummary {
        name,
        members: room.members(),
        created_at: room.created_at,
    }))
}
