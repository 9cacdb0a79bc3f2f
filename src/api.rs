//! JSON APIs: the video listing and the resume-position endpoint

use log::error;

use crate::connection::{Connection, StepContext, StepError};
use crate::http::request::{form_param, Request};
use crate::http::Status;

const UNAUTHORIZED: &str = r#"{"success": false, "message": "Unauthorized"}"#;
const HISTORY_SUCCESS: &str = r#"{"success": true}"#;

/// `GET /api/videos`: the library joined with the user's resume positions.
/// Unauthenticated callers get a JSON 401 on the keep-alive path.
pub fn video_list(
    conn: &mut Connection,
    user: Option<i64>,
    ctx: &StepContext,
) -> Result<(), StepError> {
    let Some(user_id) = user else {
        return conn.stage_json(Status::Unauthorized, UNAUTHORIZED, None, ctx);
    };

    match ctx.store.video_list_json(user_id) {
        Ok(json) => conn.stage_json(Status::Ok, &json, None, ctx),
        Err(e) => {
            error!("video listing failed: {e}");
            Err(StepError::Http(Status::InternalServerError))
        }
    }
}

/// `POST /api/history`: record how far the user got in a video.
///
/// Acknowledged with 200 only after the store commit succeeds, so a 200
/// always means the position will survive a restart.
pub fn update_history(
    conn: &mut Connection,
    req: &Request,
    user: Option<i64>,
    ctx: &StepContext,
) -> Result<(), StepError> {
    let Some(user_id) = user else {
        return conn.stage_json(Status::Unauthorized, UNAUTHORIZED, None, ctx);
    };

    let body = conn.form_body(req);
    let video_id: i64 = match form_param(body, "video_id").and_then(|v| v.parse().ok()) {
        Some(id) => id,
        None => return Err(StepError::Http(Status::BadRequest)),
    };
    let position: i64 = match form_param(body, "timestamp").and_then(|v| v.parse().ok()) {
        Some(pos) => pos,
        None => return Err(StepError::Http(Status::BadRequest)),
    };

    match ctx.store.update_history(user_id, video_id, position) {
        Ok(()) => conn.stage_json(Status::Ok, HISTORY_SUCCESS, None, ctx),
        Err(e) => {
            error!("history update failed: {e}");
            Err(StepError::Http(Status::InternalServerError))
        }
    }
}
