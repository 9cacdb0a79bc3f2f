//! Login, logout and registration endpoints
//!
//! These are small request/reply exchanges: decode the form body, hit the
//! store, stage a JSON reply. They stay on the keep-alive path; only
//! malformed requests and store failures close the connection.

use log::{error, info};

use crate::connection::{Connection, StepContext, StepError};
use crate::http::request::{form_param, Request};
use crate::http::{response, Status};
use crate::store::StoreError;

const LOGIN_SUCCESS: &str = r#"{"success": true}"#;
const LOGIN_FAIL: &str = r#"{"success": false, "message": "Invalid credentials"}"#;
const LOGOUT_SUCCESS: &str = r#"{"success": true, "message": "Logged out"}"#;
const REGISTER_SUCCESS: &str = r#"{"success": true, "message": "User created"}"#;
const REGISTER_CONFLICT: &str = r#"{"success": false, "message": "Username already exists"}"#;

/// `POST /login`: verify credentials, mint a session, set the cookie.
pub fn login(conn: &mut Connection, req: &Request, ctx: &StepContext) -> Result<(), StepError> {
    let (username, password) = credentials(conn, req)?;

    match ctx.store.verify_user(&username, &password) {
        Ok(user_id) => {
            let session_id = ctx.sessions.create(user_id);
            info!("user {username} logged in");
            conn.stage_json(
                Status::Ok,
                LOGIN_SUCCESS,
                Some(&response::session_cookie(&session_id)),
                ctx,
            )
        }
        Err(StoreError::NotFound) => {
            conn.stage_json(Status::Unauthorized, LOGIN_FAIL, None, ctx)
        }
        Err(e) => {
            error!("login lookup failed: {e}");
            Err(StepError::Http(Status::InternalServerError))
        }
    }
}

/// `POST /logout`: drop the session and expire the cookie.
pub fn logout(conn: &mut Connection, req: &Request, ctx: &StepContext) -> Result<(), StepError> {
    if let Some(session_id) = req.session_id.as_deref() {
        ctx.sessions.remove(session_id);
        info!("session removed via logout");
    }

    conn.stage_json(
        Status::Ok,
        LOGOUT_SUCCESS,
        Some(&response::clear_session_cookie()),
        ctx,
    )
}

/// `POST /register`: create an account; duplicate usernames get a 409.
pub fn register(conn: &mut Connection, req: &Request, ctx: &StepContext) -> Result<(), StepError> {
    let (username, password) = credentials(conn, req)?;

    match ctx.store.create_user(&username, &password) {
        Ok(()) => {
            info!("new user registered: {username}");
            conn.stage_json(Status::Ok, REGISTER_SUCCESS, None, ctx)
        }
        Err(StoreError::Conflict) => {
            conn.stage_json(Status::Conflict, REGISTER_CONFLICT, None, ctx)
        }
        Err(e) => {
            error!("user creation failed: {e}");
            Err(StepError::Http(Status::InternalServerError))
        }
    }
}

// Both credential parameters are required; either missing is a 400. Copies
// the values out before the reply overwrites the request buffer.
fn credentials(conn: &Connection, req: &Request) -> Result<(String, String), StepError> {
    let body = conn.form_body(req);

    let username = form_param(body, "username").map(str::to_string);
    let password = form_param(body, "password").map(str::to_string);

    match (username, password) {
        (Some(u), Some(p)) => Ok((u, p)),
        _ => Err(StepError::Http(Status::BadRequest)),
    }
}
