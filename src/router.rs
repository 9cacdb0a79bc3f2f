//! Request routing
//!
//! Routing is a pure function from method and target to a [`Route`]; it
//! never touches the filesystem. The traversal guard in particular must
//! reject `..` before any path is built, so a hostile target is refused
//! without a single syscall.

use std::path::PathBuf;

use crate::http::Method;

/// Extensions served from the `static/` tree.
const STATIC_EXTENSIONS: [&str; 6] = ["html", "css", "js", "png", "jpg", "ico"];

/// Where a request is dispatched.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    /// `POST /login`
    Login,
    /// `POST /logout`
    Logout,
    /// `POST /register`
    Register,
    /// `POST /api/history`
    History,
    /// `GET /api/videos`, session-gated.
    VideoList,
    /// An MP4 byte-range stream, session-gated. Path is relative to the
    /// configured document root.
    Stream(PathBuf),
    /// A static asset, relative to the configured document root.
    Static(PathBuf),
    /// The target tried to escape the document tree.
    Forbidden,
    /// Nothing matched.
    NotFound,
    /// The method is recognized or valid but not served here.
    MethodNotAllowed,
}

impl Route {
    /// Whether this route refuses unauthenticated requests outright.
    ///
    /// `/api/history` also requires a session, but checks it in its
    /// handler so it can answer with a JSON body.
    pub fn requires_session(&self) -> bool {
        matches!(self, Route::VideoList | Route::Stream(_))
    }
}

/// Resolves `target` to a route. First match wins.
pub fn route(method: Method, target: &str) -> Route {
    if target.contains("..") {
        return Route::Forbidden;
    }

    match (method, target) {
        (Method::Post, "/login") => return Route::Login,
        (Method::Post, "/logout") => return Route::Logout,
        (Method::Post, "/register") => return Route::Register,
        (Method::Post, "/api/history") => return Route::History,
        (Method::Get, "/api/videos") => return Route::VideoList,
        (Method::Get, _) => {}
        (Method::Post, _) => return Route::NotFound,
        (Method::Options | Method::Unknown, _) => return Route::MethodNotAllowed,
    }

    let path = normalize(target);

    match extension(&path) {
        Some("mp4") => Route::Stream(PathBuf::from(path)),
        Some(ext) if STATIC_EXTENSIONS.contains(&ext) => Route::Static(PathBuf::from(path)),
        _ => Route::NotFound,
    }
}

// `/` serves the app shell; bare asset names live under `static/`; anything
// else resolves relative to the document root as sent.
fn normalize(target: &str) -> String {
    if target == "/" {
        return "static/index.html".to_string();
    }

    let relative = target.strip_prefix('/').unwrap_or(target);

    if let Some(ext) = extension(relative) {
        if STATIC_EXTENSIONS.contains(&ext) && !relative.starts_with("static/") {
            return format!("static/{relative}");
        }
    }

    relative.to_string()
}

fn extension(path: &str) -> Option<&str> {
    let dot = path.rfind('.')?;
    Some(&path[dot + 1..])
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::{route, Route};
    use crate::http::Method;

    #[test]
    fn traversal_is_forbidden_before_anything_else() {
        assert_eq!(Route::Forbidden, route(Method::Get, "/../etc/passwd"));
        assert_eq!(Route::Forbidden, route(Method::Get, "/static/../../secret.mp4"));
        assert_eq!(Route::Forbidden, route(Method::Post, "/login/../x"));
    }

    #[test]
    fn auth_and_api_endpoints_dispatch_by_method_and_path() {
        assert_eq!(Route::Login, route(Method::Post, "/login"));
        assert_eq!(Route::Logout, route(Method::Post, "/logout"));
        assert_eq!(Route::Register, route(Method::Post, "/register"));
        assert_eq!(Route::History, route(Method::Post, "/api/history"));
        assert_eq!(Route::VideoList, route(Method::Get, "/api/videos"));
        // The JSON APIs are not file paths.
        assert_eq!(Route::NotFound, route(Method::Post, "/api/videos"));
    }

    #[test]
    fn root_serves_the_app_shell() {
        assert_eq!(
            Route::Static(PathBuf::from("static/index.html")),
            route(Method::Get, "/")
        );
    }

    #[test]
    fn bare_asset_names_map_under_the_static_tree() {
        assert_eq!(
            Route::Static(PathBuf::from("static/app.js")),
            route(Method::Get, "/app.js")
        );
        assert_eq!(
            Route::Static(PathBuf::from("static/style.css")),
            route(Method::Get, "/style.css")
        );
        // An explicit static/ prefix is not doubled.
        assert_eq!(
            Route::Static(PathBuf::from("static/favicon.ico")),
            route(Method::Get, "/static/favicon.ico")
        );
    }

    #[test]
    fn mp4_targets_stream_and_are_session_gated() {
        let route = route(Method::Get, "/media/intro.mp4");
        assert_eq!(Route::Stream(PathBuf::from("media/intro.mp4")), route);
        assert!(route.requires_session());
    }

    #[test]
    fn unrouted_paths_are_not_found() {
        assert_eq!(Route::NotFound, route(Method::Get, "/archive.tar.gz"));
        assert_eq!(Route::NotFound, route(Method::Get, "/no-extension"));
        assert_eq!(Route::NotFound, route(Method::Post, "/upload"));
    }

    #[test]
    fn unserved_methods_get_405() {
        assert_eq!(Route::MethodNotAllowed, route(Method::Options, "/"));
        assert_eq!(Route::MethodNotAllowed, route(Method::Unknown, "/index.html"));
    }
}
