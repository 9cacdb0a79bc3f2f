#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! kino is a single-host HTTP/1.1 video-streaming server.
//!
//! The I/O core is a non-blocking reactor over a readiness poll, a bounded
//! task queue, and a fixed worker pool. Each client connection is a
//! long-lived state machine: workers advance it one step at a time
//! (parse, route, stage a header, push body bytes) and park it back in
//! the poll at every would-block point. Video bodies move with zero-copy
//! `sendfile`, capped per turn so one fast client cannot starve the rest.
//!
//! The application on top is small: static assets, a session-gated MP4
//! streamer with byte ranges, cookie sessions, and a SQLite-backed
//! library/resume API.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod http;
pub mod pool;
pub mod queue;
pub mod reactor;
pub mod router;
pub mod sessions;
pub mod static_files;
pub mod store;
pub mod streaming;
