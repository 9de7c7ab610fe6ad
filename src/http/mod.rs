//! HTTP layer: the axum router that accepts archive uploads, stores the
//! extracted entries and pushes them to GitHub on request.

pub mod handler;
