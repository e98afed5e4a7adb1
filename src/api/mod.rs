// API 路由汇总入口。
pub mod chat;
pub mod errors;

use crate::config::Config;
use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(config: &Config) -> Router<Arc<AppState>> {
    Router::new().merge(chat::router(config.server.max_upload_bytes))
}
