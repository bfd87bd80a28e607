pub mod api;
pub mod app_state;
pub mod chat_template;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model_files;
pub mod reply;
pub mod types;

use std::sync::Arc;

use rocket::fairing::AdHoc;
use rocket::{routes, Build, Rocket};

use app_state::AppState;
use config::ServerConfig;

/// 组装 rocket 实例：路由、共享状态、启动/关闭日志
pub fn build_rocket(state: Arc<AppState>, config: &ServerConfig) -> Rocket<Build> {
    rocket::custom(config.rocket_config())
        .manage(state)
        .mount("/", routes![api::index, api::chat])
        .attach(AdHoc::on_liftoff("announce", |rocket| {
            Box::pin(async move {
                let cfg = rocket.config();
                tracing::info!("listening on {}:{}", cfg.address, cfg.port);
                tracing::info!("open http://localhost:{} in a browser", cfg.port);
            })
        }))
        .attach(AdHoc::on_shutdown("shutdown log", |_| {
            Box::pin(async {
                tracing::info!("shutting down server");
            })
        }))
}
