use anyhow::Context;

use local_chat_server::app_state::AppState;
use local_chat_server::build_rocket;
use local_chat_server::config::ServerConfig;
use local_chat_server::engine::CandleEngine;
use local_chat_server::logging::configure_logging;

fn main() -> anyhow::Result<()> {
    configure_logging()?;

    let config = ServerConfig::default();
    tracing::info!(model = %config.model.repo_id, "starting chat server");

    // 模型在监听之前加载；失败直接退出
    tracing::info!("loading model and tokenizer...");
    let engine = CandleEngine::load(&config.model).map_err(|err| {
        tracing::error!(error = ?err, "model load failed");
        err
    })?;
    tracing::info!(model = engine.model_name(), "model and tokenizer ready");

    let state = AppState::new(engine, &config);
    // Ctrl-C 由 rocket 自带的 shutdown 处理
    rocket::execute(build_rocket(state, &config).launch()).context("server error")?;
    Ok(())
}
