use std::sync::Arc;

use crate::config::{SamplingConfig, ServerConfig};
use crate::engine::InferenceEngine;

/// 全局共享状态（只读）：
/// - engine: 启动时加载一次的模型
/// - system_prompt / sampling: 每个请求都用的固定参数
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub system_prompt: String,
    pub sampling: SamplingConfig,
}

impl AppState {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            system_prompt: config.system_prompt.clone(),
            sampling: config.sampling.clone(),
        })
    }

    /// 生成回复并截掉 prompt 部分
    pub async fn reply_to(&self, message: &str) -> anyhow::Result<String> {
        let decoded = self
            .engine
            .complete(&self.system_prompt, message, &self.sampling)
            .await?;
        Ok(crate::reply::extract_reply(&decoded).to_string())
    }
}
