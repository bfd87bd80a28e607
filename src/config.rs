use std::net::{IpAddr, Ipv4Addr};

use rocket::config::LogLevel;

/// 每次请求都使用的固定采样参数
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub top_p: f64,
    pub temperature: f64,
    pub repetition_penalty: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            do_sample: true,
            top_p: 0.95,
            temperature: 0.7,
            repetition_penalty: 1.05,
        }
    }
}

/// Hugging Face 上的模型位置
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub repo_id: String,
    pub revision: String,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            repo_id: "llm-jp/llm-jp-3.1-1.8b-instruct4".to_string(),
            revision: "main".to_string(),
        }
    }
}

/// 进程级配置：全部是编译期常量，不读环境变量也不读命令行
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub model: ModelSpec,
    pub system_prompt: String,
    pub sampling: SamplingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8000,
            model: ModelSpec::default(),
            system_prompt: "以下は、タスクを説明する指示です。要求を適切に満たす応答を書きなさい。"
                .to_string(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Rocket 的配置直接由代码给出，不经过 Rocket.toml / ROCKET_* 环境变量
    pub fn rocket_config(&self) -> rocket::Config {
        rocket::Config {
            address: self.address,
            port: self.port,
            log_level: LogLevel::Normal,
            ..rocket::Config::default()
        }
    }
}
