use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;

use crate::config::ModelSpec;

/// 从 hf-hub 缓存（必要时下载）解析出来的本地文件路径
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

impl ModelFiles {
    pub fn fetch(spec: &ModelSpec) -> Result<Self> {
        let api = Api::new().context("failed to initialise hf-hub api")?;
        let repo = api.repo(Repo::with_revision(
            spec.repo_id.clone(),
            RepoType::Model,
            spec.revision.clone(),
        ));

        let get = |name: &str| {
            repo.get(name)
                .with_context(|| format!("failed to fetch `{name}` from `{}`", spec.repo_id))
        };

        let config = get("config.json")?;
        let tokenizer = get("tokenizer.json")?;
        let tokenizer_config = get("tokenizer_config.json")?;
        let generation_config = match repo.get("generation_config.json") {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::debug!("no generation_config.json: {err}");
                None
            }
        };
        let weights = fetch_weights(&repo, &spec.repo_id)?;

        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            generation_config,
            weights,
        })
    }
}

/// 分片权重走 index.json，否则退回单个 model.safetensors
fn fetch_weights(repo: &ApiRepo, repo_id: &str) -> Result<Vec<PathBuf>> {
    match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let index = std::fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read {}", index_path.display()))?;
            shard_names(&index)?
                .into_iter()
                .map(|name| {
                    repo.get(&name)
                        .with_context(|| format!("failed to fetch shard `{name}` from `{repo_id}`"))
                })
                .collect()
        }
        Err(_) => {
            let single = repo.get("model.safetensors").with_context(|| {
                format!("`{repo_id}` has neither sharded nor single safetensors weights")
            })?;
            Ok(vec![single])
        }
    }
}

fn shard_names(index_json: &str) -> Result<BTreeSet<String>> {
    let index: SafetensorsIndex =
        serde_json::from_str(index_json).context("invalid model.safetensors.index.json")?;
    Ok(index.weight_map.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_are_deduplicated_and_sorted() {
        let index = r#"{
            "metadata": {"total_size": 3600000000},
            "weight_map": {
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.norm.weight": "model-00002-of-00002.safetensors"
            }
        }"#;
        let names: Vec<_> = shard_names(index).unwrap().into_iter().collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn malformed_index_is_an_error() {
        assert!(shard_names(r#"{"metadata": {}}"#).is_err());
    }
}
