use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

// Candle 相关
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{self, Cache, Llama, LlamaConfig};
use candle_transformers::utils::apply_repeat_penalty;
use tokenizers::Tokenizer;

use crate::chat_template::ChatTemplate;
use crate::config::{ModelSpec, SamplingConfig};
use crate::model_files::ModelFiles;

/// 外部模型能力的抽象：模板化、生成、解码
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// system + user 两轮对话渲染成 token 序列（确定性的）
    fn render_prompt(&self, system_text: &str, user_text: &str) -> Result<Vec<u32>>;

    /// 返回完整序列：prompt 在前，续写在后
    async fn generate(&self, prompt: &[u32], sampling: &SamplingConfig) -> Result<Vec<u32>>;

    /// 解码时跳过特殊 token
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// 一次完整调用：渲染 -> 生成 -> 解码
    async fn complete(
        &self,
        system_text: &str,
        user_text: &str,
        sampling: &SamplingConfig,
    ) -> Result<String> {
        let prompt = self.render_prompt(system_text, user_text)?;
        let output = self.generate(&prompt, sampling).await?;
        self.decode(&output)
    }
}

pub struct CandleEngine {
    model_name: String,
    device: Device,
    dtype: DType,
    config: llama::Config,
    model: Llama,
    tokenizer: Tokenizer,
    template: ChatTemplate,
    eos_token_ids: Vec<u32>,
    // 同一时间只跑一个生成
    generation: Mutex<()>,
}

impl CandleEngine {
    pub fn load(spec: &ModelSpec) -> Result<Arc<Self>> {
        let start = Instant::now();
        let files = ModelFiles::fetch(spec)?;

        // 有 CUDA 就用 GPU + bf16，否则 CPU + f32
        let device = Device::cuda_if_available(0)?;
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let raw_config = std::fs::read(&files.config)
            .with_context(|| format!("failed to read {}", files.config.display()))?;
        let llama_config: LlamaConfig =
            serde_json::from_slice(&raw_config).context("invalid config.json")?;
        let config = llama_config.into_config(false);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Error loading tokenizer: {e}"))?;
        let tokenizer_config = std::fs::read_to_string(&files.tokenizer_config)
            .with_context(|| format!("failed to read {}", files.tokenizer_config.display()))?;
        let template = ChatTemplate::from_tokenizer_config(&tokenizer_config)?;
        tracing::info!(model = %spec.repo_id, "tokenizer loaded");

        let generation_config = match &files.generation_config {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => None,
        };
        let eos_token_ids = eos_token_ids(
            &tokenizer,
            template.eos_token.as_deref(),
            generation_config.as_deref(),
        )?;
        if eos_token_ids.is_empty() {
            tracing::warn!("no eos token found, generation always runs to max_new_tokens");
        }

        let total_size_in_bytes: u64 = files
            .weights
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        tracing::info!(
            model = %spec.repo_id,
            device = ?device,
            dtype = ?dtype,
            "loaded {} weight file(s) ({}) in {:.2}s",
            files.weights.len(),
            format_size(total_size_in_bytes as usize),
            start.elapsed().as_secs_f32(),
        );

        Ok(Arc::new(Self {
            model_name: spec.repo_id.clone(),
            device,
            dtype,
            config,
            model,
            tokenizer,
            template,
            eos_token_ids,
            generation: Mutex::new(()),
        }))
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    fn generate_inner(&self, prompt: &[u32], sampling: &SamplingConfig) -> Result<Vec<u32>> {
        let _guard = self.generation.lock();
        let start = Instant::now();

        let temperature = (sampling.do_sample && sampling.temperature > 0.0)
            .then_some(sampling.temperature);
        let top_p = sampling.do_sample.then_some(sampling.top_p);
        let mut logits_processor = LogitsProcessor::new(rand::random(), temperature, top_p);

        // 每次请求一个新的 cache，请求之间不共享任何状态
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        let tokens = sample_tokens(
            prompt,
            sampling,
            &self.eos_token_ids,
            &mut logits_processor,
            |context, index_pos| {
                let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
                let logits = self.model.forward(&input, index_pos, &mut cache)?;
                Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
            },
        )?;

        tracing::info!(
            prompt_tokens = prompt.len(),
            new_tokens = tokens.len() - prompt.len(),
            "generation finished in {:.2}s",
            start.elapsed().as_secs_f32(),
        );
        Ok(tokens)
    }
}

/// 带 KV cache 的自回归采样循环。
///
/// `forward(context, index_pos)` 返回一维 logits。
/// 第一步喂整个 prompt（index_pos = 0），之后每步只喂最后一个 token。
/// 重复惩罚覆盖目前为止的整个序列（含 prompt）。
/// 遇到任一 eos 立即停止，eos 本身保留在输出里。
fn sample_tokens<F>(
    prompt: &[u32],
    sampling: &SamplingConfig,
    eos_token_ids: &[u32],
    logits_processor: &mut LogitsProcessor,
    mut forward: F,
) -> Result<Vec<u32>>
where
    F: FnMut(&[u32], usize) -> Result<Tensor>,
{
    let mut tokens = prompt.to_vec();
    let mut index_pos = 0;

    for step in 0..sampling.max_new_tokens {
        let context = if step == 0 {
            &tokens[..]
        } else {
            &tokens[tokens.len() - 1..]
        };
        let logits = forward(context, index_pos)?;
        index_pos += context.len();

        let logits = if sampling.repetition_penalty == 1.0 {
            logits
        } else {
            apply_repeat_penalty(&logits, sampling.repetition_penalty, &tokens)?
        };

        let next_token = logits_processor.sample(&logits)?;
        tokens.push(next_token);
        if eos_token_ids.contains(&next_token) {
            break;
        }
    }
    Ok(tokens)
}

#[async_trait]
impl InferenceEngine for CandleEngine {
    fn render_prompt(&self, system_text: &str, user_text: &str) -> Result<Vec<u32>> {
        let prompt = self.template.render(system_text, user_text)?;
        // 模板里已经带了 bos，不再额外加特殊 token
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| anyhow!("Error encoding prompt: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    async fn generate(&self, prompt: &[u32], sampling: &SamplingConfig) -> Result<Vec<u32>> {
        // 生成是纯 CPU/GPU 计算，直接占住当前 worker 线程
        tokio::task::block_in_place(|| self.generate_inner(prompt, sampling))
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Error decoding: {e}"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EosTokenId {
    Single(u32),
    Many(Vec<u32>),
}

#[derive(Debug, Deserialize)]
struct GenerationConfig {
    eos_token_id: Option<EosTokenId>,
}

/// tokenizer_config 的 eos 与 generation_config 的 eos_token_id 取并集
fn eos_token_ids(
    tokenizer: &Tokenizer,
    eos_token: Option<&str>,
    generation_config: Option<&str>,
) -> Result<Vec<u32>> {
    let mut ids: Vec<u32> = eos_token
        .and_then(|token| tokenizer.token_to_id(token))
        .into_iter()
        .collect();

    if let Some(raw) = generation_config {
        ids.extend(generation_eos_ids(raw)?);
    }

    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

fn generation_eos_ids(generation_config: &str) -> Result<Vec<u32>> {
    let cfg: GenerationConfig =
        serde_json::from_str(generation_config).context("invalid generation_config.json")?;
    Ok(match cfg.eos_token_id {
        Some(EosTokenId::Single(id)) => vec![id],
        Some(EosTokenId::Many(ids)) => ids,
        None => Vec::new(),
    })
}

// 小工具：人类可读的字节数
fn format_size(size: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size_f = size as f64;
    if size_f > GB {
        format!("{:.2} GiB", size_f / GB)
    } else if size_f > MB {
        format!("{:.2} MiB", size_f / MB)
    } else if size_f > KB {
        format!("{:.2} KiB", size_f / KB)
    } else {
        format!("{size} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_config_eos_single_and_list() {
        assert_eq!(generation_eos_ids(r#"{"eos_token_id": 2}"#).unwrap(), vec![2]);
        assert_eq!(
            generation_eos_ids(r#"{"bos_token_id": 1, "eos_token_id": [2, 7]}"#).unwrap(),
            vec![2, 7]
        );
        assert!(generation_eos_ids(r#"{"do_sample": true}"#).unwrap().is_empty());
    }

    fn greedy_sampling(max_new_tokens: usize, repetition_penalty: f32) -> SamplingConfig {
        SamplingConfig {
            max_new_tokens,
            do_sample: false,
            top_p: 1.0,
            temperature: 0.0,
            repetition_penalty,
        }
    }

    fn one_hot(vocab: usize, hot: u32) -> Tensor {
        let mut logits = vec![0f32; vocab];
        logits[hot as usize] = 10.0;
        Tensor::new(logits.as_slice(), &Device::Cpu).unwrap()
    }

    /// 按脚本依次产出 token，并记录每次 forward 收到的 (context, index_pos)
    fn run_script(
        prompt: &[u32],
        script: &[u32],
        sampling: &SamplingConfig,
        eos: &[u32],
    ) -> (Vec<u32>, Vec<(Vec<u32>, usize)>) {
        let mut calls = Vec::new();
        let mut lp = LogitsProcessor::new(0, None, None);
        let out = sample_tokens(prompt, sampling, eos, &mut lp, |context, index_pos| {
            let hot = script[calls.len()];
            calls.push((context.to_vec(), index_pos));
            Ok(one_hot(16, hot))
        })
        .unwrap();
        (out, calls)
    }

    #[test]
    fn stops_right_after_eos() {
        let script: [u32; 5] = [5, 6, 2, 7, 8];
        let (out, calls) = run_script(&[1, 3], &script, &greedy_sampling(10, 1.0), &[2]);
        assert_eq!(out, vec![1, 3, 5, 6, 2]);
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn any_eos_id_stops_generation() {
        let (out, _) = run_script(&[1], &[4, 9, 5], &greedy_sampling(10, 1.0), &[2, 9]);
        assert_eq!(out, vec![1, 4, 9]);
    }

    #[test]
    fn runs_exactly_max_new_tokens_without_eos() {
        let script: [u32; 6] = [5, 6, 7, 8, 9, 10];
        let (out, calls) = run_script(&[1, 3], &script, &greedy_sampling(4, 1.0), &[2]);
        assert_eq!(out, vec![1, 3, 5, 6, 7, 8]);
        assert_eq!(calls.len(), 4);
    }

    #[test]
    fn first_step_gets_whole_prompt_then_one_token_at_a_time() {
        let (_, calls) = run_script(&[1, 3, 4], &[5, 6, 7], &greedy_sampling(3, 1.0), &[]);
        assert_eq!(calls, vec![(vec![1, 3, 4], 0), (vec![5], 3), (vec![6], 4)]);
    }

    #[test]
    fn repetition_penalty_covers_prompt_tokens() {
        // token 1 在 prompt 里：2.0 / 1.05 < 1.95，惩罚后应选 token 2
        let logits = || Tensor::new(&[0f32, 2.0, 1.95, 0.0], &Device::Cpu).unwrap();
        let mut lp = LogitsProcessor::new(0, None, None);
        let penalized = greedy_sampling(1, 1.05);
        let out = sample_tokens(&[1], &penalized, &[], &mut lp, |_, _| Ok(logits())).unwrap();
        assert_eq!(out, vec![1, 2]);

        let mut lp = LogitsProcessor::new(0, None, None);
        let plain = greedy_sampling(1, 1.0);
        let out = sample_tokens(&[1], &plain, &[], &mut lp, |_, _| Ok(logits())).unwrap();
        assert_eq!(out, vec![1, 1]);
    }

    fn word_level_tokenizer() -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3},
                "unk_token": "<unk>"
            }
        }"#;
        json.parse().unwrap()
    }

    #[test]
    fn eos_ids_merge_tokenizer_and_generation_config() {
        let tokenizer = word_level_tokenizer();
        let generation_config = r#"{"eos_token_id": [7, 2]}"#;
        let ids = eos_token_ids(&tokenizer, Some("</s>"), Some(generation_config)).unwrap();
        assert_eq!(ids, vec![2, 7]);
    }

    #[test]
    fn eos_ids_from_tokenizer_only() {
        let tokenizer = word_level_tokenizer();
        assert_eq!(eos_token_ids(&tokenizer, Some("</s>"), None).unwrap(), vec![2]);
    }

    #[test]
    fn unknown_eos_token_is_ignored() {
        let tokenizer = word_level_tokenizer();
        assert!(eos_token_ids(&tokenizer, Some("<|eot_id|>"), None).unwrap().is_empty());
        assert_eq!(
            eos_token_ids(&tokenizer, None, Some(r#"{"eos_token_id": 5}"#)).unwrap(),
            vec![5]
        );
    }

    #[test]
    fn broken_generation_config_is_an_error() {
        let tokenizer = word_level_tokenizer();
        assert!(eos_token_ids(&tokenizer, None, Some("{")).is_err());
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
