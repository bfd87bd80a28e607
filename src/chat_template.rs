use anyhow::{Context, Result};
use minijinja::{context, Environment, Error, ErrorKind};
use serde::{Deserialize, Serialize};

/// 模型没带模板时的兜底模板，assistant 头解码后是 `assistant\n\n`
pub const FALLBACK_TEMPLATE: &str = "{{ bos_token }}\
{% for message in messages %}\
<|start_header_id|>{{ message['role'] }}<|end_header_id|>\n\n\
{{ message['content'] | trim }}<|eot_id|>\
{% endfor %}\
{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}";

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

/// tokenizer_config.json 里 bos/eos 既可能是字符串也可能是 AddedToken 对象
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenRepr {
    Plain(String),
    Added { content: String },
}

impl TokenRepr {
    fn into_content(self) -> String {
        match self {
            TokenRepr::Plain(s) => s,
            TokenRepr::Added { content } => content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    chat_template: Option<String>,
    bos_token: Option<TokenRepr>,
    eos_token: Option<TokenRepr>,
}

pub struct ChatTemplate {
    env: Environment<'static>,
    source: String,
    pub bos_token: String,
    pub eos_token: Option<String>,
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: Option<String>,
    ) -> Result<Self> {
        let mut env = Environment::new();
        // 与 transformers 的 jinja 环境保持一致
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        // 模板里常见的 .strip() / .startswith() 等 Python 字符串方法
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", |msg: String| -> Result<String, Error> {
            Err(Error::new(ErrorKind::InvalidOperation, msg))
        });

        let template = Self {
            env,
            source: source.into(),
            bos_token: bos_token.into(),
            eos_token,
        };

        // 启动时就试渲染一次，模板有问题直接让加载失败
        template
            .render("system", "user")
            .context("chat template failed to render a sample conversation")?;
        Ok(template)
    }

    /// 解析 tokenizer_config.json 的内容
    pub fn from_tokenizer_config(json: &str) -> Result<Self> {
        let cfg: TokenizerConfig =
            serde_json::from_str(json).context("invalid tokenizer_config.json")?;
        let source = cfg
            .chat_template
            .unwrap_or_else(|| FALLBACK_TEMPLATE.to_string());
        let bos = cfg.bos_token.map(TokenRepr::into_content).unwrap_or_default();
        let eos = cfg.eos_token.map(TokenRepr::into_content);
        Self::new(source, bos, eos)
    }

    /// system + user 两轮对话，末尾带 generation prompt
    pub fn render(&self, system_text: &str, user_text: &str) -> Result<String> {
        let messages = [
            ChatMessage {
                role: "system",
                content: system_text,
            },
            ChatMessage {
                role: "user",
                content: user_text,
            },
        ];
        let rendered = self
            .env
            .render_str(
                &self.source,
                context! {
                    messages => messages,
                    add_generation_prompt => true,
                    bos_token => &self.bos_token,
                    eos_token => self.eos_token.as_deref().unwrap_or_default(),
                },
            )
            .context("failed to render chat template")?;
        Ok(rendered)
    }
}
