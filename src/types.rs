use std::fmt;

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ChatError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    pub message: Option<String>,
}

// 只接受 JSON 对象，数组一律拒绝
impl<'de> Deserialize<'de> for ChatRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChatRequestVisitor;

        impl<'de> Visitor<'de> for ChatRequestVisitor {
            type Value = ChatRequest;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object with a `message` field")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ChatRequest, A::Error> {
                let mut message: Option<Option<String>> = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "message" {
                        if message.is_some() {
                            return Err(de::Error::duplicate_field("message"));
                        }
                        message = Some(map.next_value()?);
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
                Ok(ChatRequest {
                    message: message.flatten(),
                })
            }
        }

        deserializer.deserialize_map(ChatRequestVisitor)
    }
}

impl ChatRequest {
    /// 取出用户消息；缺失或为空都算调用方错误
    pub fn into_message(self) -> Result<String, ChatError> {
        match self.message {
            Some(message) if !message.is_empty() => Ok(message),
            _ => Err(ChatError::EmptyMessage),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}
