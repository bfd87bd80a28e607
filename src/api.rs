use std::sync::Arc;

use rocket::http::ContentType;
use rocket::response::content::RawHtml;
use rocket::serde::json::{self, Json};
use rocket::{get, post, State};

use crate::app_state::AppState;
use crate::error::ChatError;
use crate::types::{ChatRequest, ChatResponse};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// `application/json; charset=utf-8`
fn json_utf8() -> ContentType {
    ContentType::new("application", "json").with_params(("charset", "utf-8"))
}

#[get("/")]
pub fn index() -> RawHtml<&'static str> {
    RawHtml(INDEX_HTML)
}

#[post("/chat", data = "<payload>")]
pub async fn chat(
    state: &State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, json::Error<'_>>,
) -> Result<(ContentType, Json<ChatResponse>), ChatError> {
    let Json(req) = payload.map_err(|e| ChatError::InvalidBody(e.to_string()))?;
    let message = req.into_message()?;
    tracing::info!(chars = message.chars().count(), "chat request");

    let response = state.reply_to(&message).await?;

    Ok((json_utf8(), Json(ChatResponse { response })))
}
