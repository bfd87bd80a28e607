use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::response::{self, Responder, Response};
use rocket::Request;

/// /chat 的错误分类：前两种是调用方的问题（400），其余一律 500
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("internal server error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn status(&self) -> Status {
        match self {
            ChatError::InvalidBody(_) | ChatError::EmptyMessage => Status::BadRequest,
            ChatError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for ChatError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if let ChatError::Internal(err) = &self {
            tracing::error!(error = ?err, "chat request failed");
        } else {
            tracing::warn!(%status, "rejected chat request: {self}");
        }

        let body = self.to_string();
        Response::build()
            .status(status)
            .header(ContentType::Plain)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
