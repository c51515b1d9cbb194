// Gemini Handler - POST /v1beta/models/{model}:{action}

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Response,
};
use tracing::info;

use super::common::{dispatch, Protocol};
use super::AppState;
use crate::proxy::forward::GeminiRequest;

/// Split `gemini-pro:generateContent` into model and action.
/// A path without `:` yields an empty action.
pub fn split_model_action(model_action: &str) -> (&str, &str) {
    model_action.rsplit_once(':').unwrap_or((model_action, ""))
}

/// Handle Gemini generateContent / streamGenerateContent / countTokens
/// Path: /v1beta/models/:model_action (e.g. "gemini-pro:generateContent")
pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let (model, action) = split_model_action(&model_action);
    let stream = query.get("alt").map(|v| v == "sse").unwrap_or(false);
    info!("[Gemini] {}:{} | Stream: {}", model, action, stream);

    let request = GeminiRequest::new(model, action, stream, body);
    let model = request.model.clone();
    dispatch(&state, Protocol::Gemini, &model, move |forward, account, mut sink, cancel| {
        let request = request.clone();
        async move {
            forward
                .forward_gemini(&account, &request, &mut sink, &cancel)
                .await
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_model_action() {
        assert_eq!(
            split_model_action("gemini-2.5-pro:streamGenerateContent"),
            ("gemini-2.5-pro", "streamGenerateContent")
        );
        assert_eq!(split_model_action("gemini-2.5-pro"), ("gemini-2.5-pro", ""));
        assert_eq!(split_model_action("models/x:countTokens"), ("models/x", "countTokens"));
    }
}
