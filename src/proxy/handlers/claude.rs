// Claude Handler - POST /v1/messages

use std::sync::Arc;

use axum::{body::Bytes, extract::State, response::Response};
use tracing::info;

use super::common::{dispatch, error_response, Protocol};
use super::AppState;
use crate::proxy::forward::{decode_claude_request, ForwardError};

/// Handle Claude Messages: POST /v1/messages
pub async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match decode_claude_request(&body) {
        Ok(r) => Arc::new(r),
        Err(ForwardError::InvalidRequest(message)) => {
            return error_response(Protocol::Claude, 400, "invalid_request_error", &message);
        }
        Err(e) => {
            return error_response(Protocol::Claude, 400, "invalid_request_error", &e.to_string());
        }
    };

    info!(
        "[Claude] /v1/messages | Model: {} | Stream: {} | Messages: {}",
        request.model,
        request.stream,
        request.messages.len()
    );

    let model = request.model.clone();
    dispatch(&state, Protocol::Claude, &model, move |forward, account, mut sink, cancel| {
        let request = request.clone();
        async move {
            forward
                .forward_claude(&account, &request, &mut sink, &cancel)
                .await
        }
    })
    .await
}
