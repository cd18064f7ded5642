//! Axum integration
//!
//! Mounts a `Federation` as an `axum::Router` whose fallback forwards
//! every request into [`Federation::handle`]. Hosts with their own routes
//! merge this router into theirs; federation paths not claimed by the
//! host fall through to the registry.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request as AxumRequest;
use axum::response::Response as AxumResponse;
use axum::routing::any;

use crate::federation::{Federation, FetchOptions};

/// Largest accepted request body; inbox POSTs are small.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

impl<T: Clone + Send + Sync + 'static> Federation<T> {
    /// Wrap the registry in an `axum::Router`
    ///
    /// `data` is cloned into every request's context. For per-request
    /// hooks or computed context data, call [`Federation::handle`] from a
    /// custom handler instead.
    pub fn into_router(self: Arc<Self>, data: T) -> axum::Router {
        let handler = move |request: AxumRequest| {
            let federation = self.clone();
            let data = data.clone();
            async move {
                let (parts, body) = request.into_parts();
                let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        return AxumResponse::builder()
                            .status(http::StatusCode::PAYLOAD_TOO_LARGE)
                            .body(Body::empty())
                            .unwrap_or_default()
                    }
                };
                let request = http::Request::from_parts(parts, bytes);

                let response = federation.handle(request, FetchOptions::new(data)).await;
                let (parts, body) = response.into_parts();
                AxumResponse::from_parts(parts, Body::from(body))
            }
        };
        axum::Router::new().fallback(any(handler))
    }
}
