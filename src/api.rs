//! API boundary for host web layers.
//!
//! Hosts (GUI, web server, automation) call into the core through typed
//! request handlers: a JSON-equivalent body in, `{status_code, body}` out.
//! Mutating requests carry the acting session's permission set. A handler may
//! defer: it returns a continuation immediately and completes the response
//! later from the owning component's worker, so no API thread ever blocks on
//! core I/O. No HTTP transport is included here; hosts bring their own.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::error::{ApiError, Error, ToHttpStatus};

/// A request crossing into the core
#[derive(Clone, Debug)]
pub struct ApiRequest {
    /// HTTP-style method (`GET`, `POST`, `DELETE`, …)
    pub method: String,
    /// Path segments below the handler prefix
    pub path: Vec<String>,
    /// JSON body; `Value::Null` when absent
    pub body: Value,
    /// Permissions of the acting session
    pub permissions: BTreeSet<String>,
}

impl ApiRequest {
    /// Does the session hold a permission (or the admin wildcard)?
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission) || self.permissions.contains("admin")
    }
}

/// A completed response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP-style status code
    pub status_code: u16,
    /// JSON body
    pub body: Value,
}

impl ApiResponse {
    /// 200 with a body
    pub fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    /// 204 without a body
    pub fn no_content() -> Self {
        Self {
            status_code: 204,
            body: Value::Null,
        }
    }

    /// An error response from the shared error shape
    pub fn error(status_code: u16, error: ApiError) -> Self {
        Self {
            status_code,
            body: serde_json::to_value(&error).unwrap_or(Value::Null),
        }
    }
}

impl From<Error> for ApiResponse {
    fn from(error: Error) -> Self {
        let status = error.status_code();
        Self::error(status, error.into())
    }
}

/// Outcome of dispatching a request
pub enum ApiOutcome {
    /// The handler answered synchronously
    Ready(ApiResponse),
    /// The handler deferred; the response arrives through the receiver
    Deferred(oneshot::Receiver<ApiResponse>),
}

/// Completion handle for a deferred response
pub struct ApiCompletion {
    tx: oneshot::Sender<ApiResponse>,
}

impl ApiCompletion {
    /// Create a completion pair
    pub fn channel() -> (Self, oneshot::Receiver<ApiResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the response; ignored when the caller went away
    pub fn complete(self, response: ApiResponse) {
        let _ = self.tx.send(response);
    }
}

/// One mounted request handler
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Permission required for mutating methods
    fn required_permission(&self) -> &str;

    /// Handle a request below this handler's prefix
    async fn handle(&self, request: ApiRequest) -> ApiOutcome;
}

/// Routes requests to mounted handlers by path prefix
#[derive(Default)]
pub struct ApiRouter {
    handlers: Vec<(String, Arc<dyn RequestHandler>)>,
}

impl ApiRouter {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a handler under a path prefix
    pub fn mount(&mut self, prefix: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.push((prefix.into(), handler));
    }

    /// Dispatch a request. Permission checks run before the handler: read
    /// methods pass, everything else needs the handler's permission.
    pub async fn dispatch(&self, mut request: ApiRequest) -> ApiOutcome {
        let Some(first) = request.path.first().cloned() else {
            return ApiOutcome::Ready(ApiResponse::error(404, ApiError::not_found("route")));
        };
        let Some((_, handler)) = self.handlers.iter().find(|(p, _)| *p == first) else {
            return ApiOutcome::Ready(ApiResponse::error(404, ApiError::not_found("route")));
        };

        let mutating = !matches!(request.method.as_str(), "GET" | "HEAD");
        if mutating && !request.has_permission(handler.required_permission()) {
            return ApiOutcome::Ready(ApiResponse::error(
                403,
                ApiError::new("access_denied", "permission denied"),
            ));
        }

        request.path.remove(0);
        handler.handle(request).await
    }
}

/// Helper for handlers: parse a typed body or answer 400
pub fn parse_body<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T, ApiResponse> {
    serde_json::from_value(body.clone()).map_err(|e| {
        ApiResponse::error(
            400,
            ApiError::validation(format!("invalid request body: {e}")),
        )
    })
}

/// Helper for handlers: an OK response from a serialisable value
pub fn json_ok<T: serde::Serialize>(value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => ApiResponse::ok(body),
        Err(e) => ApiResponse::error(
            500,
            ApiError::new("serialization_error", e.to_string()),
        ),
    }
}

/// A tiny built-in handler exposing engine status
pub(crate) struct StatusHandler {
    pub(crate) started_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl RequestHandler for StatusHandler {
    fn required_permission(&self) -> &str {
        "admin"
    }

    async fn handle(&self, request: ApiRequest) -> ApiOutcome {
        match request.method.as_str() {
            "GET" => ApiOutcome::Ready(ApiResponse::ok(json!({
                "started_at": self.started_at.to_rfc3339(),
            }))),
            _ => ApiOutcome::Ready(ApiResponse::error(
                405,
                ApiError::new("method_not_allowed", "unsupported method"),
            )),
        }
    }
}

#[derive(serde::Deserialize)]
struct AddBundleBody {
    target: std::path::PathBuf,
    size: u64,
    tth: crate::tth::Tth,
    #[serde(default)]
    priority: Option<crate::types::Priority>,
    #[serde(default)]
    source: Option<crate::types::HintedUser>,
}

/// Queue operations over the API boundary
pub(crate) struct QueueHandler {
    pub(crate) queue: crate::queue::QueueManager,
}

#[async_trait]
impl RequestHandler for QueueHandler {
    fn required_permission(&self) -> &str {
        "queue.edit"
    }

    async fn handle(&self, request: ApiRequest) -> ApiOutcome {
        let response = match (
            request.method.as_str(),
            request.path.first().map(String::as_str),
        ) {
            ("GET", Some("bundles")) => {
                let tokens = self.queue.bundle_tokens().await;
                let mut bundles = Vec::with_capacity(tokens.len());
                for token in tokens {
                    if let Some(bundle) = self.queue.bundle(token).await {
                        bundles.push(json!({
                            "token": bundle.token,
                            "target": bundle.target,
                            "status": bundle.status,
                            "priority": bundle.priority,
                            "queued": bundle.queue_items.len(),
                            "finished": bundle.finished_items.len(),
                        }));
                    }
                }
                ApiResponse::ok(json!({ "bundles": bundles }))
            }
            ("POST", Some("bundles")) => match parse_body::<AddBundleBody>(&request.body) {
                Err(resp) => resp,
                Ok(body) => match self
                    .queue
                    .add_file(
                        body.target,
                        body.size,
                        body.tth,
                        body.priority.unwrap_or(crate::types::Priority::Default),
                        body.source,
                        crate::queue::item::ItemFlags::default(),
                    )
                    .await
                {
                    Ok(info) => ApiResponse::ok(json!({
                        "bundle": info.bundle,
                        "merged": info.merged,
                    })),
                    Err(e) => e.into(),
                },
            },
            ("DELETE", Some(token)) => match token.parse::<crate::types::QueueToken>() {
                Ok(token) => match self.queue.remove_bundle(token).await {
                    Ok(()) => ApiResponse::no_content(),
                    Err(e) => e.into(),
                },
                Err(_) => ApiResponse::error(400, ApiError::validation("invalid bundle token")),
            },
            _ => ApiResponse::error(404, ApiError::not_found("queue route")),
        };
        ApiOutcome::Ready(response)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        fn required_permission(&self) -> &str {
            "queue.edit"
        }

        async fn handle(&self, request: ApiRequest) -> ApiOutcome {
            ApiOutcome::Ready(ApiResponse::ok(json!({
                "path": request.path,
                "body": request.body,
            })))
        }
    }

    struct Slow;

    #[async_trait]
    impl RequestHandler for Slow {
        fn required_permission(&self) -> &str {
            "queue.edit"
        }

        async fn handle(&self, _request: ApiRequest) -> ApiOutcome {
            let (completion, rx) = ApiCompletion::channel();
            tokio::spawn(async move {
                completion.complete(ApiResponse::ok(json!({"done": true})));
            });
            ApiOutcome::Deferred(rx)
        }
    }

    fn request(method: &str, path: &[&str], perms: &[&str]) -> ApiRequest {
        ApiRequest {
            method: method.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
            body: Value::Null,
            permissions: perms.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn routing_strips_the_prefix_and_falls_back_to_404() {
        let mut router = ApiRouter::new();
        router.mount("queue", Arc::new(Echo));

        let outcome = router.dispatch(request("GET", &["queue", "bundles"], &[])).await;
        let ApiOutcome::Ready(resp) = outcome else {
            panic!("expected ready response");
        };
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body["path"], json!(["bundles"]));

        let missing = router.dispatch(request("GET", &["nope"], &[])).await;
        let ApiOutcome::Ready(resp) = missing else {
            panic!("expected ready response");
        };
        assert_eq!(resp.status_code, 404);
    }

    #[tokio::test]
    async fn mutations_need_the_handler_permission() {
        let mut router = ApiRouter::new();
        router.mount("queue", Arc::new(Echo));

        let denied = router.dispatch(request("POST", &["queue"], &[])).await;
        let ApiOutcome::Ready(resp) = denied else {
            panic!("expected ready response");
        };
        assert_eq!(resp.status_code, 403);

        let allowed = router
            .dispatch(request("POST", &["queue"], &["queue.edit"]))
            .await;
        let ApiOutcome::Ready(resp) = allowed else {
            panic!("expected ready response");
        };
        assert_eq!(resp.status_code, 200);

        let admin = router.dispatch(request("POST", &["queue"], &["admin"])).await;
        let ApiOutcome::Ready(resp) = admin else {
            panic!("expected ready response");
        };
        assert_eq!(resp.status_code, 200, "admin implies everything");

        let read = router.dispatch(request("GET", &["queue"], &[])).await;
        let ApiOutcome::Ready(resp) = read else {
            panic!("expected ready response");
        };
        assert_eq!(resp.status_code, 200, "reads never need permissions");
    }

    #[tokio::test]
    async fn deferred_responses_complete_later() {
        let mut router = ApiRouter::new();
        router.mount("slow", Arc::new(Slow));

        let outcome = router
            .dispatch(request("POST", &["slow"], &["queue.edit"]))
            .await;
        let ApiOutcome::Deferred(rx) = outcome else {
            panic!("expected deferred response");
        };
        let resp = rx.await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body["done"], json!(true));
    }

    #[tokio::test]
    async fn errors_map_through_the_shared_shape() {
        let resp: ApiResponse = Error::NotFound("bundle 7".into()).into();
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.body["error"]["code"], "not_found");

        let resp: ApiResponse = Error::ShuttingDown.into();
        assert_eq!(resp.status_code, 503);
    }

    #[test]
    fn parse_body_produces_a_400_on_mismatch() {
        #[derive(serde::Deserialize, Debug)]
        struct Body {
            #[allow(dead_code)]
            size: u64,
        }
        let err = parse_body::<Body>(&json!({"size": "not a number"})).unwrap_err();
        assert_eq!(err.status_code, 400);
        assert!(parse_body::<Body>(&json!({"size": 3})).is_ok());
    }
}
