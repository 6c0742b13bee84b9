use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use alloy::{
    providers::{ProviderBuilder, RootProvider},
    rpc::{
        client::ClientBuilder,
        json_rpc::{ErrorPayload, RequestPacket, Response, ResponsePacket, ResponsePayload},
    },
    transports::{http::ReqwestTransport, RpcError, TransportError},
};
use futures::future::try_join_all;
use tower::{retry::Policy, Layer, Service};
use tracing::{debug, warn};

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: tokio::time::Duration = tokio::time::Duration::from_secs(30);

/// JSON-RPC error codes nodes use for rate limiting.
const RATE_LIMIT_CODES: [i64; 2] = [429, -32005];

/// Methods most public nodes refuse inside a batch.
pub const DEFAULT_UNBATCHABLE: [&str; 1] = ["eth_getProof"];

/// Whether a JSON-RPC error payload asks the caller to slow down.
pub fn is_rate_limited(error: &ErrorPayload) -> bool {
    if RATE_LIMIT_CODES.contains(&error.code) {
        return true;
    }
    let message = error.message.to_lowercase();
    message.contains("rate limit") || message.contains("too many requests") || message.contains("429")
}

fn responses(packet: &ResponsePacket) -> &[Response] {
    match packet {
        ResponsePacket::Single(response) => std::slice::from_ref(response),
        ResponsePacket::Batch(responses) => responses,
    }
}

/// Whether `result` is worth sending again: a transport failure, or a node
/// that rate limited any part of the packet. A batch is always retried as a
/// whole.
pub fn is_transient(result: Result<&ResponsePacket, &TransportError>) -> bool {
    match result {
        Ok(packet) => responses(packet).iter().any(|response| {
            matches!(&response.payload, ResponsePayload::Failure(error) if is_rate_limited(error))
        }),
        Err(RpcError::Transport(_)) => true,
        Err(RpcError::ErrorResp(error)) => is_rate_limited(error),
        Err(_) => false,
    }
}

/// Capped exponential backoff for transient failures, see [`is_transient`].
/// Any other error or response is returned to the caller on the first try.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    backoff: tokio::time::Duration,
    retries: u32,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(backoff: tokio::time::Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            retries: 0,
            max_retries,
        }
    }

    /// Sleep before the next attempt, doubling with every retry.
    pub fn delay(&self) -> tokio::time::Duration {
        self.backoff
            .saturating_mul(1 << self.retries.min(16))
            .min(MAX_BACKOFF)
    }

    pub fn backoff(&self) -> tokio::time::Sleep {
        tokio::time::sleep(self.delay())
    }
}

impl Policy<RequestPacket, ResponsePacket, TransportError> for RetryPolicy {
    type Future = Pin<Box<dyn Future<Output = Self> + Send + 'static>>;

    fn retry(
        &self,
        _req: &RequestPacket,
        result: Result<&ResponsePacket, &TransportError>,
    ) -> Option<Self::Future> {
        if !is_transient(result) {
            return None;
        }
        if self.retries >= self.max_retries {
            warn!(retries = self.retries, "rpc retry budget exhausted");
            return None;
        }
        let mut policy = self.clone();
        debug!(attempt = policy.retries + 1, delay = ?policy.delay(), "retrying rpc request");
        Some(Box::pin(async move {
            policy.backoff().await;
            policy.retries += 1;
            policy
        }))
    }

    fn clone_request(&self, req: &RequestPacket) -> Option<RequestPacket> {
        Some(req.clone())
    }
}

/// Wraps a transport in a [`RetryService`] that applies one [`RetryPolicy`]
/// per request packet.
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Resends a packet while the node rate limits it or the transport fails,
/// sleeping [`RetryPolicy::delay`] between attempts. Once `max_retries` is
/// spent the last result is returned as is, rate-limit responses included.
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<RequestPacket> for RetryService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Send
        + 'static
        + Clone,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        // The polled-ready service runs this request; a clone takes its place.
        let fresh = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, fresh);
        let mut policy = self.policy.clone();
        Box::pin(async move {
            loop {
                let result = inner.call(req.clone()).await;
                match policy.retry(&req, result.as_ref()) {
                    Some(next) => policy = next.await,
                    None => return result,
                }
            }
        })
    }
}

/// Sends requests for the named methods on their own instead of inside a
/// batch, so one unbatchable call cannot fail the rest of its batch.
#[derive(Clone, Debug)]
pub struct SplitBatchLayer {
    unbatchable: Arc<HashSet<String>>,
}

impl SplitBatchLayer {
    pub fn new<I, M>(methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        Self {
            unbatchable: Arc::new(methods.into_iter().map(Into::into).collect()),
        }
    }
}

impl<S> Layer<S> for SplitBatchLayer {
    type Service = SplitBatchService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SplitBatchService {
            inner,
            unbatchable: self.unbatchable.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SplitBatchService<S> {
    inner: S,
    unbatchable: Arc<HashSet<String>>,
}

impl<S> Service<RequestPacket> for SplitBatchService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Send
        + 'static
        + Clone,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);

        let RequestPacket::Batch(requests) = req else {
            return Box::pin(inner.call(req));
        };
        let (single, batched): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .partition(|request| self.unbatchable.contains(request.method()));
        if single.is_empty() {
            return Box::pin(inner.call(RequestPacket::Batch(batched)));
        }
        debug!(
            split = single.len(),
            batched = batched.len(),
            "splitting rpc batch"
        );

        let mut packets: Vec<_> = single.into_iter().map(RequestPacket::Single).collect();
        if !batched.is_empty() {
            packets.push(RequestPacket::Batch(batched));
        }
        let calls: Vec<_> = packets
            .into_iter()
            .map(|packet| inner.clone().call(packet))
            .collect();
        Box::pin(async move {
            let packets = try_join_all(calls).await?;
            let merged = packets
                .into_iter()
                .flat_map(|packet| match packet {
                    ResponsePacket::Single(response) => vec![response],
                    ResponsePacket::Batch(responses) => responses,
                })
                .collect();
            Ok(ResponsePacket::Batch(merged))
        })
    }
}

pub type RetryTransport = SplitBatchService<RetryService<ReqwestTransport>>;

pub fn build_http_retry_provider(
    rpc_url: url::Url,
    backoff: u64,
    max_retries: u32,
    unbatchable: &[&str],
) -> RootProvider<RetryTransport> {
    let retry_policy = RetryLayer::new(RetryPolicy::new(
        tokio::time::Duration::from_millis(backoff),
        max_retries,
    ));
    let client = ClientBuilder::default()
        .layer(SplitBatchLayer::new(unbatchable.iter().copied()))
        .layer(retry_policy)
        .http(rpc_url);
    ProviderBuilder::new().on_client(client)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use alloy::rpc::json_rpc::{Id, Request, SerializedRequest};

    use super::*;

    fn error(code: i64, message: &str) -> ErrorPayload {
        ErrorPayload {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn request(method: &'static str, id: u64) -> SerializedRequest {
        Request::new(method, Id::Number(id), ()).serialize().unwrap()
    }

    fn ok(id: Id) -> Response {
        Response {
            id,
            payload: ResponsePayload::Success(serde_json::value::to_raw_value("0x1").unwrap()),
        }
    }

    #[test]
    fn detects_rate_limits() {
        assert!(is_rate_limited(&error(429, "slow down")));
        assert!(is_rate_limited(&error(-32005, "limit exceeded")));
        assert!(is_rate_limited(&error(-32000, "Too Many Requests")));
        assert!(is_rate_limited(&error(-32000, "daily rate limit reached")));
        assert!(!is_rate_limited(&error(-32000, "execution reverted")));

        let limited = ResponsePacket::Batch(vec![
            ok(Id::Number(1)),
            Response {
                id: Id::Number(2),
                payload: ResponsePayload::Failure(error(429, "")),
            },
        ]);
        assert!(is_transient(Ok(&limited)));
        assert!(!is_transient(Ok(&ResponsePacket::Single(ok(Id::Number(1))))));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut policy = RetryPolicy::new(tokio::time::Duration::from_millis(100), 50);
        assert_eq!(policy.delay().as_millis(), 100);
        policy.retries = 3;
        assert_eq!(policy.delay().as_millis(), 800);
        policy.retries = 40;
        assert_eq!(policy.delay(), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_with_growing_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        // Rate limits the first two calls, then answers.
        let inner = tower::service_fn(move |packet: RequestPacket| {
            let counter = counter.clone();
            async move {
                let RequestPacket::Single(request) = packet else {
                    panic!("expected a single request");
                };
                let id = request.id().clone();
                let response = if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Response {
                        id,
                        payload: ResponsePayload::Failure(error(429, "rate limited")),
                    }
                } else {
                    ok(id)
                };
                Ok::<_, TransportError>(ResponsePacket::Single(response))
            }
        });
        let backoff = tokio::time::Duration::from_millis(100);

        let mut service = RetryLayer::new(RetryPolicy::new(backoff, 5)).layer(inner.clone());
        let start = tokio::time::Instant::now();
        let response = service
            .call(RequestPacket::Single(request("eth_getProof", 1)))
            .await
            .unwrap();
        assert!(!is_transient(Ok(&response)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= backoff * 3);

        calls.store(0, Ordering::SeqCst);
        let mut service = RetryLayer::new(RetryPolicy::new(backoff, 1)).layer(inner);
        let response = service
            .call(RequestPacket::Single(request("eth_getProof", 2)))
            .await
            .unwrap();
        assert!(is_transient(Ok(&response)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn splits_unbatchable_methods_out_of_batches() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let inner = tower::service_fn(move |packet: RequestPacket| {
            let record = record.clone();
            async move {
                let response = match packet {
                    RequestPacket::Single(request) => {
                        record.lock().unwrap().push(vec![request.method().to_string()]);
                        ResponsePacket::Single(ok(request.id().clone()))
                    }
                    RequestPacket::Batch(requests) => {
                        record
                            .lock()
                            .unwrap()
                            .push(requests.iter().map(|r| r.method().to_string()).collect());
                        ResponsePacket::Batch(requests.iter().map(|r| ok(r.id().clone())).collect())
                    }
                };
                Ok::<_, TransportError>(response)
            }
        });
        let mut service = SplitBatchLayer::new(DEFAULT_UNBATCHABLE).layer(inner);

        let batch = RequestPacket::Batch(vec![
            request("eth_getStorageAt", 1),
            request("eth_getProof", 2),
            request("eth_getCode", 3),
            request("eth_getProof", 4),
        ]);
        let ResponsePacket::Batch(responses) = service.call(batch).await.unwrap() else {
            panic!("expected a batch response");
        };
        let mut ids: Vec<_> = responses.iter().map(|r| r.id.clone()).collect();
        ids.sort_by_key(|id| id.as_number());
        assert_eq!(ids, (1..=4).map(Id::Number).collect::<Vec<_>>());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&vec!["eth_getStorageAt".to_string(), "eth_getCode".to_string()]));
        assert_eq!(
            seen.iter().filter(|m| *m == &vec!["eth_getProof".to_string()]).count(),
            2
        );
    }
}
