#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body;
use http::{Request, Response, StatusCode};
use portico::{
    GatewayService,
    adapters::build_registry,
    config::GatewayConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// What the scripted backend does for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Refused,
    Hang(Duration),
}

/// Backend stand-in that replays a script, then repeats a default reply.
pub struct ScriptedClient {
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
    script: Mutex<VecDeque<Reply>>,
    default: Reply,
}

impl ScriptedClient {
    pub fn always(reply: Reply) -> Arc<Self> {
        Self::scripted([], reply)
    }

    pub fn scripted(script: impl IntoIterator<Item = Reply>, default: Reply) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            script: Mutex::new(script.into_iter().collect()),
            default,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(method, uri)` of every call in order.
    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((req.method().to_string(), req.uri().to_string()));

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match reply {
            Reply::Status(status) => {
                let mut response = Response::new(Body::from(req.uri().path().to_string()));
                *response.status_mut() = StatusCode::from_u16(status).unwrap();
                Ok(response)
            }
            Reply::Refused => Err(HttpClientError::ConnectionError(
                "connection refused".to_string(),
            )),
            Reply::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Response::new(Body::from("late")))
            }
        }
    }
}

pub fn gateway(config: GatewayConfig, client: Arc<ScriptedClient>) -> GatewayService {
    let registry = build_registry(&config.registry).unwrap();
    GatewayService::new(config, registry, client).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from("{}"))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
