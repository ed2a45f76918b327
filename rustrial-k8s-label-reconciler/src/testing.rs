//! Test doubles shared by the unit tests.

use crate::{
    errors::ControllerError,
    label_diff::Labels,
    resource_accessor::{ResourceAccessor, TargetObject},
};
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject, GroupVersionKind},
    core::ErrorResponse,
};
use rustrial_k8s_label_reconciler_apis::{GroupVersionResource, ResourcePatch};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};
use tokio::net::TcpListener;

pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("status {}", code),
        reason: "Test".to_string(),
        code,
    })
}

pub(crate) fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn node_gvr() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "nodes")
}

pub(crate) fn node(name: &str, pairs: &[(&str, &str)], resource_version: &str) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Node"));
    let mut object = DynamicObject::new(name, &ar);
    object.metadata.labels = Some(labels(pairs));
    object.metadata.resource_version = Some(resource_version.to_string());
    object
}

pub(crate) fn patch(name: &str, desired: &[(&str, &str)], owned: &[&str]) -> ResourcePatch {
    ResourcePatch {
        gvr: node_gvr(),
        name: name.to_string(),
        namespace: None,
        labels: labels(desired),
        owned_labels_regex: owned.iter().map(|v| v.to_string()).collect(),
    }
}

/// In-memory [`ResourceAccessor`] for cluster scoped objects, enforcing
/// optimistic concurrency on `metadata.resourceVersion`.
#[derive(Default)]
pub(crate) struct MockAccessor {
    objects: Mutex<HashMap<String, DynamicObject>>,
    /// Number of reads after which a concurrent writer modifies the object.
    pub concurrent_writes: AtomicU32,
    concurrent_writes_done: AtomicU32,
    /// Status code returned by every update, if set.
    pub update_error: Mutex<Option<u16>>,
    /// Status codes returned by reads of specific objects.
    pub get_errors: Mutex<HashMap<String, u16>>,
    pub gets: AtomicUsize,
    pub updates: AtomicUsize,
}

impl MockAccessor {
    pub fn insert(&self, object: DynamicObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.name_any(), object);
    }

    pub fn labels_of(&self, name: &str) -> Option<Labels> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|o| o.labels().clone())
    }

    fn bump(object: &mut DynamicObject) {
        let version = object
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        object.metadata.resource_version = Some((version + 1).to_string());
    }
}

impl ResourceAccessor for MockAccessor {
    async fn get(
        &self,
        gvr: &GroupVersionResource,
        name: &str,
        _namespace: Option<&str>,
    ) -> Result<TargetObject, ControllerError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.get_errors.lock().unwrap().get(name) {
            return Err(api_error(*code).into());
        }
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get_mut(name).ok_or_else(|| api_error(404))?;
        let object = stored.clone();
        let pending = self.concurrent_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.concurrent_writes.store(pending - 1, Ordering::SeqCst);
            let done = self.concurrent_writes_done.fetch_add(1, Ordering::SeqCst) + 1;
            stored
                .labels_mut()
                .insert("concurrent-writer".to_string(), done.to_string());
            Self::bump(stored);
        }
        Ok(TargetObject {
            gvr: gvr.clone(),
            object,
        })
    }

    async fn update(&self, mut object: TargetObject) -> Result<TargetObject, ControllerError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.update_error.lock().unwrap() {
            return Err(api_error(code).into());
        }
        let mut objects = self.objects.lock().unwrap();
        let name = object.object.name_any();
        let stored = objects.get_mut(name.as_str()).ok_or_else(|| api_error(404))?;
        if stored.metadata.resource_version != object.object.metadata.resource_version {
            return Err(api_error(409).into());
        }
        Self::bump(&mut object.object);
        *stored = object.object.clone();
        Ok(object)
    }
}

/// A request received by a [`TestServer`].
#[derive(Clone, Debug)]
pub(crate) struct Recorded {
    pub method: Method,
    /// Path and query.
    pub uri: String,
    pub body: String,
}

/// Local HTTP/1 server answering every request with `handler`.
pub(crate) struct TestServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<Recorded>>> = Default::default();
        let recorded = requests.clone();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let recorded = recorded.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        let handler = handler.clone();
                        async move {
                            let method = req.method().clone();
                            let uri = req
                                .uri()
                                .path_and_query()
                                .map(|v| v.to_string())
                                .unwrap_or_default();
                            let bytes = req.into_body().collect().await?.to_bytes();
                            let request = Recorded {
                                method,
                                uri,
                                body: String::from_utf8_lossy(&bytes).to_string(),
                            };
                            let (status, body) = handler(&request);
                            recorded.lock().unwrap().push(request);
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(status)
                                    .header(CONTENT_TYPE, "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        Self { addr, requests }
    }

    /// Serve `body` with `status` for every request.
    pub async fn fixed(status: StatusCode, body: &'static str) -> Self {
        Self::start(move |_| (status, body.to_string())).await
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}
