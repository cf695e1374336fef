//! In-process registry and blob servers for tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use oci_spec::image::{Digest, ImageManifest};
use serde_json::json;

use crate::credentials::StaticStore;
use crate::digest::digest_from_data;
use crate::ocidist;
use crate::reference::Reference;
use crate::{ARTIFACT_TYPE, MEDIA_TYPE_DATA, MEDIA_TYPE_INDEX, OCI_IMAGE_MANIFEST};

pub(crate) fn index_payload(n: u64) -> Vec<u8> {
    (0..n).map(|i| (i % 247) as u8).collect()
}

pub(crate) fn data_payload(n: u64) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

pub(crate) fn archive_manifest_json(
    index_size: u64,
    data_size: u64,
    created: Option<&str>,
) -> serde_json::Value {
    let mut manifest = json!({
        "schemaVersion": 2,
        "mediaType": OCI_IMAGE_MANIFEST,
        "artifactType": ARTIFACT_TYPE,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": digest_from_data(b"{}").to_string(),
            "size": 2,
        },
        "layers": [
            {
                "mediaType": MEDIA_TYPE_INDEX,
                "digest": digest_from_data(index_payload(index_size)).to_string(),
                "size": index_size,
            },
            {
                "mediaType": MEDIA_TYPE_DATA,
                "digest": digest_from_data(data_payload(data_size)).to_string(),
                "size": data_size,
            },
        ],
    });
    if let Some(created) = created {
        manifest["annotations"] = json!({
            "org.opencontainers.image.created": created,
        });
    }
    manifest
}

pub(crate) fn archive_manifest(
    index_size: u64,
    data_size: u64,
    created: Option<&str>,
) -> ImageManifest {
    serde_json::from_value(archive_manifest_json(index_size, data_size, created)).unwrap()
}

#[derive(Clone)]
struct StoredManifest {
    media_type: String,
    digest: String,
    data: Bytes,
}

pub(crate) struct StubState {
    addr: SocketAddr,
    require_token: bool,
    manifests: Mutex<HashMap<String, StoredManifest>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    token_requests: AtomicU64,
    resolve_count: AtomicU64,
    manifest_fetch_count: AtomicU64,
    blob_fetch_count: AtomicU64,
}

pub(crate) struct StubRegistry {
    state: Arc<StubState>,
}

impl StubRegistry {
    pub(crate) async fn start() -> Self {
        Self::start_inner(false).await
    }

    pub(crate) async fn start_with_token_auth() -> Self {
        Self::start_inner(true).await
    }

    async fn start_inner(require_token: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(StubState {
            addr,
            require_token,
            manifests: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            token_requests: AtomicU64::new(0),
            resolve_count: AtomicU64::new(0),
            manifest_fetch_count: AtomicU64::new(0),
            blob_fetch_count: AtomicU64::new(0),
        });
        let app = Router::new()
            .route("/token", get(token_handler))
            .route(
                "/v2/{repo}/manifests/{reference}",
                get(get_manifest).put(put_manifest),
            )
            .route("/v2/{repo}/blobs/uploads/", post(start_upload))
            .route("/upload/{id}", put(finish_upload))
            .route("/v2/{repo}/blobs/{digest}", get(get_blob))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StubRegistry { state }
    }

    pub(crate) fn reference(&self, tag: &str) -> Reference {
        format!("{}/testrepo:{tag}", self.state.addr).parse().unwrap()
    }

    pub(crate) fn client(&self) -> ocidist::Client {
        ocidist::Client::builder()
            .credentials(Arc::new(StaticStore::default()))
            .allow_http(true)
            .build()
            .unwrap()
    }

    pub(crate) fn put_blob(&self, data: impl Into<Bytes>) -> Digest {
        let data = data.into();
        let digest = digest_from_data(&data);
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(digest.to_string(), data);
        digest
    }

    /// Stores a complete archive: index and data blobs with deterministic
    /// contents plus a manifest referencing them, reachable by tag and by
    /// digest.
    pub(crate) fn put_archive_manifest(
        &self,
        tag: &str,
        index_size: u64,
        data_size: u64,
        created: Option<&str>,
    ) -> (Digest, Bytes) {
        self.put_blob(index_payload(index_size));
        self.put_blob(data_payload(data_size));
        let raw = serde_json::to_vec(&archive_manifest_json(index_size, data_size, created))
            .unwrap();
        self.put_manifest_bytes(tag, raw)
    }

    /// A manifest with the right artifact type but only a data layer.
    pub(crate) fn put_manifest_missing_index(&self, tag: &str, data_size: u64) -> (Digest, Bytes) {
        self.put_blob(data_payload(data_size));
        let mut json = archive_manifest_json(1, data_size, None);
        let layers = json["layers"].as_array().unwrap().clone();
        json["layers"] = json!([layers[1]]);
        let raw = serde_json::to_vec(&json).unwrap();
        self.put_manifest_bytes(tag, raw)
    }

    fn put_manifest_bytes(&self, tag: &str, raw: Vec<u8>) -> (Digest, Bytes) {
        let raw = Bytes::from(raw);
        let digest = digest_from_data(&raw);
        let stored = StoredManifest {
            media_type: OCI_IMAGE_MANIFEST.to_string(),
            digest: digest.to_string(),
            data: raw.clone(),
        };
        let mut manifests = self.state.manifests.lock().unwrap();
        manifests.insert(tag.to_string(), stored.clone());
        manifests.insert(digest.to_string(), stored);
        (digest, raw)
    }

    pub(crate) fn manifest_bytes(&self, reference: &str) -> Option<Bytes> {
        self.state
            .manifests
            .lock()
            .unwrap()
            .get(reference)
            .map(|m| m.data.clone())
    }

    pub(crate) fn has_blob(&self, digest: &Digest) -> bool {
        self.state
            .blobs
            .lock()
            .unwrap()
            .contains_key(&digest.to_string())
    }

    pub(crate) fn token_requests(&self) -> u64 {
        self.state.token_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn resolve_count(&self) -> u64 {
        self.state.resolve_count.load(Ordering::Relaxed)
    }

    pub(crate) fn manifest_fetch_count(&self) -> u64 {
        self.state.manifest_fetch_count.load(Ordering::Relaxed)
    }

    pub(crate) fn blob_fetch_count(&self) -> u64 {
        self.state.blob_fetch_count.load(Ordering::Relaxed)
    }
}

fn check_auth(state: &StubState, headers: &HeaderMap) -> Result<(), Response> {
    if !state.require_token {
        return Ok(());
    }
    match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some("Bearer test-token") => Ok(()),
        _ => {
            let challenge = format!(
                "Bearer realm=\"http://{}/token\", service=\"stub-registry\"",
                state.addr
            );
            Err((
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, challenge)],
            )
                .into_response())
        }
    }
}

async fn token_handler(State(state): State<Arc<StubState>>) -> Response {
    state.token_requests.fetch_add(1, Ordering::Relaxed);
    axum::Json(json!({"token": "test-token", "expires_in": 300})).into_response()
}

async fn get_manifest(
    State(state): State<Arc<StubState>>,
    method: Method,
    Path((_repo, reference)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let stored = state.manifests.lock().unwrap().get(&reference).cloned();
    let Some(stored) = stored else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if method == Method::HEAD {
        state.resolve_count.fetch_add(1, Ordering::Relaxed);
    } else {
        state.manifest_fetch_count.fetch_add(1, Ordering::Relaxed);
    }
    let mut out = HeaderMap::new();
    out.insert(header::CONTENT_TYPE, stored.media_type.parse().unwrap());
    out.insert("docker-content-digest", stored.digest.parse().unwrap());
    out.insert(
        header::CONTENT_LENGTH,
        stored.data.len().to_string().parse().unwrap(),
    );
    (StatusCode::OK, out, stored.data).into_response()
}

async fn put_manifest(
    State(state): State<Arc<StubState>>,
    Path((_repo, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(OCI_IMAGE_MANIFEST)
        .to_string();
    let digest = digest_from_data(&body);
    let stored = StoredManifest {
        media_type,
        digest: digest.to_string(),
        data: body,
    };
    let mut manifests = state.manifests.lock().unwrap();
    manifests.insert(reference, stored.clone());
    manifests.insert(digest.to_string(), stored);
    (
        StatusCode::CREATED,
        [("docker-content-digest", digest.to_string())],
    )
        .into_response()
}

async fn start_upload(
    State(state): State<Arc<StubState>>,
    Path(_repo): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let location = format!("/upload/{:016x}", rand::random::<u64>());
    (StatusCode::ACCEPTED, [(header::LOCATION, location)]).into_response()
}

async fn finish_upload(
    State(state): State<Arc<StubState>>,
    Path(_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    let Some(digest) = params.get("digest") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if digest_from_data(&body).to_string() != *digest {
        return StatusCode::BAD_REQUEST.into_response();
    }
    state.blobs.lock().unwrap().insert(digest.clone(), body);
    StatusCode::CREATED.into_response()
}

async fn get_blob(
    State(state): State<Arc<StubState>>,
    Path((_repo, digest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    state.blob_fetch_count.fetch_add(1, Ordering::Relaxed);
    let data = state.blobs.lock().unwrap().get(&digest).cloned();
    let Some(data) = data else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let etag = format!("\"{digest}\"");
    serve_ranged(&data, Some(&etag), false, &headers)
}

// shared range/validator behavior for blob endpoints
fn serve_ranged(
    data: &Bytes,
    etag: Option<&str>,
    ignore_range: bool,
    headers: &HeaderMap,
) -> Response {
    let mut out = HeaderMap::new();
    if let Some(etag) = etag {
        out.insert(header::ETAG, etag.parse().unwrap());
        if let Some(if_match) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
            if if_match != etag {
                return (StatusCode::PRECONDITION_FAILED, out).into_response();
            }
        }
    }
    let len = data.len() as u64;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|_| !ignore_range)
        .and_then(parse_range);
    match range {
        Some((start, _)) if start >= len => {
            out.insert(
                header::CONTENT_RANGE,
                format!("bytes */{len}").parse().unwrap(),
            );
            (StatusCode::RANGE_NOT_SATISFIABLE, out).into_response()
        }
        Some((start, end)) => {
            let end = end.unwrap_or(len - 1).min(len - 1);
            out.insert(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{len}").parse().unwrap(),
            );
            let body = data.slice(start as usize..=end as usize);
            out.insert(
                header::CONTENT_LENGTH,
                body.len().to_string().parse().unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, out, body).into_response()
        }
        None => {
            out.insert(header::CONTENT_LENGTH, len.to_string().parse().unwrap());
            (StatusCode::OK, out, data.clone()).into_response()
        }
    }
}

fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

struct BlobState {
    addr: SocketAddr,
    content: Mutex<(Bytes, Option<String>)>,
    ignore_range: AtomicBool,
    requests: AtomicU64,
}

/// A single mutable blob served with range and validator support, for
/// byte-source tests.
pub(crate) struct StubBlob {
    state: Arc<BlobState>,
}

impl StubBlob {
    pub(crate) async fn start(data: Vec<u8>, etag: Option<&str>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BlobState {
            addr,
            content: Mutex::new((Bytes::from(data), etag.map(|s| s.to_string()))),
            ignore_range: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        });
        let app = Router::new()
            .route("/blob", get(stub_blob_handler))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StubBlob { state }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/blob", self.state.addr)
    }

    pub(crate) fn replace(&self, data: Vec<u8>, etag: Option<&str>) {
        *self.state.content.lock().unwrap() = (Bytes::from(data), etag.map(|s| s.to_string()));
    }

    pub(crate) fn set_ignore_range(&self, ignore: bool) {
        self.state.ignore_range.store(ignore, Ordering::Relaxed);
    }

    pub(crate) fn request_count(&self) -> u64 {
        self.state.requests.load(Ordering::Relaxed)
    }
}

async fn stub_blob_handler(State(state): State<Arc<BlobState>>, headers: HeaderMap) -> Response {
    state.requests.fetch_add(1, Ordering::Relaxed);
    let (data, etag) = state.content.lock().unwrap().clone();
    serve_ranged(
        &data,
        etag.as_deref(),
        state.ignore_range.load(Ordering::Relaxed),
        &headers,
    )
}
