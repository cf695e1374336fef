use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::image::{Descriptor, Digest, ImageIndex, ImageManifest, MediaType};
use reqwest::{
    Method, Response, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use serde::Deserialize;

use crate::OCI_IMAGE_MANIFEST;
use crate::authcache::{AuthHeaderCache, DEFAULT_MAX_HOSTS};
use crate::credentials::{Credential, CredentialStore, DockerConfigStore, lookup};
use crate::digest::{digest_from_data, verify_data};
use crate::error::Error;
use crate::reference::Reference;

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const USER_AGENT: &str = concat!("ociarc/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);
const DEFAULT_AUTH_HEADER_TTL: Duration = Duration::from_secs(5 * 60);

// token per host/repo/scope; ghcr for example hands out tokens that work
// across repos, but scoping the key keeps every registry honest
#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenKey(String);

impl TokenKey {
    fn new(reference: &Reference, scope: Scope) -> Self {
        TokenKey(format!(
            "{}/{}:{}",
            reference.resolved_host(),
            reference.repository(),
            scope.as_str()
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Pull,
    PullPush,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Pull => "pull",
            Scope::PullPush => "pull,push",
        }
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

pub struct ClientBuilder {
    credentials: Option<Arc<dyn CredentialStore>>,
    anonymous: bool,
    allow_http: bool,
    auth_header_ttl: Duration,
    auth_header_hosts: usize,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            credentials: None,
            anonymous: false,
            allow_http: false,
            auth_header_ttl: DEFAULT_AUTH_HEADER_TTL,
            auth_header_hosts: DEFAULT_MAX_HOSTS,
        }
    }
}

impl ClientBuilder {
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Skip all credential lookups and talk to registries anonymously.
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Allow plain http registries. Meant for local development only.
    pub fn allow_http(mut self, allow_http: bool) -> Self {
        self.allow_http = allow_http;
        self
    }

    /// TTL for cached Authorization header values; zero disables the cache.
    pub fn auth_header_ttl(mut self, ttl: Duration) -> Self {
        self.auth_header_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(!self.allow_http)
            .user_agent(USER_AGENT)
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();

        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(DockerConfigStore::from_default_path()));

        Ok(Client {
            http,
            credentials,
            token_cache,
            header_cache: Arc::new(AuthHeaderCache::new(
                self.auth_header_hosts,
                self.auth_header_ttl,
            )),
            anonymous: self.anonymous,
            scheme: if self.allow_http { "http" } else { "https" },
        })
    }
}

/// Authenticated registry transport. One shared HTTP client and token
/// cache serve every operation; the whole type is cheaply cloneable and
/// safe to share across tasks.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialStore>,
    token_cache: Cache<TokenKey, Token>,
    header_cache: Arc<AuthHeaderCache>,
    anonymous: bool,
    scheme: &'static str,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn new() -> Result<Self, Error> {
        ClientBuilder::default().build()
    }

    /// The shared HTTP client, for callers driving their own requests
    /// (range reads against [`Client::blob_url`] for example).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn base_url(&self, reference: &Reference) -> String {
        format!("{}://{}", self.scheme, reference.resolved_host())
    }

    fn manifest_url(&self, reference: &Reference, target: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository(),
            target
        )
    }

    /// Resolves a tag or digest to a manifest descriptor without fetching
    /// the body, via HEAD and the Docker-Content-Digest header. Registries
    /// that omit the header cost one extra GET.
    pub async fn resolve(&self, reference: &Reference) -> Result<Descriptor, Error> {
        let url = self.manifest_url(reference, reference.reference());
        trace!("HEAD {url}");
        let req = self
            .http
            .request(Method::HEAD, &url)
            .header(header::ACCEPT, OCI_IMAGE_MANIFEST);
        let res = self.auth_and_retry(reference, Scope::Pull, req).await?;
        if res.status() != StatusCode::OK {
            return Err(status_error(res).await);
        }
        let media_type = content_type(res.headers());
        if let Some(digest) = docker_content_digest(res.headers())? {
            let size = content_length(res.headers()).unwrap_or(0);
            return Ok(Descriptor::new(media_type, size, digest));
        }
        debug!("no digest header from {url}, fetching to hash");
        let req = self
            .http
            .request(Method::GET, &url)
            .header(header::ACCEPT, OCI_IMAGE_MANIFEST);
        let res = self.auth_and_retry(reference, Scope::Pull, req).await?;
        if res.status() != StatusCode::OK {
            return Err(status_error(res).await);
        }
        let media_type = content_type(res.headers());
        let data = res.bytes().await?;
        Ok(Descriptor::new(
            media_type,
            data.len() as u64,
            digest_from_data(&data),
        ))
    }

    /// Fetches the manifest named by `expected`, bounded by its size when
    /// one is known, and returns it with the exact bytes read so callers
    /// can re-hash or cache without refetching.
    pub async fn fetch_manifest(
        &self,
        reference: &Reference,
        expected: &Descriptor,
    ) -> Result<(ImageManifest, Bytes), Error> {
        match expected.media_type() {
            MediaType::ImageManifest => {}
            MediaType::Other(s) if s.is_empty() => {}
            other => {
                return Err(Error::InvalidManifest(format!(
                    "unexpected manifest media type {other}"
                )));
            }
        }
        let url = self.manifest_url(reference, &expected.digest().to_string());
        trace!("GET {url}");
        let req = self
            .http
            .request(Method::GET, &url)
            .header(header::ACCEPT, OCI_IMAGE_MANIFEST);
        let mut res = self.auth_and_retry(reference, Scope::Pull, req).await?;
        if res.status() != StatusCode::OK {
            return Err(status_error(res).await);
        }
        let bound = expected.size();
        let mut data = Vec::with_capacity(bound.min(1 << 20) as usize);
        while let Some(chunk) = res.chunk().await? {
            if bound > 0 && (data.len() + chunk.len()) as u64 > bound {
                return Err(Error::SizeMismatch {
                    expected: bound,
                    actual: (data.len() + chunk.len()) as u64,
                });
            }
            data.extend_from_slice(&chunk);
        }
        if bound > 0 && data.len() as u64 != bound {
            return Err(Error::SizeMismatch {
                expected: bound,
                actual: data.len() as u64,
            });
        }
        verify_data(expected.digest(), &data)?;
        let manifest = ImageManifest::from_reader(std::io::Cursor::new(&data))
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;
        Ok((manifest, Bytes::from(data)))
    }

    /// Fetches a blob as a streaming response. Integrity checking against
    /// the descriptor is the caller's job.
    pub async fn fetch_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<Response, Error> {
        let url = self.blob_url(reference, descriptor.digest());
        trace!("GET {url}");
        let req = self.http.request(Method::GET, &url);
        let res = self.auth_and_retry(reference, Scope::Pull, req).await?;
        if res.status() != StatusCode::OK {
            return Err(status_error(res).await);
        }
        Ok(res)
    }

    /// Uploads a blob with the two-step upload flow. The descriptor must
    /// match the payload.
    pub async fn push_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        data: Bytes,
    ) -> Result<(), Error> {
        if descriptor.size() != data.len() as u64 {
            return Err(Error::InvalidDescriptor(format!(
                "descriptor size {} does not match payload of {} bytes",
                descriptor.size(),
                data.len()
            )));
        }
        let url = format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url(reference),
            reference.repository()
        );
        trace!("POST {url}");
        let req = self.http.request(Method::POST, &url);
        let res = self.auth_and_retry(reference, Scope::PullPush, req).await?;
        if res.status() != StatusCode::ACCEPTED {
            return Err(status_error(res).await);
        }
        let location = upload_location(&res, &self.base_url(reference))?;
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{sep}digest={}", descriptor.digest());
        trace!("PUT {put_url}");
        let req = self
            .http
            .request(Method::PUT, &put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, data.len())
            .body(data);
        let res = self.auth_and_retry(reference, Scope::PullPush, req).await?;
        if res.status() != StatusCode::CREATED {
            return Err(status_error(res).await);
        }
        Ok(())
    }

    /// Serializes the manifest once, pushes those exact bytes under `tag`,
    /// and returns their descriptor: `digest(sent bytes)` always equals the
    /// returned digest.
    pub async fn push_manifest(
        &self,
        reference: &Reference,
        tag: &str,
        manifest: &ImageManifest,
    ) -> Result<Descriptor, Error> {
        self.push_manifest_inner(reference, Some(tag), manifest)
            .await
    }

    /// As [`Client::push_manifest`] but addressed purely by digest.
    pub async fn push_manifest_by_digest(
        &self,
        reference: &Reference,
        manifest: &ImageManifest,
    ) -> Result<Descriptor, Error> {
        self.push_manifest_inner(reference, None, manifest).await
    }

    async fn push_manifest_inner(
        &self,
        reference: &Reference,
        tag: Option<&str>,
        manifest: &ImageManifest,
    ) -> Result<Descriptor, Error> {
        let data = serde_json::to_vec(manifest)
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;
        let digest = digest_from_data(&data);
        let descriptor = Descriptor::new(
            MediaType::ImageManifest,
            data.len() as u64,
            digest.clone(),
        );
        let target = match tag {
            Some(tag) => tag.to_string(),
            None => digest.to_string(),
        };
        let url = self.manifest_url(reference, &target);
        trace!("PUT {url}");
        let req = self
            .http
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, OCI_IMAGE_MANIFEST)
            .body(data);
        let res = self.auth_and_retry(reference, Scope::PullPush, req).await?;
        if res.status() != StatusCode::CREATED {
            return Err(status_error(res).await);
        }
        Ok(descriptor)
    }

    /// Points `tag` at an existing manifest. Registries require the
    /// manifest media type on the PUT, so a descriptor without one is
    /// resolved first, and the raw bytes are fetched and re-pushed
    /// unmodified.
    pub async fn tag(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        tag: &str,
    ) -> Result<(), Error> {
        let pinned = reference.with_digest(&descriptor.digest().to_string())?;
        let descriptor = match descriptor.media_type() {
            MediaType::ImageManifest => descriptor.clone(),
            MediaType::Other(s) if !s.is_empty() => descriptor.clone(),
            _ => self.resolve(&pinned).await?,
        };
        let (_, raw) = self.fetch_manifest(&pinned, &descriptor).await?;
        let url = self.manifest_url(reference, tag);
        trace!("PUT {url}");
        let req = self
            .http
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, descriptor.media_type().to_string())
            .body(raw);
        let res = self.auth_and_retry(reference, Scope::PullPush, req).await?;
        if res.status() != StatusCode::CREATED {
            return Err(status_error(res).await);
        }
        Ok(())
    }

    /// Referrers of `subject`, optionally filtered by artifact type. A
    /// registry without the referrers endpoint maps to
    /// [`Error::ReferrersUnsupported`].
    pub async fn referrers(
        &self,
        reference: &Reference,
        subject: &Descriptor,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Descriptor>, Error> {
        let url = format!(
            "{}/v2/{}/referrers/{}",
            self.base_url(reference),
            reference.repository(),
            subject.digest()
        );
        trace!("GET {url}");
        let mut req = self.http.request(Method::GET, &url);
        if let Some(artifact_type) = artifact_type {
            req = req.query(&[("artifactType", artifact_type)]);
        }
        let res = self.auth_and_retry(reference, Scope::Pull, req).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::ReferrersUnsupported),
            _ => return Err(status_error(res).await),
        }
        let data = res.bytes().await?;
        let index = ImageIndex::from_reader(std::io::Cursor::new(&data))
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;
        // registries are allowed to ignore the filter, so apply it again
        let manifests = index
            .manifests()
            .iter()
            .filter(|d| match artifact_type {
                Some(want) => d
                    .artifact_type()
                    .as_ref()
                    .is_some_and(|at| at.to_string() == want),
                None => true,
            })
            .cloned()
            .collect();
        Ok(manifests)
    }

    /// Pre-authenticated-style URL for a blob, for direct HTTP access.
    pub fn blob_url(&self, reference: &Reference, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference),
            reference.repository(),
            digest
        )
    }

    /// Header set for direct HTTP usage against this registry: User-Agent
    /// plus, when the credential store has something for the host, an
    /// Authorization value built from basic or static bearer credentials
    /// (no token exchange). The authorization value is cached per host; on
    /// a 401 the caller invalidates and retries once.
    pub fn auth_headers(&self, reference: &Reference) -> Result<HeaderMap, Error> {
        let host = reference.resolved_host();
        let value = match self.header_cache.get(host) {
            Some(value) => value,
            None => {
                let value = self
                    .credential_for(host)?
                    .header_value()
                    .unwrap_or_default();
                self.header_cache.set(host, value.clone());
                value
            }
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        if !value.is_empty() {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(|_| Error::BadCredential)?,
            );
        }
        Ok(headers)
    }

    pub fn invalidate_auth_headers(&self, reference: &Reference) {
        self.header_cache.invalidate(reference.resolved_host());
    }

    fn credential_for(&self, host: &str) -> Result<Credential, Error> {
        if self.anonymous {
            return Ok(Credential::Empty);
        }
        lookup(self.credentials.as_ref(), host)
    }

    // Requests are sent with whatever token is cached for the key. On a
    // 401 the WWW-Authenticate challenge names the token endpoint; one
    // token exchange later the clone of the request is retried. Stale
    // cached tokens self-correct the same way.
    async fn auth_and_retry(
        &self,
        reference: &Reference,
        scope: Scope,
        req: reqwest::RequestBuilder,
    ) -> Result<Response, Error> {
        let req_copy = req.try_clone();
        let mut req = req;
        let token_key = TokenKey::new(reference, scope);
        if let Some(token) = self.token_cache.get(&token_key).await {
            req = req.bearer_auth(token.token);
        } else if let Credential::Bearer(token) =
            self.credential_for(reference.resolved_host())?
        {
            req = req.bearer_auth(token);
        }

        let res = req.send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }
        // bodies built from streams are not replayable
        let Some(req_copy) = req_copy else {
            return Ok(res);
        };

        let Some(challenge) = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_bearer_challenge_header)
        else {
            // no bearer challenge; basic credentials get one direct retry
            if let Credential::Basic(user, pass) =
                self.credential_for(reference.resolved_host())?
            {
                return Ok(req_copy.basic_auth(user, Some(pass)).send().await?);
            }
            return Ok(res);
        };

        let token = self
            .token_cache
            .entry(TokenKey::new(reference, scope))
            .or_try_insert_with(self.fetch_token(reference, scope, &challenge))
            .await
            .map_err(Error::Shared)?;
        if token.is_fresh() {
            debug!("new token for {}", token.key().0);
        }
        Ok(req_copy.bearer_auth(token.into_value().token).send().await?)
    }

    async fn fetch_token(
        &self,
        reference: &Reference,
        scope: Scope,
        challenge: &BearerChallenge<'_>,
    ) -> Result<Token, Error> {
        #[derive(Deserialize)]
        struct JsonToken {
            token: Option<String>,
            access_token: Option<String>,
            expires_in: Option<u64>,
        }

        let scope = format!(
            "repository:{}:{}",
            reference.repository(),
            scope.as_str()
        );
        let mut req = self
            .http
            .request(Method::GET, challenge.realm)
            .query(&[("scope", scope.as_str()), ("service", challenge.service)]);
        if let Credential::Basic(user, pass) =
            self.credential_for(reference.resolved_host())?
        {
            req = req.basic_auth(user, Some(pass));
        }
        let res = req.send().await?;
        if res.status() != StatusCode::OK {
            return Err(status_error(res).await);
        }
        let parsed: JsonToken = res.json().await?;
        let token = parsed
            .token
            .or(parsed.access_token)
            .ok_or(Error::Unauthorized)?;
        // the token auth spec gives 60 seconds as the default lifetime
        let expires_in = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        Ok(Token { token, expires_in })
    }
}

async fn status_error(res: Response) -> Error {
    let status = res.status();
    if log::log_enabled!(log::Level::Trace) {
        match res.text().await {
            Ok(body) => trace!("status={status} body={body}"),
            Err(e) => trace!("status={status} error reading body {e:?}"),
        }
    }
    Error::from_status(status)
}

fn content_type(headers: &HeaderMap) -> MediaType {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(MediaType::from)
        .unwrap_or_else(|| MediaType::from(OCI_IMAGE_MANIFEST))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn docker_content_digest(headers: &HeaderMap) -> Result<Option<Digest>, Error> {
    headers
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|value| -> Result<Digest, Error> {
            value
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    warn!("unparseable {DOCKER_CONTENT_DIGEST_HEADER} header");
                    Error::InvalidManifest(format!(
                        "bad {DOCKER_CONTENT_DIGEST_HEADER} header"
                    ))
                })
        })
        .transpose()
}

fn upload_location(res: &Response, base: &str) -> Result<String, Error> {
    let location = res
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Status(res.status()))?;
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(location.to_string())
    } else {
        Ok(format!("{base}{location}"))
    }
}

struct BearerChallenge<'a> {
    realm: &'a str,
    service: &'a str,
}

fn parse_bearer_challenge_header(input: &HeaderValue) -> Option<BearerChallenge<'_>> {
    parse_bearer_challenge_str(input.to_str().ok()?)
}

fn parse_bearer_challenge_str(input: &str) -> Option<BearerChallenge<'_>> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, matches) = parser(input).ok()?;
    let mut realm = None;
    let mut service = None;
    for (k, v) in matches {
        match k {
            "realm" => realm = Some(v),
            "service" => service = Some(v),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::StubRegistry;

    #[test]
    fn test_parse_bearer_challenge() {
        let cases = [
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:a/b:pull""#,
            r#"Bearer realm="https://auth.example.com/token", service="registry.example.com""#,
            r#"Bearer   service="registry.example.com",realm="https://auth.example.com/token""#,
        ];
        for case in cases {
            let c = parse_bearer_challenge_str(case).unwrap();
            assert_eq!(c.realm, "https://auth.example.com/token", "{case}");
            assert_eq!(c.service, "registry.example.com", "{case}");
        }
        assert!(parse_bearer_challenge_str("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge_str("Bearer service=\"x\"").is_none());
    }

    #[tokio::test]
    async fn test_resolve_and_fetch_manifest() {
        let stub = StubRegistry::start().await;
        let (digest, raw) = stub.put_archive_manifest("v1", 100, 1000, None);
        let client = stub.client();
        let reference = stub.reference("v1");

        let descriptor = client.resolve(&reference).await.unwrap();
        assert_eq!(*descriptor.digest(), digest);
        assert_eq!(descriptor.size(), raw.len() as u64);

        let (manifest, bytes) = client.fetch_manifest(&reference, &descriptor).await.unwrap();
        assert_eq!(&bytes[..], &raw[..]);
        assert_eq!(manifest.layers().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_not_found() {
        let stub = StubRegistry::start().await;
        let client = stub.client();
        let reference = stub.reference("missing");
        let err = client.resolve(&reference).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fetch_manifest_rejects_oversize_body() {
        let stub = StubRegistry::start().await;
        let (digest, raw) = stub.put_archive_manifest("v1", 100, 1000, None);
        let client = stub.client();
        let reference = stub.reference("v1");
        let short = Descriptor::new(
            MediaType::ImageManifest,
            raw.len() as u64 - 1,
            digest.clone(),
        );
        let err = client.fetch_manifest(&reference, &short).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);
    }

    #[tokio::test]
    async fn test_fetch_manifest_rejects_wrong_media_type() {
        let stub = StubRegistry::start().await;
        let (digest, raw) = stub.put_archive_manifest("v1", 100, 1000, None);
        let client = stub.client();
        let reference = stub.reference("v1");
        let wrong = Descriptor::new(
            MediaType::from("application/vnd.oci.image.index.v1+json"),
            raw.len() as u64,
            digest.clone(),
        );
        let err = client.fetch_manifest(&reference, &wrong).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifest);
    }

    #[tokio::test]
    async fn test_token_exchange_on_401() {
        let stub = StubRegistry::start_with_token_auth().await;
        let (digest, _) = stub.put_archive_manifest("v1", 100, 1000, None);
        let client = stub.client();
        let reference = stub.reference("v1");
        let descriptor = client.resolve(&reference).await.unwrap();
        assert_eq!(*descriptor.digest(), digest);
        assert!(stub.token_requests() >= 1);
        // second call reuses the cached token
        let before = stub.token_requests();
        client.resolve(&reference).await.unwrap();
        assert_eq!(stub.token_requests(), before);
    }

    #[tokio::test]
    async fn test_push_blob_and_manifest_roundtrip() {
        let stub = StubRegistry::start().await;
        let client = stub.client();
        let reference = stub.reference("v2");

        let payload = Bytes::from_static(b"index-payload");
        let digest = digest_from_data(&payload);
        let descriptor = Descriptor::new(
            MediaType::from(crate::MEDIA_TYPE_INDEX),
            payload.len() as u64,
            digest,
        );
        client
            .push_blob(&reference, &descriptor, payload.clone())
            .await
            .unwrap();
        assert!(stub.has_blob(descriptor.digest()));

        let manifest = crate::testutil::archive_manifest(100, 1000, None);
        let pushed = client
            .push_manifest(&reference, "v2", &manifest)
            .await
            .unwrap();
        // the returned descriptor hashes the exact bytes sent
        let raw = stub.manifest_bytes("v2").unwrap();
        assert_eq!(digest_from_data(&raw), *pushed.digest());
        assert_eq!(pushed.size(), raw.len() as u64);
    }

    #[tokio::test]
    async fn test_push_blob_size_mismatch_rejected() {
        let stub = StubRegistry::start().await;
        let client = stub.client();
        let reference = stub.reference("v2");
        let payload = Bytes::from_static(b"payload");
        let descriptor = Descriptor::new(
            MediaType::from(crate::MEDIA_TYPE_INDEX),
            payload.len() as u64 + 5,
            digest_from_data(&payload),
        );
        let err = client
            .push_blob(&reference, &descriptor, payload)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[tokio::test]
    async fn test_tag_by_digest() {
        let stub = StubRegistry::start().await;
        let (digest, raw) = stub.put_archive_manifest("v1", 100, 1000, None);
        let client = stub.client();
        let reference = stub.reference("v1");
        // descriptor without a media type gets resolved first
        let descriptor = Descriptor::new(MediaType::Other(String::new()), 0, digest);
        client.tag(&reference, &descriptor, "stable").await.unwrap();
        assert_eq!(stub.manifest_bytes("stable").unwrap(), raw);
    }

    #[tokio::test]
    async fn test_referrers_unsupported() {
        let stub = StubRegistry::start().await;
        let (digest, raw) = stub.put_archive_manifest("v1", 100, 1000, None);
        let client = stub.client();
        let reference = stub.reference("v1");
        let subject = Descriptor::new(MediaType::ImageManifest, raw.len() as u64, digest);
        let err = client
            .referrers(&reference, &subject, Some(crate::MEDIA_TYPE_IN_TOTO))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReferrersUnsupported);
    }

    #[tokio::test]
    async fn test_auth_headers_cached_and_invalidated() {
        use crate::credentials::StaticStore;
        let store = StaticStore::new([(
            "reg.example.com".to_string(),
            Credential::Basic("u".into(), "p".into()),
        )]);
        let client = Client::builder()
            .credentials(Arc::new(store))
            .build()
            .unwrap();
        let reference: Reference = "reg.example.com/repo:v1".parse().unwrap();
        let headers = client.auth_headers(&reference).unwrap();
        assert!(headers.get(header::AUTHORIZATION).is_some());
        assert!(headers.get(header::USER_AGENT).is_some());
        client.invalidate_auth_headers(&reference);
        // still derivable after invalidation
        let headers = client.auth_headers(&reference).unwrap();
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap().to_str().unwrap(),
            Credential::Basic("u".into(), "p".into())
                .header_value()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_anonymous_mode_produces_no_authorization() {
        use crate::credentials::StaticStore;
        let store = StaticStore::new([(
            "reg.example.com".to_string(),
            Credential::Basic("u".into(), "p".into()),
        )]);
        let client = Client::builder()
            .credentials(Arc::new(store))
            .anonymous(true)
            .build()
            .unwrap();
        let reference: Reference = "reg.example.com/repo:v1".parse().unwrap();
        let headers = client.auth_headers(&reference).unwrap();
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }
}
