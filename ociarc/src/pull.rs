use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::{info, warn};
use oci_spec::image::{Descriptor, Digest, MediaType};
use reqwest::header::HeaderMap;

use crate::blockcache::{BlockSource, DEFAULT_BLOCK_SIZE, DEFAULT_CAPACITY};
use crate::digest::verify_sized_data;
use crate::diskcache::{CacheDirOptions, IndexCache, ManifestCache, RefCache};
use crate::error::Error;
use crate::httpsource::{ByteSource, HeaderSource, HttpSource};
use crate::manifest::ArchiveManifest;
use crate::ocidist;
use crate::reference::Reference;

pub const DEFAULT_MAX_INDEX_SIZE: i64 = 8 * 1024 * 1024;

/// Cache-tier observations, for progress reporting. Callbacks may fire
/// from any task concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ResolveHit,
    ResolveMiss,
    ManifestHit,
    ManifestMiss,
    IndexHit,
    IndexMiss,
}

pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Default)]
pub struct Stats {
    pub ref_hit: u64,
    pub ref_miss: u64,
    pub manifest_hit: u64,
    pub manifest_miss: u64,
    pub index_hit: u64,
    pub index_miss: u64,
}

#[derive(Default)]
struct Counters {
    ref_hit: AtomicU64,
    ref_miss: AtomicU64,
    manifest_hit: AtomicU64,
    manifest_miss: AtomicU64,
    index_hit: AtomicU64,
    index_miss: AtomicU64,
}

pub struct ClientBuilder {
    cache_dir: Option<PathBuf>,
    transport: Option<ocidist::Client>,
    ref_capacity: i64,
    manifest_capacity: i64,
    index_capacity: i64,
    shard_prefix_len: usize,
    max_index_size: i64,
    block_cache: Option<(u64, u64)>,
    on_event: Option<EventCallback>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            cache_dir: None,
            transport: None,
            ref_capacity: 10_000_000,
            manifest_capacity: 10_000_000,
            index_capacity: 1_000_000_000,
            shard_prefix_len: crate::diskcache::DEFAULT_SHARD_PREFIX_LEN,
            max_index_size: DEFAULT_MAX_INDEX_SIZE,
            block_cache: None,
            on_event: None,
        }
    }
}

impl ClientBuilder {
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    pub fn transport(mut self, transport: ocidist::Client) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn ref_capacity(mut self, bytes: i64) -> Self {
        self.ref_capacity = bytes;
        self
    }

    pub fn manifest_capacity(mut self, bytes: i64) -> Self {
        self.manifest_capacity = bytes;
        self
    }

    pub fn index_capacity(mut self, bytes: i64) -> Self {
        self.index_capacity = bytes;
        self
    }

    pub fn shard_prefix_len(mut self, len: usize) -> Self {
        self.shard_prefix_len = len;
        self
    }

    /// Refuse index blobs larger than this many bytes. Zero or negative
    /// disables the limit.
    pub fn max_index_size(mut self, bytes: i64) -> Self {
        self.max_index_size = bytes;
        self
    }

    /// Serve data-blob reads through an in-memory block cache.
    pub fn block_cache(mut self, block_size: u64, capacity_bytes: u64) -> Self {
        self.block_cache = Some((block_size, capacity_bytes));
        self
    }

    pub fn default_block_cache(self) -> Self {
        self.block_cache(DEFAULT_BLOCK_SIZE, DEFAULT_CAPACITY)
    }

    pub fn on_event(mut self, callback: EventCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let dir = self.cache_dir.ok_or(Error::NoCacheDir)?;
        let opts = |max_bytes: i64| CacheDirOptions {
            max_bytes,
            shard_prefix_len: self.shard_prefix_len,
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => ocidist::Client::new()?,
        };
        Ok(Client {
            transport,
            refs: RefCache::open(dir.join("refs"), opts(self.ref_capacity))?,
            manifests: ManifestCache::open(dir.join("manifests"), opts(self.manifest_capacity))?,
            indexes: IndexCache::open(dir.join("indexes"), opts(self.index_capacity))?,
            max_index_size: self.max_index_size,
            block_cache: self.block_cache,
            on_event: self.on_event,
            counters: Counters::default(),
        })
    }
}

/// Pull-side facade: reference in, validated manifest or lazy archive out,
/// with the ref/manifest/index disk caches in between.
pub struct Client {
    transport: ocidist::Client,
    refs: RefCache,
    manifests: ManifestCache,
    indexes: IndexCache,
    max_index_size: i64,
    block_cache: Option<(u64, u64)>,
    on_event: Option<EventCallback>,
    counters: Counters,
}

/// Everything needed to open an on-disk-like view of one archive: the
/// validated manifest, the verified index bytes, and a lazily-read data
/// source. The archive-format decoder consumes the parts.
pub struct LazyArchive {
    manifest: ArchiveManifest,
    index: Bytes,
    source: Arc<dyn ByteSource>,
}

impl std::fmt::Debug for LazyArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyArchive")
            .field("manifest", &self.manifest)
            .field("index", &self.index)
            .finish()
    }
}

impl LazyArchive {
    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    pub fn index_bytes(&self) -> &Bytes {
        &self.index
    }

    pub fn source(&self) -> Arc<dyn ByteSource> {
        self.source.clone()
    }

    pub fn into_parts(self) -> (ArchiveManifest, Bytes, Arc<dyn ByteSource>) {
        (self.manifest, self.index, self.source)
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn transport(&self) -> &ocidist::Client {
        &self.transport
    }

    pub fn stats(&self) -> Stats {
        Stats {
            ref_hit: self.counters.ref_hit.load(Ordering::Relaxed),
            ref_miss: self.counters.ref_miss.load(Ordering::Relaxed),
            manifest_hit: self.counters.manifest_hit.load(Ordering::Relaxed),
            manifest_miss: self.counters.manifest_miss.load(Ordering::Relaxed),
            index_hit: self.counters.index_hit.load(Ordering::Relaxed),
            index_miss: self.counters.index_miss.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event: Event) {
        let counter = match event {
            Event::ResolveHit => &self.counters.ref_hit,
            Event::ResolveMiss => &self.counters.ref_miss,
            Event::ManifestHit => &self.counters.manifest_hit,
            Event::ManifestMiss => &self.counters.manifest_miss,
            Event::IndexHit => &self.counters.index_hit,
            Event::IndexMiss => &self.counters.index_miss,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }

    /// Resolves `reference` to a validated archive manifest, consulting
    /// the ref and manifest caches unless `skip_cache` is set. Cache
    /// population is best effort and never fails the fetch.
    pub async fn fetch(
        &self,
        reference: &Reference,
        skip_cache: bool,
    ) -> Result<ArchiveManifest, Error> {
        self.fetch_inner(reference, skip_cache)
            .await
            .map_err(|e| e.with_reference(reference))
    }

    /// Builds the lazy archive view for `reference`: validated manifest,
    /// verified index bytes, and a range-request data source (optionally
    /// block-cached).
    pub async fn pull(
        &self,
        reference: &Reference,
        skip_cache: bool,
    ) -> Result<LazyArchive, Error> {
        self.pull_inner(reference, skip_cache)
            .await
            .map_err(|e| e.with_reference(reference))
    }

    async fn fetch_inner(
        &self,
        reference: &Reference,
        skip_cache: bool,
    ) -> Result<ArchiveManifest, Error> {
        let digest: Digest = if let Some(digest) = reference.digest() {
            digest
                .parse()
                .map_err(|_| Error::InvalidReference(format!("bad digest in {reference}")))?
        } else {
            let cached = if skip_cache {
                None
            } else {
                self.refs.get_digest(reference)
            };
            match cached {
                Some(digest) => {
                    info!("ref cache hit ref={reference} digest={digest}");
                    self.emit(Event::ResolveHit);
                    digest
                }
                None => {
                    let descriptor = self.transport.resolve(reference).await?;
                    let digest = descriptor.digest().clone();
                    info!("resolved ref={reference} digest={digest}");
                    self.emit(Event::ResolveMiss);
                    if let Err(e) = self.refs.put_digest(reference, &digest) {
                        warn!("ref cache write for {reference} failed: {e}");
                    }
                    digest
                }
            }
        };

        let cached = if skip_cache {
            None
        } else {
            self.manifests.get(&digest)
        };
        let (manifest, raw) = match cached {
            Some((manifest, raw)) => {
                info!("manifest cache hit digest={digest}");
                self.emit(Event::ManifestHit);
                (manifest, raw)
            }
            None => {
                // size unknown here, so the transport's bound is bypassed;
                // the digest check below still gates the content
                let expected = Descriptor::new(MediaType::ImageManifest, 0, digest.clone());
                let (manifest, raw) = self.transport.fetch_manifest(reference, &expected).await?;
                info!("fetched manifest digest={digest} size={}", raw.len());
                self.emit(Event::ManifestMiss);
                if let Err(e) = self.manifests.put(&digest, &raw) {
                    warn!("manifest cache write for {digest} failed: {e}");
                }
                (manifest, raw)
            }
        };

        ArchiveManifest::new(digest, raw.len() as u64, manifest)
    }

    async fn pull_inner(
        &self,
        reference: &Reference,
        skip_cache: bool,
    ) -> Result<LazyArchive, Error> {
        let manifest = self.fetch_inner(reference, skip_cache).await?;
        let index = self.index_bytes(reference, &manifest, skip_cache).await?;

        let data = manifest.data_descriptor();
        let url = self.transport.blob_url(reference, data.digest());
        let headers: Arc<dyn HeaderSource> = Arc::new(TransportHeaders {
            transport: self.transport.clone(),
            reference: reference.clone(),
        });
        let source = HttpSource::connect(
            self.transport.http().clone(),
            url,
            headers,
            Some(data.digest().to_string()),
        )
        .await?;
        if source.size() != data.size() {
            return Err(Error::SizeMismatch {
                expected: data.size(),
                actual: source.size(),
            });
        }
        let source: Arc<dyn ByteSource> = match self.block_cache {
            Some((block_size, capacity)) => {
                Arc::new(BlockSource::new(Arc::new(source), block_size, capacity))
            }
            None => Arc::new(source),
        };

        Ok(LazyArchive {
            manifest,
            index,
            source,
        })
    }

    async fn index_bytes(
        &self,
        reference: &Reference,
        manifest: &ArchiveManifest,
        skip_cache: bool,
    ) -> Result<Bytes, Error> {
        let descriptor = manifest.index_descriptor();
        let digest = descriptor.digest();
        if self.max_index_size > 0 && descriptor.size() > self.max_index_size as u64 {
            return Err(Error::SizeMismatch {
                expected: self.max_index_size as u64,
                actual: descriptor.size(),
            });
        }

        if !skip_cache {
            if let Some(data) = self.indexes.get(digest) {
                // the cache verified the digest; the descriptor size check
                // guards against a manifest/blob disagreement
                if data.len() as u64 == descriptor.size() {
                    info!("index cache hit digest={digest}");
                    self.emit(Event::IndexHit);
                    return Ok(Bytes::from(data));
                }
                warn!("index cache entry {digest} has wrong length, deleting");
                if let Err(e) = self.indexes.delete(digest) {
                    warn!("index cache delete for {digest} failed: {e}");
                }
            }
        }

        let mut res = self.transport.fetch_blob(reference, descriptor).await?;
        let mut data = Vec::with_capacity(descriptor.size().min(1 << 20) as usize);
        while let Some(chunk) = res.chunk().await? {
            let total = (data.len() + chunk.len()) as u64;
            if self.max_index_size > 0 && total > self.max_index_size as u64 {
                return Err(Error::SizeMismatch {
                    expected: self.max_index_size as u64,
                    actual: total,
                });
            }
            data.extend_from_slice(&chunk);
        }
        verify_sized_data(digest, descriptor.size(), &data)?;
        info!("fetched index digest={digest} size={}", data.len());
        self.emit(Event::IndexMiss);
        if let Err(e) = self.indexes.put(digest, &data) {
            warn!("index cache write for {digest} failed: {e}");
        }
        Ok(Bytes::from(data))
    }
}

// per-request headers for the data source, derived from the transport's
// basic/static-bearer credentials and invalidated on 401
struct TransportHeaders {
    transport: ocidist::Client,
    reference: Reference,
}

impl HeaderSource for TransportHeaders {
    fn headers(&self) -> Result<HeaderMap, Error> {
        self.transport.auth_headers(&self.reference)
    }

    fn invalidate(&self) {
        self.transport.invalidate_auth_headers(&self.reference);
    }
}
