use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::{error, info, trace, warn};
use oci_spec::image::{Digest, DigestAlgorithm, ImageManifest};
use rustix::{
    fd::OwnedFd,
    fs::{AtFlags, Dir, FileType, Mode, OFlags, ResolveFlags},
    io::Errno,
};

use crate::digest::{sha256_hex, verify_data};
use crate::error::Error;
use crate::reference::{Reference, validate_digest};

pub const DEFAULT_SHARD_PREFIX_LEN: usize = 2;

const TMP_SUFFIX: &str = ".tmp";
const CREATE_RETRIES: u32 = 4;

/// A cache entry name: non-empty lowercase hex. Hex-only names cannot
/// traverse directories, and all file operations additionally go through
/// the root descriptor with `RESOLVE_BENEATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if s.is_empty()
            || !s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::InvalidDescriptor(format!(
                "cache key {s:?} is not lowercase hex"
            )));
        }
        Ok(CacheKey(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheDirOptions {
    /// Total size bound in bytes. 0 is unlimited; negative is a
    /// construction error.
    pub max_bytes: i64,
    /// Leading hex characters used as a subdirectory name; 0 stores flat
    /// files. Sharding is cosmetic, the hex alone identifies the entry.
    pub shard_prefix_len: usize,
}

impl Default for CacheDirOptions {
    fn default() -> Self {
        CacheDirOptions {
            max_bytes: 0,
            shard_prefix_len: DEFAULT_SHARD_PREFIX_LEN,
        }
    }
}

/// One directory of content-addressed entries, addressed relative to an
/// anchored root descriptor. Writes are write-temp-then-rename within the
/// target directory so readers never observe a torn file; renames are
/// atomic within the same filesystem.
pub struct CacheDir {
    root: OwnedFd,
    shard_prefix_len: usize,
    max_bytes: u64,
    tmp_prefix: &'static str,
    total: AtomicU64,
    prune_lock: Mutex<()>,
}

struct ScanEntry {
    rel: String,
    size: u64,
    mtime: i64,
}

impl CacheDir {
    pub fn open(
        path: impl AsRef<Path>,
        tmp_prefix: &'static str,
        options: CacheDirOptions,
    ) -> Result<Self, Error> {
        if options.max_bytes < 0 {
            return Err(Error::InvalidDescriptor(format!(
                "negative cache size bound {}",
                options.max_bytes
            )));
        }
        std::fs::create_dir_all(path.as_ref())?;
        let root = rustix::fs::open(
            path.as_ref(),
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let cache = CacheDir {
            root,
            shard_prefix_len: options.shard_prefix_len,
            max_bytes: options.max_bytes as u64,
            tmp_prefix,
            total: AtomicU64::new(0),
            prune_lock: Mutex::new(()),
        };
        let mut total = 0u64;
        for entry in cache.scan()? {
            total += entry.size;
        }
        cache.total.store(total, Ordering::Relaxed);
        Ok(cache)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn rel_path(&self, key: &CacheKey) -> String {
        let hex = key.as_str();
        if self.shard_prefix_len > 0 && hex.len() > self.shard_prefix_len {
            format!("{}/{}", &hex[..self.shard_prefix_len], hex)
        } else {
            hex.to_string()
        }
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, Error> {
        use std::io::Read;
        let rel = self.rel_path(key);
        match rustix::fs::openat2(
            &self.root,
            &rel,
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        ) {
            Ok(fd) => {
                let mut data = Vec::new();
                std::fs::File::from(fd).read_to_end(&mut data)?;
                Ok(Some(data))
            }
            Err(Errno::NOENT) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores `value` under `key`. A key that already exists is a no-op
    /// (entries are content-addressed, so the bytes are identical). A value
    /// that alone exceeds the size bound is silently skipped.
    pub fn put(&self, key: &CacheKey, value: &[u8]) -> Result<(), Error> {
        let rel = self.rel_path(key);
        if self.exists(&rel)? {
            trace!("cache entry {key} already present");
            return Ok(());
        }
        let incoming = value.len() as u64;
        if self.max_bytes > 0 {
            if incoming > self.max_bytes {
                info!("cache entry {key} of {incoming} bytes exceeds the bound, skipping");
                return Ok(());
            }
            if self.total.load(Ordering::Relaxed) + incoming > self.max_bytes {
                self.prune(self.max_bytes - incoming)?;
            }
        }
        if self.write_entry(&rel, value)? {
            self.total.fetch_add(incoming, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn delete(&self, key: &CacheKey) -> Result<(), Error> {
        let rel = self.rel_path(key);
        let size = match rustix::fs::statat(&self.root, &rel, AtFlags::empty()) {
            Ok(stat) => stat.st_size as u64,
            Err(Errno::NOENT) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match rustix::fs::unlinkat(&self.root, &rel, AtFlags::empty()) {
            Ok(()) => {
                self.total.fetch_sub(size.min(self.total_bytes()), Ordering::Relaxed);
                Ok(())
            }
            Err(Errno::NOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes entries, oldest modification time first (name as the tie
    /// break, so eviction is deterministic given the on-disk state), until
    /// the total size is at most `target`.
    pub fn prune(&self, target: u64) -> Result<(), Error> {
        let _guard = self.prune_lock.lock().unwrap();
        if self.total.load(Ordering::Relaxed) <= target {
            return Ok(());
        }
        let mut entries = self.scan()?;
        entries.sort_by(|a, b| (a.mtime, &a.rel).cmp(&(b.mtime, &b.rel)));
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let mut dropped = 0u64;
        for entry in entries {
            if total <= target {
                break;
            }
            match rustix::fs::unlinkat(&self.root, &entry.rel, AtFlags::empty()) {
                Ok(()) | Err(Errno::NOENT) => {
                    total -= entry.size;
                    dropped += entry.size;
                    trace!("pruned cache entry {}", entry.rel);
                }
                Err(e) => {
                    error!("failed to prune cache entry {}: {e}", entry.rel);
                }
            }
        }
        self.total.store(total, Ordering::Relaxed);
        info!("pruned {dropped} bytes, {total} bytes remain");
        Ok(())
    }

    fn exists(&self, rel: &str) -> Result<bool, Error> {
        match rustix::fs::statat(&self.root, rel, AtFlags::empty()) {
            Ok(_) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // false when another writer won the race for the same key
    fn write_entry(&self, rel: &str, value: &[u8]) -> Result<bool, Error> {
        use std::io::Write;
        if let Some((shard, _)) = rel.split_once('/') {
            match rustix::fs::mkdirat(&self.root, shard, Mode::from_bits_truncate(0o755)) {
                Ok(()) | Err(Errno::EXIST) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let dir_rel = match rel.rsplit_once('/') {
            Some((dir, _)) => Some(dir),
            None => None,
        };
        let (fd, mut guard) = self.create_tmp(dir_rel)?;
        let mut file = std::fs::File::from(fd);
        file.write_all(value)?;
        file.sync_data()?;
        drop(file);
        guard.commit(rel)
    }

    // O_CREAT|O_EXCL with a fresh random suffix on each collision
    fn create_tmp(&self, dir_rel: Option<&str>) -> Result<(OwnedFd, TmpGuard<'_>), Error> {
        for _ in 0..CREATE_RETRIES {
            let name = format!("{}{:08x}{}", self.tmp_prefix, rand::random::<u32>(), TMP_SUFFIX);
            let rel = match dir_rel {
                Some(dir) => format!("{dir}/{name}"),
                None => name,
            };
            match rustix::fs::openat2(
                &self.root,
                &rel,
                OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
                Mode::from_bits_truncate(0o644),
                ResolveFlags::BENEATH,
            ) {
                Ok(fd) => {
                    return Ok((
                        fd,
                        TmpGuard {
                            root: &self.root,
                            rel: Some(rel),
                        },
                    ));
                }
                Err(Errno::EXIST) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Errno::EXIST.into())
    }

    // entries are either hex files at the root (flat layout) or hex files
    // one level down in a shard directory; anything else (stale temp files
    // included) is ignored
    fn scan(&self) -> Result<Vec<ScanEntry>, Error> {
        let mut entries = Vec::new();
        let mut dir_reader = Dir::read_from(&self.root)?;
        dir_reader.rewind();
        let mut shards = Vec::new();
        while let Some(entry) = dir_reader.read() {
            let entry = entry?;
            if entry.file_name() == c"." || entry.file_name() == c".." {
                continue;
            }
            let Ok(name) = entry.file_name().to_str() else {
                continue;
            };
            match entry.file_type() {
                FileType::RegularFile if is_hex_name(name) => {
                    let stat = rustix::fs::statat(&self.root, name, AtFlags::empty())?;
                    entries.push(ScanEntry {
                        rel: name.to_string(),
                        size: stat.st_size as u64,
                        mtime: stat.st_mtime as i64,
                    });
                }
                FileType::Directory if is_hex_name(name) => {
                    shards.push(name.to_string());
                }
                _ => {}
            }
        }
        for shard in shards {
            let shard_fd = rustix::fs::openat2(
                &self.root,
                &shard,
                OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
                Mode::empty(),
                ResolveFlags::BENEATH,
            )?;
            let mut shard_reader = Dir::read_from(&shard_fd)?;
            shard_reader.rewind();
            while let Some(entry) = shard_reader.read() {
                let entry = entry?;
                if entry.file_name() == c"." || entry.file_name() == c".." {
                    continue;
                }
                let Ok(name) = entry.file_name().to_str() else {
                    continue;
                };
                if entry.file_type() != FileType::RegularFile || !is_hex_name(name) {
                    continue;
                }
                let rel = format!("{shard}/{name}");
                let stat = rustix::fs::statat(&self.root, &rel, AtFlags::empty())?;
                entries.push(ScanEntry {
                    rel,
                    size: stat.st_size as u64,
                    mtime: stat.st_mtime as i64,
                });
            }
        }
        Ok(entries)
    }
}

fn is_hex_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// unlinks the temp file unless it was renamed into place
struct TmpGuard<'a> {
    root: &'a OwnedFd,
    rel: Option<String>,
}

impl TmpGuard<'_> {
    // rename-noreplace keeps racing writers honest: the loser observes the
    // target already present, removes its temp file, and both puts succeed
    fn commit(&mut self, final_rel: &str) -> Result<bool, Error> {
        let Some(rel) = self.rel.take() else {
            return Ok(false);
        };
        match rustix::fs::renameat_with(
            self.root,
            &rel,
            self.root,
            final_rel,
            rustix::fs::RenameFlags::NOREPLACE,
        ) {
            Ok(()) => Ok(true),
            Err(Errno::EXIST) => {
                if let Err(e) = rustix::fs::unlinkat(self.root, &rel, AtFlags::empty()) {
                    error!("failed to remove temp file {rel}: {e}");
                }
                Ok(false)
            }
            Err(e) => {
                self.rel = Some(rel);
                Err(e.into())
            }
        }
    }
}

impl Drop for TmpGuard<'_> {
    fn drop(&mut self) {
        if let Some(rel) = self.rel.take() {
            if let Err(e) = rustix::fs::unlinkat(self.root, &rel, AtFlags::empty()) {
                error!("failed to remove temp file {rel}: {e}");
            }
        }
    }
}

/// reference -> canonical digest string, keyed by the hash of the raw
/// reference bytes.
pub struct RefCache {
    dir: CacheDir,
}

impl RefCache {
    pub fn open(path: impl AsRef<Path>, options: CacheDirOptions) -> Result<Self, Error> {
        Ok(RefCache {
            dir: CacheDir::open(path, "ref-", options)?,
        })
    }

    fn key(reference: &Reference) -> CacheKey {
        // the output of sha256_hex always satisfies the key grammar
        CacheKey::new(sha256_hex(reference.to_string())).unwrap()
    }

    /// Cached digest for `reference`, or a miss. Bytes that do not satisfy
    /// the `algorithm:hex` grammar are poison: the entry is deleted and the
    /// lookup reports a miss.
    pub fn get_digest(&self, reference: &Reference) -> Option<Digest> {
        let key = Self::key(reference);
        let data = match self.dir.get(&key) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                error!("ref cache read for {reference} failed: {e}");
                return None;
            }
        };
        let parsed = std::str::from_utf8(&data)
            .ok()
            .filter(|s| validate_digest(s).is_ok())
            .and_then(|s| s.parse::<Digest>().ok());
        match parsed {
            Some(digest) => Some(digest),
            None => {
                warn!("ref cache entry for {reference} is not a digest, deleting");
                self.delete_poisoned(&key);
                None
            }
        }
    }

    pub fn put_digest(&self, reference: &Reference, digest: &Digest) -> Result<(), Error> {
        self.dir
            .put(&Self::key(reference), digest.to_string().as_bytes())
    }

    pub fn prune(&self, target: u64) -> Result<(), Error> {
        self.dir.prune(target)
    }

    pub fn total_bytes(&self) -> u64 {
        self.dir.total_bytes()
    }

    fn delete_poisoned(&self, key: &CacheKey) {
        if let Err(e) = self.dir.delete(key) {
            error!("failed to delete poisoned ref cache entry {key}: {e}");
        }
    }
}

/// manifest digest -> raw manifest bytes, verified and parsed on the way
/// out.
pub struct ManifestCache {
    dir: CacheDir,
}

impl ManifestCache {
    pub fn open(path: impl AsRef<Path>, options: CacheDirOptions) -> Result<Self, Error> {
        Ok(ManifestCache {
            dir: CacheDir::open(path, "manifest-", options)?,
        })
    }

    /// Cached manifest for `digest`. The bytes are re-hashed against the
    /// requested key and parsed; entries failing either check are deleted
    /// and reported as a miss.
    pub fn get(&self, digest: &Digest) -> Option<(ImageManifest, Bytes)> {
        let key = digest_key(digest)?;
        let data = match self.dir.get(&key) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                error!("manifest cache read for {digest} failed: {e}");
                return None;
            }
        };
        if verify_data(digest, &data).is_err() {
            warn!("manifest cache entry {digest} fails its digest, deleting");
            self.delete_poisoned(&key);
            return None;
        }
        match ImageManifest::from_reader(std::io::Cursor::new(&data)) {
            Ok(manifest) => Some((manifest, Bytes::from(data))),
            Err(e) => {
                warn!("manifest cache entry {digest} does not parse ({e}), deleting");
                self.delete_poisoned(&key);
                None
            }
        }
    }

    pub fn put(&self, digest: &Digest, raw: &[u8]) -> Result<(), Error> {
        match digest_key(digest) {
            Some(key) => self.dir.put(&key, raw),
            None => Ok(()),
        }
    }

    pub fn prune(&self, target: u64) -> Result<(), Error> {
        self.dir.prune(target)
    }

    pub fn total_bytes(&self) -> u64 {
        self.dir.total_bytes()
    }

    fn delete_poisoned(&self, key: &CacheKey) {
        if let Err(e) = self.dir.delete(key) {
            error!("failed to delete poisoned manifest cache entry {key}: {e}");
        }
    }
}

/// index blob digest -> raw index bytes, re-hashed on the way out.
pub struct IndexCache {
    dir: CacheDir,
}

impl IndexCache {
    pub fn open(path: impl AsRef<Path>, options: CacheDirOptions) -> Result<Self, Error> {
        Ok(IndexCache {
            dir: CacheDir::open(path, "index-", options)?,
        })
    }

    pub fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
        let key = digest_key(digest)?;
        let data = match self.dir.get(&key) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                error!("index cache read for {digest} failed: {e}");
                return None;
            }
        };
        if verify_data(digest, &data).is_err() {
            warn!("index cache entry {digest} fails its digest, deleting");
            if let Err(e) = self.dir.delete(&key) {
                error!("failed to delete poisoned index cache entry {key}: {e}");
            }
            return None;
        }
        Some(data)
    }

    pub fn put(&self, digest: &Digest, raw: &[u8]) -> Result<(), Error> {
        match digest_key(digest) {
            Some(key) => self.dir.put(&key, raw),
            None => Ok(()),
        }
    }

    pub fn delete(&self, digest: &Digest) -> Result<(), Error> {
        match digest_key(digest) {
            Some(key) => self.dir.delete(&key),
            None => Ok(()),
        }
    }

    pub fn prune(&self, target: u64) -> Result<(), Error> {
        self.dir.prune(target)
    }

    pub fn total_bytes(&self) -> u64 {
        self.dir.total_bytes()
    }
}

// only sha256 entries are stored; other algorithms simply never hit
fn digest_key(digest: &Digest) -> Option<CacheKey> {
    if *digest.algorithm() != DigestAlgorithm::Sha256 {
        return None;
    }
    CacheKey::new(digest.digest().to_string()).ok()
}
