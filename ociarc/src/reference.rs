use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Hosts that all name Docker Hub. Credential lookup treats them as one
/// registry; wire requests always go to `registry-1.docker.io`.
pub const DOCKER_HUB_ALIASES: [&str; 3] =
    ["docker.io", "registry-1.docker.io", "index.docker.io"];

/// Legacy config-file key some tools still write Docker Hub credentials
/// under.
pub const DOCKER_HUB_LEGACY_KEY: &str = "https://index.docker.io/v1/";

/// A parsed registry reference of form `host[:port]/repo[:tag|@digest]`.
///
/// A reference without a tag or digest gets the `latest` tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    host: String,
    repository: String,
    kind: RefKind,
}

/// Tag-or-digest classifier for the trailing part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefKind {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn kind(&self) -> &RefKind {
        &self.kind
    }

    /// The tag or digest string, as sent in `/v2/<repo>/manifests/<ref>`.
    pub fn reference(&self) -> &str {
        match &self.kind {
            RefKind::Tag(t) => t,
            RefKind::Digest(d) => d,
        }
    }

    pub fn digest(&self) -> Option<&str> {
        match &self.kind {
            RefKind::Digest(d) => Some(d),
            RefKind::Tag(_) => None,
        }
    }

    pub fn is_docker_hub(&self) -> bool {
        is_docker_hub_host(&self.host)
    }

    /// Host to dial. `docker.io` is an alias clients must not send requests
    /// to; Docker Hub traffic goes to `registry-1.docker.io`.
    pub fn resolved_host(&self) -> &str {
        if self.host == "docker.io" || self.host == "index.docker.io" {
            "registry-1.docker.io"
        } else {
            &self.host
        }
    }

    /// Returns a copy of this reference pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Result<Reference, Error> {
        validate_digest(digest)?;
        Ok(Reference {
            host: self.host.clone(),
            repository: self.repository.clone(),
            kind: RefKind::Digest(normalize_digest(digest)),
        })
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = strip_scheme(s.trim());
        let Some((host, rest)) = s.split_once('/') else {
            return Err(invalid(s, "missing repository"));
        };
        if host.is_empty() {
            return Err(invalid(s, "empty host"));
        }
        if !looks_like_host(host) {
            return Err(invalid(s, "host must be a hostname or host:port"));
        }

        let (repository, kind) = if let Some((repo, digest)) = rest.split_once('@') {
            validate_digest(digest).map_err(|_| invalid(s, "malformed digest"))?;
            (repo, RefKind::Digest(normalize_digest(digest)))
        } else {
            match rest.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => {
                    if tag.is_empty() {
                        return Err(invalid(s, "empty tag"));
                    }
                    (repo, RefKind::Tag(tag.to_string()))
                }
                _ => (rest, RefKind::Tag("latest".to_string())),
            }
        };

        if !valid_repository(repository) {
            return Err(invalid(s, "malformed repository"));
        }

        Ok(Reference {
            host: host.to_string(),
            repository: repository.to_string(),
            kind,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            RefKind::Tag(t) => write!(f, "{}/{}:{}", self.host, self.repository, t),
            RefKind::Digest(d) => write!(f, "{}/{}@{}", self.host, self.repository, d),
        }
    }
}

fn invalid(input: &str, why: &str) -> Error {
    Error::InvalidReference(format!("{input:?}: {why}"))
}

/// Normalizes a user-supplied registry host: scheme prefix and any trailing
/// path are stripped, the port is preserved. Idempotent.
pub fn normalize_host(host: &str) -> &str {
    let host = strip_scheme(host.trim());
    match host.split_once('/') {
        Some((h, _)) => h,
        None => host,
    }
}

pub fn is_docker_hub_host(host: &str) -> bool {
    let host = normalize_host(host);
    DOCKER_HUB_ALIASES.contains(&host)
}

fn strip_scheme(s: &str) -> &str {
    s.strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .unwrap_or(s)
}

// host must contain a dot or a port, or be localhost, to disambiguate from
// the first repository component
fn looks_like_host(s: &str) -> bool {
    let (name, port) = match s.split_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (s, None),
    };
    if name.is_empty() {
        return false;
    }
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return false;
    }
    name == "localhost" || name.contains('.') || port.is_some()
}

// registry grammar: lowercase alphanumerics joined by separators (one
// period, one or two underscores, any run of dashes), components joined
// with /
fn valid_repository(repo: &str) -> bool {
    !repo.is_empty() && repo.split('/').all(valid_repo_component)
}

fn valid_repo_component(c: &str) -> bool {
    let bytes = c.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if alnum(b) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i] == b {
            i += 1;
        }
        let run_ok = match b {
            b'.' => i - start == 1,
            b'_' => i - start <= 2,
            b'-' => true,
            _ => false,
        };
        // a separator run must be followed by an alphanumeric, never
        // another separator kind
        if !run_ok || i == bytes.len() || !alnum(bytes[i]) {
            return false;
        }
    }
    true
}

/// Checks the `algorithm:hex` grammar without allocating.
pub fn validate_digest(s: &str) -> Result<(), Error> {
    let Some((algorithm, hex)) = s.split_once(':') else {
        return Err(Error::InvalidReference(format!(
            "digest {s:?} missing algorithm separator"
        )));
    };
    if algorithm.is_empty()
        || !algorithm
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'.' | b'-'))
    {
        return Err(Error::InvalidReference(format!(
            "digest {s:?} has malformed algorithm"
        )));
    }
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidReference(format!(
            "digest {s:?} has malformed hex"
        )));
    }
    Ok(())
}

// identity is byte-equality of the canonical string, so uppercase hex is
// folded before storing
fn normalize_digest(s: &str) -> String {
    match s.split_once(':') {
        Some((algo, hex)) => format!("{}:{}", algo, hex.to_ascii_lowercase()),
        None => s.to_string(),
    }
}
