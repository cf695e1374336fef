use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use base64::Engine;
use log::{debug, warn};
use serde::Deserialize;

use crate::error::Error;
use crate::reference::{
    DOCKER_HUB_ALIASES, DOCKER_HUB_LEGACY_KEY, is_docker_hub_host, normalize_host,
};

/// A credential for one registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic(String, String),
    Bearer(String),
    Empty,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        matches!(self, Credential::Empty)
    }

    /// Authorization header value, or `None` for [`Credential::Empty`].
    pub fn header_value(&self) -> Option<String> {
        match self {
            Credential::Basic(user, pass) => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{user}:{pass}"));
                Some(format!("Basic {encoded}"))
            }
            Credential::Bearer(token) => Some(format!("Bearer {token}")),
            Credential::Empty => None,
        }
    }
}

/// Host-keyed credential lookup. Host equality is normalized (scheme and
/// path stripped, port preserved). A host without an entry is
/// [`Credential::Empty`], not an error.
pub trait CredentialStore: Send + Sync {
    fn get(&self, host: &str) -> Result<Credential, Error>;

    fn put(&self, _host: &str, _credential: Credential) -> Result<(), Error> {
        Err(Error::StaticCredentialStore)
    }

    fn delete(&self, _host: &str) -> Result<(), Error> {
        Err(Error::StaticCredentialStore)
    }
}

/// Looks up `host`, walking the Docker Hub alias set (and the legacy
/// `https://index.docker.io/v1/` form, in that order) when the host itself
/// has no entry.
pub fn lookup(store: &dyn CredentialStore, host: &str) -> Result<Credential, Error> {
    let host = normalize_host(host);
    let found = store.get(host)?;
    if !found.is_empty() || !is_docker_hub_host(host) {
        return Ok(found);
    }
    for alias in DOCKER_HUB_ALIASES
        .iter()
        .copied()
        .chain([DOCKER_HUB_LEGACY_KEY])
    {
        let found = store.get(alias)?;
        if !found.is_empty() {
            debug!("credential for {host} found under alias {alias}");
            return Ok(found);
        }
    }
    Ok(Credential::Empty)
}

/// Fixed credential map, typically loaded from a config file by the caller.
#[derive(Default)]
pub struct StaticStore {
    entries: BTreeMap<String, Credential>,
}

impl StaticStore {
    pub fn new(entries: impl IntoIterator<Item = (String, Credential)>) -> Self {
        StaticStore {
            entries: entries
                .into_iter()
                .map(|(host, cred)| (normalize_host(&host).to_string(), cred))
                .collect(),
        }
    }
}

impl CredentialStore for StaticStore {
    fn get(&self, host: &str) -> Result<Credential, Error> {
        Ok(self
            .entries
            .get(normalize_host(host))
            .cloned()
            .unwrap_or(Credential::Empty))
    }
}

#[derive(Deserialize, Default)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: BTreeMap<String, String>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Deserialize, Default)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

/// Credentials from the standard container-engine config file
/// (`~/.docker/config.json`) and its credential-helper programs. A missing
/// or unreadable file yields a store that answers every lookup with
/// [`Credential::Empty`].
pub struct DockerConfigStore {
    auths: BTreeMap<String, DockerAuthEntry>,
    cred_helpers: BTreeMap<String, String>,
    creds_store: Option<String>,
}

impl DockerConfigStore {
    pub fn from_default_path() -> Self {
        let path = std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".docker/config.json"));
        match path {
            Some(path) => Self::from_path(&path),
            None => {
                debug!("no home directory, using anonymous credentials");
                Self::empty()
            }
        }
    }

    pub fn from_path(path: &Path) -> Self {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                debug!("no docker config at {path:?}: {e}");
                return Self::empty();
            }
        };
        match serde_json::from_slice::<DockerConfigFile>(&data) {
            Ok(config) => Self {
                auths: config
                    .auths
                    .into_iter()
                    .map(|(host, entry)| (normalize_host(&host).to_string(), entry))
                    .collect(),
                cred_helpers: config
                    .cred_helpers
                    .into_iter()
                    .map(|(host, helper)| (normalize_host(&host).to_string(), helper))
                    .collect(),
                creds_store: config.creds_store,
            },
            Err(e) => {
                warn!("failed to parse docker config {path:?}: {e}");
                Self::empty()
            }
        }
    }

    fn empty() -> Self {
        Self {
            auths: BTreeMap::new(),
            cred_helpers: BTreeMap::new(),
            creds_store: None,
        }
    }

    fn from_auth_entry(entry: &DockerAuthEntry) -> Credential {
        if let Some(token) = &entry.identitytoken {
            return Credential::Bearer(token.clone());
        }
        if let Some(auth) = &entry.auth {
            match base64::engine::general_purpose::STANDARD
                .decode(auth)
                .ok()
                .and_then(|decoded| String::from_utf8(decoded).ok())
            {
                Some(decoded) => {
                    if let Some((user, pass)) = decoded.split_once(':') {
                        return Credential::Basic(user.to_string(), pass.to_string());
                    }
                }
                None => {
                    warn!("undecodable auth entry in docker config");
                }
            }
        }
        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Credential::Basic(user.clone(), pass.clone());
        }
        Credential::Empty
    }
}

impl CredentialStore for DockerConfigStore {
    fn get(&self, host: &str) -> Result<Credential, Error> {
        let host = normalize_host(host);
        if let Some(helper) = self.cred_helpers.get(host) {
            return Ok(run_credential_helper(helper, host));
        }
        if let Some(entry) = self.auths.get(host) {
            let cred = Self::from_auth_entry(entry);
            if !cred.is_empty() {
                return Ok(cred);
            }
        }
        if let Some(helper) = &self.creds_store {
            return Ok(run_credential_helper(helper, host));
        }
        Ok(Credential::Empty)
    }
}

#[derive(Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

// `docker-credential-<name> get` reads the host from stdin and prints
// {"Username": ..., "Secret": ...}; a username of <token> marks an identity
// token. Helper failures degrade to anonymous.
fn run_credential_helper(name: &str, host: &str) -> Credential {
    let program = format!("docker-credential-{name}");
    let child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            debug!("credential helper {program} failed to start: {e}");
            return Credential::Empty;
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(host.as_bytes());
    }
    let output = match child.wait_with_output() {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!("credential helper {program} exited with {}", output.status);
            return Credential::Empty;
        }
        Err(e) => {
            debug!("credential helper {program} failed: {e}");
            return Credential::Empty;
        }
    };
    match serde_json::from_slice::<HelperOutput>(&output.stdout) {
        Ok(out) if out.username == "<token>" => Credential::Bearer(out.secret),
        Ok(out) => Credential::Basic(out.username, out.secret),
        Err(e) => {
            debug!("credential helper {program} produced bad output: {e}");
            Credential::Empty
        }
    }
}
