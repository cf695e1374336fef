use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use oci_spec::image::{Descriptor, Digest, ImageManifest};

use crate::error::Error;
use crate::{ANNOTATION_CREATED, ARTIFACT_TYPE, MEDIA_TYPE_DATA, MEDIA_TYPE_INDEX};

/// Validated, immutable snapshot of an archive manifest: the artifact type
/// matches, and there is exactly one index layer and one data layer (in
/// either order). Invariants hold at construction; the getters just read.
#[derive(Debug, Clone)]
pub struct ArchiveManifest {
    digest: Digest,
    size: u64,
    index: Descriptor,
    data: Descriptor,
    annotations: HashMap<String, String>,
    created: Option<DateTime<Utc>>,
    raw: ImageManifest,
}

impl ArchiveManifest {
    pub(crate) fn new(digest: Digest, size: u64, manifest: ImageManifest) -> Result<Self, Error> {
        match manifest.artifact_type() {
            Some(artifact_type) if artifact_type.to_string() == ARTIFACT_TYPE => {}
            Some(artifact_type) => {
                return Err(Error::InvalidManifest(format!(
                    "artifact type {artifact_type} is not {ARTIFACT_TYPE}"
                )));
            }
            None => {
                return Err(Error::InvalidManifest(format!(
                    "manifest has no artifact type, want {ARTIFACT_TYPE}"
                )));
            }
        }

        let index = single_layer(&manifest, MEDIA_TYPE_INDEX).ok_or(Error::MissingIndex)?;
        let data = single_layer(&manifest, MEDIA_TYPE_DATA).ok_or(Error::MissingData)?;

        let annotations = manifest
            .annotations()
            .as_ref()
            .cloned()
            .unwrap_or_default();
        let created = annotations.get(ANNOTATION_CREATED).and_then(|value| {
            match DateTime::parse_from_rfc3339(value) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => {
                    warn!("unparseable {ANNOTATION_CREATED} annotation {value:?}: {e}");
                    None
                }
            }
        });

        Ok(ArchiveManifest {
            digest,
            size,
            index,
            data,
            annotations,
            created,
            raw: manifest,
        })
    }

    /// Canonical digest of the manifest bytes as received.
    pub fn digest(&self) -> String {
        self.digest.to_string()
    }

    /// Descriptor of the manifest itself, sized by the bytes actually
    /// observed, usable as a referrers subject.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            oci_spec::image::MediaType::ImageManifest,
            self.size,
            self.digest.clone(),
        )
    }

    pub fn index_descriptor(&self) -> &Descriptor {
        &self.index
    }

    pub fn data_descriptor(&self) -> &Descriptor {
        &self.data
    }

    /// Never absent; an archive without annotations yields an empty map.
    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    /// The `org.opencontainers.image.created` annotation, when present and
    /// well-formed.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    /// The unparsed OCI manifest for callers that need the full shape.
    pub fn raw(&self) -> &ImageManifest {
        &self.raw
    }
}

// exactly one layer of the wanted media type, or None
fn single_layer(manifest: &ImageManifest, media_type: &str) -> Option<Descriptor> {
    let mut found = manifest
        .layers()
        .iter()
        .filter(|layer| layer.media_type().to_string() == media_type);
    match (found.next(), found.next()) {
        (Some(layer), None) => Some(layer.clone()),
        _ => None,
    }
}
