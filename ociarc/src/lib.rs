pub mod authcache;
pub mod blockcache;
pub mod credentials;
pub mod digest;
pub mod diskcache;
pub mod error;
pub mod httpsource;
pub mod manifest;
pub mod ocidist;
pub mod pull;
pub mod reference;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, ErrorKind};
pub use manifest::ArchiveManifest;
pub use pull::LazyArchive;
pub use reference::Reference;

/// Artifact type identifying an archive manifest.
pub const ARTIFACT_TYPE: &str = "application/vnd.ociarc.archive.v1";

/// Media type of the index layer (file metadata for random access).
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.ociarc.index.v1";

/// Media type of the data layer (path-sorted concatenated file contents).
pub const MEDIA_TYPE_DATA: &str = "application/vnd.ociarc.data.v1";

/// Media type of in-toto attestations attached as referrers.
pub const MEDIA_TYPE_IN_TOTO: &str = "application/vnd.in-toto+json";

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Descriptor of the standard empty JSON config blob (`{}`), used as the
/// config of every archive manifest.
pub fn empty_config_descriptor() -> oci_spec::image::Descriptor {
    use std::str::FromStr;
    oci_spec::image::Descriptor::new(
        oci_spec::image::MediaType::ImageConfig,
        2,
        oci_spec::image::Sha256Digest::from_str(
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
        )
        .unwrap(),
    )
}
