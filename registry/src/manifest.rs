//! Manifest model: image manifests and manifest lists/indexes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;

/// Manifest media types understood by the walker.
pub mod media_type {
    /// Docker schema 2 image manifest
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker schema 2 manifest list
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    /// OCI image manifest
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
}

/// An error indicating that manifest bytes could not be parsed
#[derive(Debug, Error)]
#[error("invalid manifest: {0}")]
pub struct InvalidManifest(String);

impl InvalidManifest {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A reference to a piece of content: media type, digest, and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content
    pub media_type: String,

    /// The digest of the referenced content
    pub digest: Digest,

    /// The size of the referenced content in bytes
    #[serde(default)]
    pub size: u64,
}

/// An image manifest: a config descriptor plus ordered layer descriptors,
/// optionally attached to a subject manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// The manifest schema version
    pub schema_version: u32,

    /// The manifest media type, when carried in the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The image configuration descriptor
    pub config: Descriptor,

    /// The ordered layer descriptors
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// The manifest this one is attached to, if any.
    ///
    /// The subject is an attachment pointer, not a dependency: it does not
    /// keep the referenced manifest alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

/// A manifest list/index: descriptors pointing at other manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// The manifest schema version
    pub schema_version: u32,

    /// The index media type, when carried in the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Descriptors of the referenced sub-manifests
    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    /// The manifest this index is attached to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

/// A parsed manifest: either a single image or a list/index.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// An image manifest
    Image(ImageManifest),
    /// A manifest list/index
    Index(ImageIndex),
}

impl Manifest {
    /// Parse manifest bytes, detecting the kind from the `mediaType` field
    /// or, failing that, from the document structure.
    pub fn parse(data: &[u8]) -> Result<Manifest, InvalidManifest> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|err| InvalidManifest::new(err.to_string()))?;

        let is_index = match value.get("mediaType").and_then(|v| v.as_str()) {
            Some(media_type::DOCKER_MANIFEST_LIST) | Some(media_type::OCI_INDEX) => true,
            Some(media_type::DOCKER_MANIFEST) | Some(media_type::OCI_MANIFEST) => false,
            Some(other) => return Err(InvalidManifest::new(format!("media type {other}"))),
            None => value.get("manifests").is_some(),
        };

        if is_index {
            serde_json::from_value(value)
                .map(Manifest::Index)
                .map_err(|err| InvalidManifest::new(err.to_string()))
        } else {
            serde_json::from_value(value)
                .map(Manifest::Image)
                .map_err(|err| InvalidManifest::new(err.to_string()))
        }
    }

    /// Whether this manifest is a list/index
    pub fn is_index(&self) -> bool {
        matches!(self, Manifest::Index(_))
    }

    /// The blob descriptors this manifest depends on directly (config and
    /// layers). Empty for an index.
    pub fn referenced_blobs(&self) -> Vec<&Descriptor> {
        match self {
            Manifest::Image(image) => std::iter::once(&image.config)
                .chain(image.layers.iter())
                .collect(),
            Manifest::Index(_) => Vec::new(),
        }
    }

    /// The sub-manifest descriptors, for a list/index. Empty for an image.
    pub fn child_manifests(&self) -> &[Descriptor] {
        match self {
            Manifest::Image(_) => &[],
            Manifest::Index(index) => &index.manifests,
        }
    }

    /// The subject descriptor, if this manifest is attached to another one.
    pub fn subject(&self) -> Option<&Descriptor> {
        match self {
            Manifest::Image(image) => image.subject.as_ref(),
            Manifest::Index(index) => index.subject.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(media_type: &str, digest: &Digest) -> serde_json::Value {
        serde_json::json!({
            "mediaType": media_type,
            "digest": digest.as_str(),
            "size": 1234,
        })
    }

    #[test]
    fn parses_image_manifest() {
        let config = Digest::sha256(b"config");
        let layer_a = Digest::sha256(b"layer-a");
        let layer_b = Digest::sha256(b"layer-b");
        let data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::OCI_MANIFEST,
            "config": descriptor("application/vnd.oci.image.config.v1+json", &config),
            "layers": [
                descriptor("application/vnd.oci.image.layer.v1.tar+gzip", &layer_a),
                descriptor("application/vnd.oci.image.layer.v1.tar+gzip", &layer_b),
            ],
        }))
        .unwrap();

        let manifest = Manifest::parse(&data).unwrap();
        assert!(!manifest.is_index());

        let blobs: Vec<_> = manifest
            .referenced_blobs()
            .into_iter()
            .map(|d| d.digest.clone())
            .collect();
        assert_eq!(blobs, vec![config, layer_a, layer_b]);
        assert!(manifest.child_manifests().is_empty());
        assert!(manifest.subject().is_none());
    }

    #[test]
    fn parses_index_by_structure_without_media_type() {
        let child = Digest::sha256(b"child");
        let data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [descriptor(media_type::OCI_MANIFEST, &child)],
        }))
        .unwrap();

        let manifest = Manifest::parse(&data).unwrap();
        assert!(manifest.is_index());
        assert_eq!(manifest.child_manifests().len(), 1);
        assert_eq!(manifest.child_manifests()[0].digest, child);
        assert!(manifest.referenced_blobs().is_empty());
    }

    #[test]
    fn parses_subject_field() {
        let subject = Digest::sha256(b"subject");
        let config = Digest::sha256(b"config");
        let data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::OCI_MANIFEST,
            "config": descriptor("application/vnd.oci.image.config.v1+json", &config),
            "layers": [],
            "subject": descriptor(media_type::OCI_MANIFEST, &subject),
        }))
        .unwrap();

        let manifest = Manifest::parse(&data).unwrap();
        assert_eq!(manifest.subject().unwrap().digest, subject);
    }

    #[test]
    fn rejects_unknown_media_type_and_bad_json() {
        let data = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/x-unknown",
        }))
        .unwrap();
        assert!(Manifest::parse(&data).is_err());
        assert!(Manifest::parse(b"not json at all").is_err());
    }
}
