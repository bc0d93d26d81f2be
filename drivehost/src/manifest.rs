//! Cached parse of the archive metadata file.

use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{archive::ArchiveHandle, storage::ArchiveStorage};

/// Name of the metadata file inside an archive.
pub const MANIFEST_FILE: &str = "dat.json";

/// Archive metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Human readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Canonical url of the archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// All other fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Parse result of the metadata file at a given archive version.
#[derive(Debug, Clone)]
pub(crate) struct CachedManifest {
    manifest: Option<Manifest>,
    version: u64,
}

/// Get the manifest of an archive.
///
/// The parsed manifest is cached on the handle together with the archive version it was
/// read at, and only re-read once the version changes. A missing or unparsable metadata
/// file yields `None`; so do I/O errors, which are logged.
pub async fn manifest<A: ArchiveStorage>(handle: &ArchiveHandle<A>) -> Option<Manifest> {
    let version = handle.storage().version();
    let cached = {
        let slot = handle.manifest_slot().lock();
        slot.as_ref()
            .filter(|cached| cached.version == version)
            .map(|cached| cached.manifest.clone())
    };
    if let Some(manifest) = cached {
        return manifest;
    }

    let manifest = match read_manifest(handle.storage()).await {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(key = %handle.key().fmt_short(), ?err, "failed to read manifest");
            return None;
        }
    };
    *handle.manifest_slot().lock() = Some(CachedManifest {
        manifest: manifest.clone(),
        version,
    });
    manifest
}

/// Read and parse the metadata file of an archive, bypassing any cache.
///
/// Returns `Ok(None)` if the file is missing or not a valid manifest.
pub async fn read_manifest<A: ArchiveStorage>(archive: &A) -> io::Result<Option<Manifest>> {
    let Some(data) = archive.read_file(MANIFEST_FILE).await? else {
        return Ok(None);
    };
    match serde_json::from_slice::<Manifest>(&data) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(err) => {
            debug!(key = %archive.key().fmt_short(), %err, "invalid manifest");
            Ok(None)
        }
    }
}
