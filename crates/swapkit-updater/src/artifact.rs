//! The downloaded artifact, from the downloader's report to a staged file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::checksum::ExpectedChecksum;
use crate::error::{DownloadError, UpdateError};
use crate::extract::ArchiveFormat;

/// File name used when neither headers nor URL yield one.
const FALLBACK_FILE_NAME: &str = "update.bin";

/// What the external downloader reports when a transfer ends.
#[derive(Debug, Default)]
pub struct CompletedDownload {
    /// Temporary file holding the downloaded bytes.
    pub local_file_path: PathBuf,
    /// The user cancelled the transfer.
    pub cancelled: bool,
    /// Transport failure, if any.
    pub error: Option<DownloadError>,
    /// Final URL after redirects.
    pub response_url: Option<String>,
    /// Response headers, keyed by name.
    pub response_headers: HashMap<String, String>,
    /// Digest the artifact must match.
    pub expected_checksum: Option<ExpectedChecksum>,
}

impl CompletedDownload {
    /// A successful download stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            local_file_path: path.into(),
            ..Self::default()
        }
    }

    /// A download the user cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    /// A download that failed in transport.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(DownloadError(error.into())),
            ..Self::default()
        }
    }

    /// Set the response URL.
    #[must_use]
    pub fn with_response_url(mut self, url: impl Into<String>) -> Self {
        self.response_url = Some(url.into());
        self
    }

    /// Add a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.insert(name.into(), value.into());
        self
    }

    /// Set the expected checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: ExpectedChecksum) -> Self {
        self.expected_checksum = Some(checksum);
        self
    }

    /// Looks up a header, ignoring ASCII case in the name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// File name to stage the artifact under.
    ///
    /// Taken from `Content-Disposition` when present, else from the last
    /// segment of the response URL, else from the temporary file.
    #[must_use]
    pub fn display_file_name(&self) -> String {
        self.header("Content-Disposition")
            .and_then(content_disposition_file_name)
            .or_else(|| self.response_url.as_deref().and_then(url_file_name))
            .or_else(|| {
                self.local_file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .and_then(|n| sanitize_file_name(&n))
            })
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
    }
}

/// The artifact of one update run, staged and ready for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Staged file.
    pub local_path: PathBuf,
    /// Digest to verify against; `None` skips verification.
    pub expected_checksum: Option<ExpectedChecksum>,
    /// Where the artifact was downloaded from.
    pub original_download_url: Option<String>,
}

impl ArtifactDescriptor {
    /// How the staged file is applied.
    #[must_use]
    pub fn kind(&self) -> ArtifactKind {
        ArtifactKind::from_path(&self.local_path)
    }
}

/// How an artifact is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Extracted into the installation directory.
    Archive(ArchiveFormat),
    /// Windows Installer package, run through `msiexec /i`.
    WindowsInstaller,
    /// Any other file is started as an installer.
    Executable,
}

impl ArtifactKind {
    /// Classifies a staged file by its name.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if let Some(format) = ArchiveFormat::from_file_name(&name) {
            Self::Archive(format)
        } else if name.ends_with(".msi") {
            Self::WindowsInstaller
        } else {
            Self::Executable
        }
    }
}

/// Moves the finished download into the staging directory under its display name.
///
/// An existing file of the same name is replaced.
pub fn stage_artifact(
    download: &CompletedDownload,
    staging_dir: &Path,
) -> Result<ArtifactDescriptor, UpdateError> {
    let staging_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| UpdateError::Staging { path, source }
    };

    fs::create_dir_all(staging_dir).map_err(staging_err(staging_dir))?;
    let target = staging_dir.join(download.display_file_name());

    if target != download.local_file_path {
        match fs::remove_file(&target) {
            Ok(()) => debug!("Replaced stale {}", target.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(staging_err(&target)(e)),
        }
        move_file(&download.local_file_path, &target).map_err(staging_err(&target))?;
    }

    let size = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
    info!("Staged {} ({})", target.display(), format_bytes(size));

    Ok(ArtifactDescriptor {
        local_path: target,
        expected_checksum: download.expected_checksum.clone(),
        original_download_url: download.response_url.clone(),
    })
}

/// Renames, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Extracts the file name from a `Content-Disposition` value.
///
/// `filename*` (RFC 5987) wins over `filename`.
#[must_use]
pub fn content_disposition_file_name(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                extended = Some(percent_decode(encoded));
            }
            "filename" => plain = Some(value.trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended
        .or(plain)
        .and_then(|name| sanitize_file_name(&name))
}

/// Last non-empty path segment of a URL, without query or fragment.
#[must_use]
pub fn url_file_name(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest.split_once('/').map_or("", |(_, p)| p));
    let segment = path.rsplit('/').find(|s| !s.is_empty())?;
    sanitize_file_name(&percent_decode(segment))
}

/// Keeps only the final component so the name cannot leave its directory.
fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    match last {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Format bytes as a human-readable string.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
