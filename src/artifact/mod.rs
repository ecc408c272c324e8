//! Artifact fetching and unpacking.
//!
//! Resolves `(repo, name, version, platform, artifact)` to an on-disk install
//! directory under the versioned cache, fetching over file:// or http(s)://
//! and unpacking `.tar.gz` or `.zip` archives. Extraction refuses any entry
//! that would escape the cache subtree.

use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::model::ProgramSpec;

const COPY_BUF_SIZE: usize = 64 * 1024;

pub struct Fetcher {
    cache_root: PathBuf,
    default_repo: String,
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.http_client_timeout)
            .connect_timeout(cfg.http_header_timeout)
            .read_timeout(cfg.http_header_timeout)
            .build()
            .map_err(|e| Error::FetchFailed {
                status: 0,
                body: format!("building http client: {e}"),
            })?;

        Ok(Self {
            cache_root: cfg.bpf_dir.clone(),
            default_repo: cfg.artifact_repo_url.clone(),
            client,
        })
    }

    /// Return the install directory for a program, fetching and unpacking the
    /// artifact only if it is not already cached. The cache key is
    /// `(name, version)`, so a restart skips all I/O.
    pub async fn verify_and_get(&self, spec: &ProgramSpec) -> Result<PathBuf> {
        let install = install_dir(&self.cache_root, &spec.name, &spec.version, &spec.artifact);
        if install.is_dir() {
            debug!(program = %spec.name, path = %install.display(), "artifact already cached");
            return Ok(install);
        }

        let repo = spec
            .artifact_repo_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.default_repo);

        let platform = platform_tag();
        let url = artifact_url(repo, &spec.name, &spec.version, &platform, &spec.artifact);
        info!(program = %spec.name, url = %url, "retrieving artifact");

        let bytes = self.fetch_bytes(&url).await?;

        let extract_root = self.cache_root.join(&spec.name).join(&spec.version);
        unpack(&spec.artifact, &bytes, &extract_root)?;

        Ok(install)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        match url.split_once("://") {
            Some(("http" | "https", _)) => {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| Error::FetchFailed {
                        status: 0,
                        body: e.to_string(),
                    })?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::FetchFailed {
                        status: status.as_u16(),
                        body: body.chars().take(256).collect(),
                    });
                }

                let bytes = resp.bytes().await.map_err(|e| Error::FetchFailed {
                    status: status.as_u16(),
                    body: e.to_string(),
                })?;
                Ok(bytes.to_vec())
            }
            Some(("file", path)) => {
                if !Path::new(path).is_file() {
                    return Err(Error::ArtifactNotFound(url.to_string()));
                }
                Ok(std::fs::read(path)?)
            }
            _ => Err(Error::ArtifactNotFound(url.to_string())),
        }
    }
}

/// Compose `<base>/<name>/<version>/<platform>/<artifact>`.
fn artifact_url(base: &str, name: &str, version: &str, platform: &str, artifact: &str) -> String {
    format!(
        "{}/{name}/{version}/{platform}/{artifact}",
        base.trim_end_matches('/'),
    )
}

/// Install directory: extraction root plus the artifact name with its archive
/// suffix stripped (`ratelimit.tar.gz` installs into `.../ratelimit`). Only
/// the suffixes `unpack()` recognizes are stripped, so a dotted base name
/// stays intact.
fn install_dir(cache_root: &Path, name: &str, version: &str, artifact: &str) -> PathBuf {
    let base = artifact
        .strip_suffix(".tar.gz")
        .or_else(|| artifact.strip_suffix(".zip"))
        .unwrap_or(artifact);
    cache_root.join(name).join(version).join(base)
}

/// Validate an archive entry path and resolve it under the extraction root.
///
/// Rejects entries containing `..`, absolute entries, and anything whose
/// joined path does not remain inside the root.
pub fn validate_entry_path(entry: &str, root: &Path) -> Result<PathBuf> {
    if entry.split('/').any(|c| c == "..") {
        return Err(Error::IllegalPath(entry.to_string()));
    }
    let rel = Path::new(entry);
    if rel.is_absolute() {
        return Err(Error::IllegalPath(entry.to_string()));
    }
    let dest = root.join(rel);
    if !dest.starts_with(root) {
        return Err(Error::IllegalPath(entry.to_string()));
    }
    Ok(dest)
}

fn unpack(artifact: &str, bytes: &[u8], extract_root: &Path) -> Result<()> {
    std::fs::create_dir_all(extract_root)?;

    if artifact.ends_with(".zip") {
        unpack_zip(bytes, extract_root)
    } else if artifact.ends_with(".tar.gz") {
        unpack_tar_gz(bytes, extract_root)
    } else {
        Err(Error::UnknownArchiveFormat(artifact.to_string()))
    }
}

fn unpack_zip(bytes: &[u8], root: &Path) -> Result<()> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| Error::ExtractionFailed(e.to_string()))?;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| Error::ExtractionFailed(e.to_string()))?;

        let dest = validate_entry_path(&file.name().to_string(), root)?;

        if file.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_entry(&mut file, &dest, &mut buf)?;
        }

        if let Some(mode) = file.unix_mode() {
            let _ = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode));
        }
    }

    Ok(())
}

fn unpack_tar_gz(bytes: &[u8], root: &Path) -> Result<()> {
    let gz = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(gz);

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let entries = archive
        .entries()
        .map_err(|e| Error::ExtractionFailed(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ExtractionFailed(e.to_string()))?;

        let entry_path = entry
            .path()
            .map_err(|e| Error::ExtractionFailed(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let dest = validate_entry_path(&entry_path, root)?;

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);

        match header.entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
                let _ = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode));
            }
            tar::EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                write_entry(&mut entry, &dest, &mut buf)?;
                let _ = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode));
            }
            other => {
                debug!(entry = %entry_path, kind = ?other, "skipping archive entry");
            }
        }
    }

    Ok(())
}

fn write_entry<R: Read>(src: &mut R, dest: &Path, buf: &mut [u8]) -> Result<()> {
    use std::io::Write;

    let mut out = std::fs::File::create(dest)?;
    loop {
        let n = src
            .read(buf)
            .map_err(|e| Error::ExtractionFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    Ok(())
}

/// Platform tag used as the artifact URL path segment.
///
/// Uses the distribution codename when the OS publishes one, otherwise
/// `<id><major-version>`, otherwise a bare `linux`.
pub fn platform_tag() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|data| platform_from_os_release(&data))
        .unwrap_or_else(|| "linux".to_string())
}

fn platform_from_os_release(data: &str) -> Option<String> {
    let mut id = None;
    let mut version_id = None;

    for line in data.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match key {
            "VERSION_CODENAME" if !value.is_empty() => return Some(value.to_string()),
            "ID" => id = Some(value.to_string()),
            "VERSION_ID" => version_id = Some(value.to_string()),
            _ => {}
        }
    }

    let id = id?;
    let major = version_id?.split('.').next()?.to_string();
    Some(format!("{id}{major}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_url_joins_segments() {
        assert_eq!(
            artifact_url(
                "https://repo.example.com/ebpf/",
                "ratelimit",
                "1.2.0",
                "jammy",
                "ratelimit.tar.gz"
            ),
            "https://repo.example.com/ebpf/ratelimit/1.2.0/jammy/ratelimit.tar.gz"
        );
    }

    #[test]
    fn test_install_dir_strips_archive_suffix() {
        let dir = install_dir(Path::new("/cache"), "ratelimit", "1.0.0", "ratelimit.tar.gz");
        assert_eq!(dir, PathBuf::from("/cache/ratelimit/1.0.0/ratelimit"));

        let dir = install_dir(Path::new("/cache"), "fw", "2.0.0", "fw.zip");
        assert_eq!(dir, PathBuf::from("/cache/fw/2.0.0/fw"));
    }

    #[test]
    fn test_install_dir_keeps_dotted_base_name() {
        let dir = install_dir(
            Path::new("/cache"),
            "ratelimit",
            "2.0.0",
            "acme.ratelimit-2.tar.gz",
        );
        assert_eq!(dir, PathBuf::from("/cache/ratelimit/2.0.0/acme.ratelimit-2"));

        // unrecognized suffixes are left alone; unpack() rejects them later
        let dir = install_dir(Path::new("/cache"), "odd", "1.0.0", "odd.tar.xz");
        assert_eq!(dir, PathBuf::from("/cache/odd/1.0.0/odd.tar.xz"));
    }

    #[test]
    fn test_validate_entry_path_accepts_nested() {
        let root = Path::new("/cache/ratelimit/1.0.0");
        let dest = validate_entry_path("ratelimit/objs/rl.bpf.o", root).unwrap();
        assert!(dest.starts_with(root));
    }

    #[test]
    fn test_validate_entry_path_rejects_traversal() {
        let root = Path::new("/cache/ratelimit/1.0.0");
        assert!(matches!(
            validate_entry_path("../etc/passwd", root),
            Err(Error::IllegalPath(_))
        ));
        assert!(matches!(
            validate_entry_path("a/../../b", root),
            Err(Error::IllegalPath(_))
        ));
        assert!(matches!(
            validate_entry_path("/etc/passwd", root),
            Err(Error::IllegalPath(_))
        ));
    }

    #[test]
    fn test_validate_entry_path_allows_dotfiles() {
        // ".." as a path component is illegal, a leading dot is not.
        let root = Path::new("/cache/p/1");
        assert!(validate_entry_path(".config", root).is_ok());
        assert!(validate_entry_path("a/..b/c", root).is_ok());
    }

    #[test]
    fn test_unknown_archive_format() {
        let tmp = tempfile::tempdir().unwrap();
        let err = unpack("prog.rar", b"bytes", tmp.path()).unwrap_err();
        assert!(matches!(err, Error::UnknownArchiveFormat(_)));
    }

    #[test]
    fn test_platform_from_os_release_codename() {
        let data = "ID=ubuntu\nVERSION_ID=\"22.04\"\nVERSION_CODENAME=jammy\n";
        assert_eq!(platform_from_os_release(data).unwrap(), "jammy");
    }

    #[test]
    fn test_platform_from_os_release_id_fallback() {
        let data = "ID=\"rhel\"\nVERSION_ID=\"9.3\"\n";
        assert_eq!(platform_from_os_release(data).unwrap(), "rhel9");
    }

    #[test]
    fn test_platform_from_os_release_missing() {
        assert_eq!(platform_from_os_release("PRETTY_NAME=x\n"), None);
    }
}
