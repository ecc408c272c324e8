//! End-to-end artifact fetching against a file:// repository laid out the
//! way the daemon expects: `<repo>/<name>/<version>/<platform>/<artifact>`.

use std::io::Write;
use std::path::{Path, PathBuf};

use bpfchaind::artifact::{platform_tag, Fetcher};
use bpfchaind::config::Config;
use bpfchaind::errors::Error;
use bpfchaind::model::ProgramSpec;

fn test_spec(name: &str, version: &str, artifact: &str) -> ProgramSpec {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "version": version,
        "artifact": artifact,
        "hook": "xdp_ingress",
        "seq_id": 1,
    }))
    .unwrap()
}

fn test_config(repo: &Path, cache: &Path) -> Config {
    let yaml = format!(
        "bpf_dir: {}\nartifact_repo_url: file://{}\n",
        cache.display(),
        repo.display()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

/// Place an artifact at the repo path the fetcher will resolve.
fn repo_slot(repo: &Path, name: &str, version: &str, artifact: &str) -> PathBuf {
    let dir = repo.join(name).join(version).join(platform_tag());
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(artifact)
}

fn write_tar_gz(dest: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(dest).unwrap();
    let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);

    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        {
            let name = &mut header.as_gnu_mut().unwrap().name;
            name.fill(0);
            let bytes = path.as_bytes();
            name[..bytes.len()].copy_from_slice(bytes);
        }
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap();
}

fn write_zip(dest: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(dest).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options: zip::write::SimpleFileOptions = zip::write::SimpleFileOptions::default()
        .unix_permissions(0o755)
        .compression_method(zip::CompressionMethod::Deflated);

    for (path, data) in entries {
        writer.start_file(path.to_string(), options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

#[tokio::test]
async fn tar_gz_fetch_unpacks_into_versioned_cache() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let artifact = repo_slot(repo.path(), "ratelimit", "1.0.0", "ratelimit.tar.gz");
    write_tar_gz(
        &artifact,
        &[
            ("ratelimit/ratelimit.bpf.o", b"\x7fELF-fake".as_slice()),
            ("ratelimit/ratelimit_user", b"#!/bin/sh\n".as_slice()),
        ],
    );

    let cfg = test_config(repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();
    let spec = test_spec("ratelimit", "1.0.0", "ratelimit.tar.gz");

    let install = fetcher.verify_and_get(&spec).await.unwrap();
    assert_eq!(
        install,
        cache.path().join("ratelimit/1.0.0/ratelimit"),
        "install dir is the artifact name with its suffix stripped"
    );
    assert!(install.join("ratelimit.bpf.o").is_file());
    assert!(install.join("ratelimit_user").is_file());
}

#[tokio::test]
async fn zip_fetch_unpacks_and_preserves_exec_mode() {
    use std::os::unix::fs::PermissionsExt;

    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let artifact = repo_slot(repo.path(), "firewall", "2.1.0", "firewall.zip");
    write_zip(
        &artifact,
        &[("firewall/fw_user", b"#!/bin/sh\nexit 0\n".as_slice())],
    );

    let cfg = test_config(repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();
    let spec = test_spec("firewall", "2.1.0", "firewall.zip");

    let install = fetcher.verify_and_get(&spec).await.unwrap();
    let binary = install.join("fw_user");
    assert!(binary.is_file());

    let mode = std::fs::metadata(&binary).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111, "exec bits survive extraction");
}

#[tokio::test]
async fn fetch_is_idempotent_per_name_and_version() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let artifact = repo_slot(repo.path(), "ratelimit", "1.0.0", "ratelimit.tar.gz");
    write_tar_gz(&artifact, &[("ratelimit/obj.bpf.o", b"x".as_slice())]);

    let cfg = test_config(repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();
    let spec = test_spec("ratelimit", "1.0.0", "ratelimit.tar.gz");

    let first = fetcher.verify_and_get(&spec).await.unwrap();

    // Remove the repo copy: a second call must not touch the network or the
    // repo, only the cache.
    std::fs::remove_file(&artifact).unwrap();
    let second = fetcher.verify_and_get(&spec).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn traversal_entry_is_rejected_and_writes_nothing_outside() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let artifact = repo_slot(repo.path(), "evil", "1.0.0", "evil.tar.gz");
    write_tar_gz(
        &artifact,
        &[
            ("evil/ok-file", b"fine".as_slice()),
            ("../etc/passwd", b"root::0:0::/root:/bin/sh".as_slice()),
        ],
    );

    let cfg = test_config(repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();
    let spec = test_spec("evil", "1.0.0", "evil.tar.gz");

    let err = fetcher.verify_and_get(&spec).await.unwrap_err();
    assert!(matches!(err, Error::IllegalPath(_)), "got {err:?}");

    // nothing may escape the extraction root
    assert!(!cache.path().join("etc").exists());
    assert!(!cache.path().parent().unwrap().join("etc/passwd").exists());
}

#[tokio::test]
async fn missing_artifact_is_not_found() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let cfg = test_config(repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();
    let spec = test_spec("ghost", "0.0.1", "ghost.tar.gz");

    let err = fetcher.verify_and_get(&spec).await.unwrap_err();
    assert!(matches!(err, Error::ArtifactNotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn unknown_archive_suffix_is_rejected() {
    let repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let artifact = repo_slot(repo.path(), "odd", "1.0.0", "odd.tar.xz");
    std::fs::write(&artifact, b"not really an archive").unwrap();

    let cfg = test_config(repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();
    let spec = test_spec("odd", "1.0.0", "odd.tar.xz");

    let err = fetcher.verify_and_get(&spec).await.unwrap_err();
    assert!(matches!(err, Error::UnknownArchiveFormat(_)), "got {err:?}");
}

#[tokio::test]
async fn per_program_repo_override_wins() {
    let default_repo = tempfile::tempdir().unwrap();
    let override_repo = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    // artifact exists only in the override repo
    let artifact = repo_slot(override_repo.path(), "ratelimit", "1.0.0", "ratelimit.tar.gz");
    write_tar_gz(&artifact, &[("ratelimit/obj.bpf.o", b"x".as_slice())]);

    let cfg = test_config(default_repo.path(), cache.path());
    let fetcher = Fetcher::new(&cfg).unwrap();

    let mut spec = test_spec("ratelimit", "1.0.0", "ratelimit.tar.gz");
    spec.artifact_repo_url = Some(format!("file://{}", override_repo.path().display()));

    let install = fetcher.verify_and_get(&spec).await.unwrap();
    assert!(install.join("obj.bpf.o").is_file());
}
