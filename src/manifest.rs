//! Checksum and run report for a produced image.
//!
//! Next to `<name>.img` the run writes:
//! - `<name>.img.sha256` - `"<hex>  <filename>"`, verifiable with `sha256sum -c`
//! - `<name>.img.json` - [`RunManifest`]

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::config::RunConfig;
use crate::error::{RemasterError, Result};
use crate::pipeline::PipelineStage;

const CHECKSUM_SEPARATOR: &str = "  ";

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub input_image: PathBuf,
    pub output_image: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub stages: Vec<String>,
    pub started_at_utc: String,
    pub finished_at_utc: String,
}

/// Format a timestamp for the manifest.
pub fn utc_rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Hash the output image and write the checksum and manifest beside it.
pub fn write_for(
    config: &RunConfig,
    stages: &[PipelineStage],
    started: OffsetDateTime,
) -> Result<RunManifest> {
    let output = &config.output_image;
    let manifest = (|| -> anyhow::Result<RunManifest> {
        let (sha256, size_bytes) = sha256_file(output)?;
        write_checksum(output, &sha256)?;

        let manifest = RunManifest {
            input_image: config.input_image.clone(),
            output_image: output.clone(),
            sha256,
            size_bytes,
            stages: stages.iter().map(|s| s.to_string()).collect(),
            started_at_utc: utc_rfc3339(started),
            finished_at_utc: utc_rfc3339(OffsetDateTime::now_utc()),
        };
        write_json_atomic(&sidecar(output, "json"), &manifest)?;
        Ok(manifest)
    })()
    .map_err(|source| RemasterError::Manifest {
        path: output.clone(),
        source,
    })?;

    info!(
        "SHA256: {}...{}",
        &manifest.sha256[..8],
        &manifest.sha256[manifest.sha256.len() - 8..]
    );
    Ok(manifest)
}

/// Stream a file through SHA-256. Returns the hex digest and byte count.
pub fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Write `<image>.sha256` using only the file name so the check works from
/// the output directory.
pub fn write_checksum(image: &Path, sha256: &str) -> anyhow::Result<PathBuf> {
    let filename = image
        .file_name()
        .context("Could not get image filename")?
        .to_string_lossy();
    let path = sidecar(image, "sha256");
    fs::write(&path, format!("{sha256}{CHECKSUM_SEPARATOR}{filename}\n"))
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote: {}", path.display());
    Ok(path)
}

fn sidecar(image: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = image.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    image.with_file_name(name)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    info!("Wrote: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_of_known_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.img");
        fs::write(&path, b"abc").unwrap();

        let (sha, size) = sha256_file(&path).unwrap();

        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn test_checksum_uses_bare_filename() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("x-custom.img");

        let path = write_checksum(&image, "deadbeef").unwrap();

        assert_eq!(path, temp.path().join("x-custom.img.sha256"));
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "deadbeef  x-custom.img\n"
        );
    }

    #[test]
    fn test_write_for_produces_manifest() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("x-custom.img");
        fs::write(&output, b"image bytes").unwrap();
        let config = RunConfig {
            input_image: temp.path().join("x.iso"),
            output_image: output.clone(),
            work_dir: temp.path().join("work"),
            work_dir_user_supplied: true,
        };

        let manifest = write_for(
            &config,
            &[PipelineStage::MountSource, PipelineStage::RepackImage],
            OffsetDateTime::now_utc(),
        )
        .unwrap();

        assert_eq!(manifest.size_bytes, 11);
        assert_eq!(manifest.stages, vec!["MountSource", "RepackImage"]);

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(temp.path().join("x-custom.img.json")).unwrap())
                .unwrap();
        assert_eq!(json["sha256"], manifest.sha256.as_str());
        assert!(temp.path().join("x-custom.img.sha256").is_file());
    }

    #[test]
    fn test_missing_output_is_manifest_error() {
        let temp = TempDir::new().unwrap();
        let config = RunConfig {
            input_image: temp.path().join("x.iso"),
            output_image: temp.path().join("missing.img"),
            work_dir: temp.path().join("work"),
            work_dir_user_supplied: true,
        };

        let err = write_for(&config, &[], OffsetDateTime::now_utc()).unwrap_err();

        assert!(matches!(err, RemasterError::Manifest { .. }));
    }
}
