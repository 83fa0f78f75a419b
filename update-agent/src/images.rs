// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fetching update images and verifying their integrity.

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256, Sha512};
use slog::{debug, info, Logger};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::errors::Error;

/// Resolves `url` to a local file, downloading into `dest_dir` if necessary.
///
/// `file:` URLs are used in place; no copy is made. Anything else is streamed
/// to a temporary file in `dest_dir` and renamed into place on completion, so
/// a partial download is never visible under its final name.
pub async fn fetch(
    log: &Logger,
    url: &str,
    dest_dir: &Utf8Path,
) -> Result<Utf8PathBuf, Error> {
    let parsed = Url::parse(url).map_err(|err| Error::Fetch {
        url: url.to_string(),
        source: anyhow!(err),
    })?;

    if parsed.scheme() == "file" {
        let path = parsed
            .to_file_path()
            .map_err(|()| anyhow!("not a local path"))
            .and_then(|p| {
                Utf8PathBuf::try_from(p).context("path is not valid UTF-8")
            })
            .map_err(|err| Error::Fetch {
                url: url.to_string(),
                source: err,
            })?;
        debug!(log, "using local image in place"; "path" => path.as_str());
        return Ok(path);
    }

    download(log, &parsed, dest_dir).await.map_err(|err| Error::Fetch {
        url: url.to_string(),
        source: err,
    })
}

async fn download(
    log: &Logger,
    url: &Url,
    dest_dir: &Utf8Path,
) -> Result<Utf8PathBuf, anyhow::Error> {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("image")
        .to_string();
    let destination = dest_dir.join(&name);

    tokio::fs::create_dir_all(dest_dir)
        .await
        .with_context(|| format!("creating download directory {dest_dir}"))?;

    // Download to a temporary file, then rename to the final name once the
    // body is fully on disk.
    let (file, temp_path) = NamedTempFile::new_in(dest_dir)
        .context("creating temporary download file")?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut response = reqwest::get(url.clone())
        .await
        .and_then(|response| response.error_for_status())
        .context("request failed")?;

    let mut written = 0u64;
    while let Some(chunk) =
        response.chunk().await.context("reading response body")?
    {
        file.write_all(&chunk).await.context("writing image to disk")?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("flushing image to disk")?;
    drop(file);

    temp_path
        .persist(&destination)
        .with_context(|| format!("renaming download to {destination}"))?;

    info!(
        log, "downloaded image";
        "url" => url.as_str(),
        "path" => destination.as_str(),
        "bytes" => written,
    );

    Ok(destination)
}

/// Verifies size and both digests of the image at `path`.
///
/// Both hashes are mandatory and are computed in a single streaming pass.
pub async fn verify(
    path: &Utf8Path,
    size: u64,
    sha256: &str,
    sha512: &str,
) -> Result<(), Error> {
    let path = path.to_owned();
    let expected_sha256 = sha256.to_ascii_lowercase();
    let expected_sha512 = sha512.to_ascii_lowercase();

    let (actual_size, actual_sha256, actual_sha512) =
        tokio::task::spawn_blocking(move || digest_file(&path))
            .await
            .expect("digest task panicked")?;

    if actual_size != size {
        return Err(Error::Integrity(format!(
            "size mismatch: expected {size}, got {actual_size}"
        )));
    }
    if actual_sha256 != expected_sha256 {
        return Err(Error::Integrity(format!(
            "sha256 mismatch: expected {expected_sha256}, got {actual_sha256}"
        )));
    }
    if actual_sha512 != expected_sha512 {
        return Err(Error::Integrity(format!(
            "sha512 mismatch: expected {expected_sha512}, got {actual_sha512}"
        )));
    }

    Ok(())
}

fn digest_file(path: &Utf8Path) -> Result<(u64, String, String), Error> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .map_err(|err| Error::io(format!("opening image {path}"), err))?;

    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|err| Error::io(format!("reading image {path}"), err))?;
        if n == 0 {
            break;
        }
        sha256.update(&buf[..n]);
        sha512.update(&buf[..n]);
        size += n as u64;
    }

    Ok((
        size,
        hex::encode(sha256.finalize()),
        hex::encode(sha512.finalize()),
    ))
}
