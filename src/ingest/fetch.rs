//! One-shot sources: local files and HTTP snapshot URLs.

use std::path::PathBuf;
use std::time::Duration;

use super::AcquireError;

/// Path part of a `file://` URL
pub fn file_url_path(url: &str) -> PathBuf {
    let trimmed = url.trim();
    let rest = trimmed
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("file://"))
        .map(|_| &trimmed[7..])
        .unwrap_or(trimmed);
    PathBuf::from(rest)
}

pub async fn read_file(path: &PathBuf) -> Result<Vec<u8>, AcquireError> {
    tokio::fs::read(path).await.map_err(|source| AcquireError::Io {
        path: path.clone(),
        source,
    })
}

/// Client shared by every poll of one HTTP channel.
///
/// Camera snapshot endpoints routinely serve self-signed certificates.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, AcquireError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(AcquireError::Http)
}

pub async fn get_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, AcquireError> {
    let response = client.get(url).send().await.map_err(AcquireError::Http)?;

    let status = response.status();
    if !status.is_success() {
        return Err(AcquireError::Status(status.as_u16()));
    }

    let bytes = response.bytes().await.map_err(AcquireError::Http)?;
    Ok(bytes.to_vec())
}
