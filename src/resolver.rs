//! Metadata resolution: final URL, file name and size of a remote entity.

use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::utils::{
    filename_from_content_disposition, get_filename_from_url, sanitize_filename,
    synthesize_filename,
};

/// What a preflight request tells us about a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub final_url: String,
    pub file_name: String,
    /// `None` when the server omitted a usable `Content-Length`.
    pub size: Option<u64>,
}

/// Issue a `HEAD` request (redirects followed by the client) and derive the
/// transfer metadata from the terminal response.
pub async fn resolve(
    client: &Client,
    url: &str,
    headers: &BTreeMap<String, String>,
) -> Result<Metadata> {
    let mut request = client.head(url);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::MetadataResolution {
            url: url.to_string(),
            reason: format!("server answered {status}"),
        });
    }

    let final_url = response.url().to_string();
    let metadata = metadata_from_headers(final_url, response.headers());
    debug!(
        url,
        final_url = %metadata.final_url,
        file_name = %metadata.file_name,
        size = ?metadata.size,
        "Resolved metadata"
    );
    Ok(metadata)
}

pub(crate) fn metadata_from_headers(final_url: String, headers: &HeaderMap) -> Metadata {
    let header_str = |name| headers.get(name).and_then(|v| v.to_str().ok());

    let file_name = header_str(CONTENT_DISPOSITION)
        .and_then(filename_from_content_disposition)
        .unwrap_or_else(|| match get_filename_from_url(&final_url) {
            Some(name) if name.contains('.') => name,
            _ => synthesize_filename(header_str(CONTENT_TYPE)),
        });

    let size = header_str(CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());

    Metadata {
        final_url,
        file_name: sanitize_filename(&file_name),
        size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SegmentPlan;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn content_disposition_wins_over_url() {
        let meta = metadata_from_headers(
            "https://example.com/download?id=1".to_string(),
            &headers(&[
                ("content-disposition", "attachment; filename=\"paper.pdf\""),
                ("content-length", "2048"),
            ]),
        );
        assert_eq!(meta.file_name, "paper.pdf");
        assert_eq!(meta.size, Some(2048));
    }

    #[test]
    fn url_segment_used_when_it_has_an_extension() {
        let meta = metadata_from_headers(
            "https://example.com/files/setup.exe?token=abc".to_string(),
            &HeaderMap::new(),
        );
        assert_eq!(meta.file_name, "setup.exe");
        assert_eq!(meta.size, None);
    }

    #[test]
    fn extensionless_url_synthesizes_name_from_content_type() {
        let meta = metadata_from_headers(
            "https://example.com/avatar".to_string(),
            &headers(&[("content-type", "image/png")]),
        );
        let digits = meta
            .file_name
            .strip_prefix("downloaded_file_")
            .and_then(|rest| rest.strip_suffix(".png"))
            .expect("synthesized name");
        assert!(!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn zero_length_is_kept_and_unparsable_is_unknown() {
        let meta = metadata_from_headers(
            "https://example.com/a.bin".to_string(),
            &headers(&[("content-length", "0")]),
        );
        assert_eq!(meta.size, Some(0));
        assert!(!SegmentPlan::new(meta.size, 4).is_ranged());

        let meta = metadata_from_headers(
            "https://example.com/a.bin".to_string(),
            &headers(&[("content-length", "lots")]),
        );
        assert_eq!(meta.size, None);
    }

    #[tokio::test]
    async fn resolve_follows_redirects_and_sends_headers() {
        let server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(307)
                    .append_header("Location", format!("{}/files/movie.mp4", server.uri())),
            )
            .mount(&server)
            .await;

        Mock::given(method("HEAD"))
            .and(path("/files/movie.mp4"))
            .and(header("X-Token", "secret"))
            .respond_with(ResponseTemplate::new(200).append_header("Content-Length", "4096"))
            .mount(&server)
            .await;

        let mut request_headers = BTreeMap::new();
        request_headers.insert("X-Token".to_string(), "secret".to_string());

        let meta = resolve(
            &Client::new(),
            &format!("{}/start", server.uri()),
            &request_headers,
        )
        .await
        .unwrap();

        assert_eq!(meta.final_url, format!("{}/files/movie.mp4", server.uri()));
        assert_eq!(meta.file_name, "movie.mp4");
        assert_eq!(meta.size, Some(4096));
    }

    #[tokio::test]
    async fn non_success_response_is_resolution_failure() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = resolve(&Client::new(), &format!("{}/missing.zip", server.uri()), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::MetadataResolution { .. }));
    }
}
