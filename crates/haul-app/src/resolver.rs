//! Inspects direct URLs for their final location, filename and size.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use haul_core::{ResolveError, Resolved, TaskSource, UrlResolver};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, HeaderMap};
use reqwest::{Client, Method, StatusCode, Url, redirect};
use tracing::debug;

const MAX_REDIRECTS: usize = 10;
const FALLBACK_NAME: &str = "download";

/// Resolver that asks the origin server with `HEAD`, falling back to `GET`.
pub struct DirectResolver {
    client: Client,
}

impl DirectResolver {
    /// Resolver whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .user_agent(concat!("haul/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn request(
        &self,
        method: Method,
        url: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<reqwest::Response, ResolveError> {
        let mut request = self.client.request(method, url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request.send().await.map_err(|source| ResolveError::Request {
            url: url.to_string(),
            source: Box::new(source),
        })
    }
}

#[async_trait]
impl UrlResolver for DirectResolver {
    async fn resolve(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Resolved, ResolveError> {
        let source = TaskSource::classify(url).map_err(|_| ResolveError::Unsupported {
            url: url.to_string(),
        })?;
        if !matches!(source, TaskSource::Url { .. }) {
            return Ok(Resolved {
                url: source.to_url(),
                filename: source
                    .magnet_display_name()
                    .or_else(|| source.magnet_info_hash())
                    .unwrap_or_else(|| "torrent".to_string()),
                size: None,
                headers: headers.clone(),
            });
        }

        let parsed = Url::parse(url.trim()).map_err(|_| ResolveError::Unsupported {
            url: url.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            "ftp" | "sftp" => {
                return Ok(Resolved {
                    filename: path_filename(&parsed).unwrap_or_else(|| FALLBACK_NAME.into()),
                    url: parsed.into(),
                    size: None,
                    headers: headers.clone(),
                });
            }
            _ => {
                return Err(ResolveError::Unsupported {
                    url: url.to_string(),
                });
            }
        }

        let mut response = self.request(Method::HEAD, &parsed, headers).await?;
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            debug!(url = %parsed, "HEAD refused; probing with GET");
            response = self.request(Method::GET, &parsed, headers).await?;
        }
        if !response.status().is_success() {
            return Err(ResolveError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let final_url = response.url().clone();
        let filename = disposition_filename(response.headers())
            .or_else(|| path_filename(&final_url))
            .unwrap_or_else(|| FALLBACK_NAME.into());
        let size = declared_size(response.headers());
        debug!(url = %final_url, filename = %filename, size = ?size, "resolved url");
        Ok(Resolved {
            url: final_url.into(),
            filename,
            size,
            headers: headers.clone(),
        })
    }
}

fn declared_size(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|size| *size > 0)
}

fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;
    parse_disposition(value)
}

fn parse_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let raw = raw.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'value
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                if let Some(name) = percent_decode(encoded.trim_matches('"')).and_then(sanitise) {
                    return Some(name);
                }
            }
            "filename" => plain = sanitise(raw.trim_matches('"').to_string()),
            _ => {}
        }
    }
    plain
}

fn path_filename(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|segment| !segment.is_empty())?;
    percent_decode(segment).and_then(sanitise)
}

fn sanitise(name: String) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    (!name.is_empty() && name != "." && name != "..").then(|| name.to_string())
}

fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && let Some(byte) = raw
                .get(index + 1..index + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            decoded.push(byte);
            index += 3;
            continue;
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_disposition_wins() {
        let header = r#"attachment; filename="fallback.bin"; filename*=UTF-8''na%C3%AFve%20file.txt"#;
        assert_eq!(parse_disposition(header).as_deref(), Some("naïve file.txt"));
    }

    #[test]
    fn quoted_disposition_is_stripped_to_a_basename() {
        assert_eq!(
            parse_disposition(r#"attachment; filename="../../etc/report.pdf""#).as_deref(),
            Some("report.pdf")
        );
        assert_eq!(parse_disposition("inline"), None);
    }

    #[test]
    fn path_segments_are_decoded() -> anyhow::Result<()> {
        let url = Url::parse("https://example.com/files/big%20file.iso?token=1")?;
        assert_eq!(path_filename(&url).as_deref(), Some("big file.iso"));
        let bare = Url::parse("https://example.com/")?;
        assert_eq!(path_filename(&bare), None);
        Ok(())
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(percent_decode("100%").as_deref(), Some("100%"));
        assert_eq!(percent_decode("%zz").as_deref(), Some("%zz"));
    }
}
