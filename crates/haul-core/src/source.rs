//! Source classification for submitted URLs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const MAGNET_PREFIX: &str = "magnet:";
const METAINFO_PREFIX: &str = "data:application/x-bittorrent;base64,";

/// Coarse kind used for backend preference routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Magnet links and torrent metainfo.
    Torrent,
    /// Anything fetched directly over HTTP(S)/FTP.
    Http,
}

/// Payload descriptor accepted by engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSource {
    /// Magnet URI.
    Magnet {
        /// Full magnet URI.
        uri: String,
    },
    /// Serialized `.torrent` metainfo.
    Metainfo {
        /// Raw bencoded bytes.
        bytes: Vec<u8>,
    },
    /// Direct URL.
    Url {
        /// Fetch URL.
        url: String,
    },
}

impl TaskSource {
    /// Classify a submitted URL string.
    ///
    /// Magnet URIs and base64 `data:` torrent blobs become torrent sources; every
    /// other string is treated as a direct URL.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidSource` for an empty string or an undecodable
    /// torrent blob.
    pub fn classify(raw: &str) -> Result<Self, EngineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidSource {
                reason: "empty url".into(),
            });
        }
        if starts_with_ignore_case(trimmed, MAGNET_PREFIX) {
            return Ok(Self::Magnet {
                uri: trimmed.to_string(),
            });
        }
        if starts_with_ignore_case(trimmed, METAINFO_PREFIX) {
            let bytes = STANDARD
                .decode(&trimmed[METAINFO_PREFIX.len()..])
                .map_err(|err| EngineError::InvalidSource {
                    reason: format!("torrent blob is not valid base64: {err}"),
                })?;
            return Ok(Self::Metainfo { bytes });
        }
        Ok(Self::Url {
            url: trimmed.to_string(),
        })
    }

    /// Routing kind for this source.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        match self {
            Self::Magnet { .. } | Self::Metainfo { .. } => SourceKind::Torrent,
            Self::Url { .. } => SourceKind::Http,
        }
    }

    /// Render the source back into the URL form it was classified from.
    #[must_use]
    pub fn to_url(&self) -> String {
        match self {
            Self::Magnet { uri } => uri.clone(),
            Self::Metainfo { bytes } => format!("{METAINFO_PREFIX}{}", STANDARD.encode(bytes)),
            Self::Url { url } => url.clone(),
        }
    }

    /// Lowercase hex info-hash of a magnet URI, if it carries a `btih` topic.
    #[must_use]
    pub fn magnet_info_hash(&self) -> Option<String> {
        match self {
            Self::Magnet { uri } => magnet_param(uri, "xt")
                .into_iter()
                .find_map(|topic| topic.strip_prefix("urn:btih:").and_then(normalise_btih)),
            _ => None,
        }
    }

    /// Display name (`dn`) carried by a magnet URI.
    #[must_use]
    pub fn magnet_display_name(&self) -> Option<String> {
        match self {
            Self::Magnet { uri } => magnet_param(uri, "dn").into_iter().next(),
            _ => None,
        }
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn magnet_param(uri: &str, key: &str) -> Vec<String> {
    let Some((_, query)) = uri.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| percent_decode(value))
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'+' => out.push(b' '),
            b'%' if idx + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[idx + 1..idx + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    idx += 3;
                    continue;
                }
                out.push(b'%');
            }
            other => out.push(other),
        }
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn normalise_btih(value: &str) -> Option<String> {
    match value.len() {
        40 if value.chars().all(|c| c.is_ascii_hexdigit()) => Some(value.to_ascii_lowercase()),
        32 => decode_base32(value).map(|bytes| {
            bytes.iter().fold(String::with_capacity(40), |mut acc, byte| {
                acc.push_str(&format!("{byte:02x}"));
                acc
            })
        }),
        _ => None,
    }
}

fn decode_base32(value: &str) -> Option<Vec<u8>> {
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(20);
    for ch in value.chars() {
        let digit = match ch.to_ascii_uppercase() {
            c @ 'A'..='Z' => u64::from(c as u8 - b'A'),
            c @ '2'..='7' => u64::from(c as u8 - b'2' + 26),
            _ => return None,
        };
        buffer = (buffer << 5) | digit;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    (out.len() == 20).then_some(out)
}
