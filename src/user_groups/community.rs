/// Community urls and records.
///
/// A community url is `<base url>/<room>?public_key=<server key>` (or
/// `/r/<room>`). The base url is normalized (lower-case scheme and host,
/// default port and trailing slash dropped) and the room compared case
/// insensitively, so every spelling of the same room maps to one record.
/// The server key may be hex (64 chars) or base64 (43/44 chars, standard or
/// url-safe alphabet). Only http and https servers are accepted.
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::limits::{MAX_BASE_URL_LENGTH, MAX_ROOM_LENGTH};
use crate::store::Lww;
use crate::user_groups::{write_visible, BaseGroup, BaseRecord, Result, UserGroupsError};

const PUBKEY_PARAM: &str = "public_key=";

// ---------------------------------------------------------------------------
// CommunityUrl
// ---------------------------------------------------------------------------

/// Parsed community url.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommunityUrl {
    /// Normalized base url, e.g. `https://example.org:8080`.
    pub base_url: String,
    /// Room name as written.
    pub room: String,
    pub pubkey: Option<[u8; 32]>,
}

impl CommunityUrl {
    /// Parse a full community url, with or without the public key.
    pub fn parse(full_url: &str) -> Result<Self> {
        let invalid = |why: &str| UserGroupsError::InvalidCommunityUrl(why.to_string());

        let url = Url::parse(full_url.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(invalid("not a base url"));
        }
        let base_url = base_of(&url)?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let room = match segments.as_slice() {
            [room] => *room,
            ["r", room] => *room,
            _ => return Err(invalid("expected /<room> or /r/<room>")),
        };
        validate_room(room)?;

        let pubkey = match url.query() {
            Some(query) => query
                .split('&')
                .find_map(|pair| pair.strip_prefix(PUBKEY_PARAM))
                .map(decode_pubkey)
                .transpose()?,
            None => None,
        };

        Ok(CommunityUrl {
            base_url,
            room: room.to_string(),
            pubkey,
        })
    }

    /// Registry key: base url and lower-cased room.
    pub fn key(&self) -> String {
        record_key(&self.base_url, &self.room)
    }
}

/// `<base>/<room>?public_key=<hex>`.
pub fn build_full_url(base_url: &str, room: &str, pubkey: &[u8; 32]) -> String {
    format!(
        "{}/{}?{}{}",
        base_url.trim_end_matches('/'),
        room,
        PUBKEY_PARAM,
        hex::encode(pubkey)
    )
}

/// Normalize a bare base url.
pub fn normalize_base_url(base_url: &str) -> Result<String> {
    let url = Url::parse(base_url.trim())
        .map_err(|e| UserGroupsError::InvalidCommunityUrl(e.to_string()))?;
    base_of(&url)
}

fn base_of(url: &Url) -> Result<String> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UserGroupsError::InvalidCommunityUrl("scheme must be http or https".into()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| UserGroupsError::InvalidCommunityUrl("missing host".into()))?;
    // `port()` is None for the scheme's default port
    let base = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };
    if base.len() > MAX_BASE_URL_LENGTH {
        return Err(UserGroupsError::InvalidCommunityUrl("base url too long".into()));
    }
    Ok(base)
}

fn validate_room(room: &str) -> Result<()> {
    if room.is_empty() || room.len() > MAX_ROOM_LENGTH {
        return Err(UserGroupsError::InvalidCommunityUrl(format!(
            "room must be 1..={} bytes",
            MAX_ROOM_LENGTH
        )));
    }
    if !room
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(UserGroupsError::InvalidCommunityUrl(
            "room may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

fn decode_pubkey(encoded: &str) -> Result<[u8; 32]> {
    let bytes = match encoded.len() {
        64 => hex::decode(encoded).ok(),
        43 => STANDARD_NO_PAD
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
            .ok(),
        44 => STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .ok(),
        _ => None,
    };
    bytes
        .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
        .ok_or(UserGroupsError::InvalidPubkey)
}

pub(crate) fn record_key(base_url: &str, room: &str) -> String {
    format!("{}/{}", base_url, room.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Record and view
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct CommunityRecord {
    pub(crate) base: BaseRecord,
    base_url: String,
    /// Case-preserved room name; the latest spelling wins.
    room: Lww<String>,
    pubkey: Lww<[u8; 32]>,
}

impl CommunityRecord {
    pub(crate) fn new(base_url: &str) -> Self {
        CommunityRecord {
            base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    /// Apply a local write. Returns true when anything visible changed.
    pub(crate) fn write(&mut self, url: &CommunityUrl, pubkey: [u8; 32], priority: i64, ts: u64) -> bool {
        let was_live = self.base.is_live();
        let horizon = self.base.erased_at();
        let mut changed = write_visible(&mut self.room, url.room.clone(), ts, horizon);
        changed |= write_visible(&mut self.pubkey, pubkey, ts, horizon);
        changed |= self.base.set_priority(priority, ts);
        if changed || !was_live {
            self.base.touch(ts);
        }
        changed || !was_live
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.base.merge(&other.base);
        self.room.merge(&other.room);
        self.pubkey.merge(&other.pubkey);
    }

    pub(crate) fn view(&self) -> CommunityInfo {
        let horizon = self.base.erased_at();
        CommunityInfo {
            base_url: self.base_url.clone(),
            room: self.room.visible_after(horizon),
            pubkey: self.pubkey.visible_after(horizon),
            base: self.base.view(),
        }
    }
}

/// Merged view of one community.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommunityInfo {
    pub base_url: String,
    /// Room name, case preserved.
    pub room: String,
    pub pubkey: [u8; 32],
    pub base: BaseGroup,
}

impl CommunityInfo {
    pub fn full_url(&self) -> String {
        build_full_url(&self.base_url, &self.room, &self.pubkey)
    }

    pub fn key(&self) -> String {
        record_key(&self.base_url, &self.room)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEY: [u8; 32] = hex!("a03c383cf63c3c4efe67acc52112a6dd734b3a946b9545f488aaa93da7991238");
    const KEY_HEX: &str = "a03c383cf63c3c4efe67acc52112a6dd734b3a946b9545f488aaa93da7991238";

    #[test]
    fn test_parse_full_url() {
        let parsed =
            CommunityUrl::parse(&format!("https://Open.Example.org/SudokuRoom?public_key={KEY_HEX}"))
                .unwrap();
        assert_eq!(parsed.base_url, "https://open.example.org");
        assert_eq!(parsed.room, "SudokuRoom");
        assert_eq!(parsed.pubkey, Some(KEY));
    }

    #[test]
    fn test_parse_drops_default_port_keeps_custom() {
        let a = CommunityUrl::parse("http://example.org:80/room").unwrap();
        assert_eq!(a.base_url, "http://example.org");
        let b = CommunityUrl::parse("https://example.org:443/room").unwrap();
        assert_eq!(b.base_url, "https://example.org");
        let c = CommunityUrl::parse("http://example.org:8080/room").unwrap();
        assert_eq!(c.base_url, "http://example.org:8080");
    }

    #[test]
    fn test_parse_r_prefix_and_trailing_slash() {
        let a = CommunityUrl::parse("https://example.org/r/lounge/").unwrap();
        let b = CommunityUrl::parse("https://example.org/LOUNGE").unwrap();
        assert_eq!(a.room, "lounge");
        assert_eq!(a.key(), b.key());
        assert!(a.pubkey.is_none());
    }

    #[test]
    fn test_parse_base64_keys() {
        let padded = STANDARD.encode(KEY);
        let unpadded = STANDARD_NO_PAD.encode(KEY);
        let url_safe = URL_SAFE_NO_PAD.encode(KEY);
        for encoded in [padded, unpadded, url_safe] {
            let parsed =
                CommunityUrl::parse(&format!("https://example.org/room?public_key={encoded}"))
                    .unwrap();
            assert_eq!(parsed.pubkey, Some(KEY), "{encoded}");
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(CommunityUrl::parse("not a url").is_err());
        assert!(CommunityUrl::parse("https://example.org/").is_err());
        assert!(CommunityUrl::parse("https://example.org/a/b/c").is_err());
        assert!(CommunityUrl::parse("https://example.org/bad.room").is_err());
        assert_eq!(
            CommunityUrl::parse("https://example.org/room?public_key=abcd"),
            Err(UserGroupsError::InvalidPubkey)
        );
    }

    #[test]
    fn test_build_full_url_round_trips() {
        let full = build_full_url("https://example.org/", "Room", &KEY);
        assert_eq!(full, format!("https://example.org/Room?public_key={KEY_HEX}"));
        let parsed = CommunityUrl::parse(&full).unwrap();
        assert_eq!(parsed.base_url, "https://example.org");
        assert_eq!(parsed.pubkey, Some(KEY));
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("HTTPS://Example.ORG:443/").unwrap(),
            "https://example.org"
        );
    }
}
