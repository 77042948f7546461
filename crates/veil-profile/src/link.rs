//! Share-link Parser
//!
//! Decodes `vmess://` and `vless://` share links into [`ServerProfile`]s.
//!
//! # Formats
//!
//! ```text
//! vmess://<base64 JSON object>[#name]
//! vless://<user id>@<host>:<port>?<query>[#name]
//! ```
//!
//! VMess payloads are accepted in either base64 alphabet, padded or not.

use crate::profile::{Protocol, ServerProfile, ValidationError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

const VMESS_SCHEME: &str = "vmess://";
const VLESS_SCHEME: &str = "vless://";

/// Default port for VLESS links that omit one
const DEFAULT_VLESS_PORT: u16 = 443;

/// VMess JSON keys mapped onto profile fields; everything else lands in `extra`
const VMESS_KNOWN_KEYS: &[&str] = &[
    "v", "ps", "add", "port", "id", "aid", "scy", "net", "type", "host", "path", "tls", "sni",
    "alpn", "fp", "pbk", "sid", "spx", "flow", "allowInsecure", "insecure",
];

/// Share-link parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unsupported link format (expected vmess:// or vless://)")]
    UnsupportedFormat,

    #[error("VMess payload is not valid base64")]
    Base64DecodeFailed,

    #[error("VMess payload is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Missing required fields: {0}")]
    MissingRequiredFields(#[from] ValidationError),
}

/// Parse a share link into a new profile
///
/// The input is trimmed and dispatched on its scheme (case-insensitive).
/// The returned profile carries a freshly generated identifier and the
/// trimmed link text in `source_link`.
pub fn parse(text: &str) -> Result<ServerProfile, ParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::UnsupportedFormat);
    }

    let mut profile = if has_scheme(text, VMESS_SCHEME) {
        parse_vmess(&text[VMESS_SCHEME.len()..])?
    } else if has_scheme(text, VLESS_SCHEME) {
        parse_vless(text)?
    } else {
        return Err(ParseError::UnsupportedFormat);
    };

    normalize_ws_path(&mut profile);
    profile.validate()?;
    profile.source_link = text.to_string();

    debug!("Parsed {} profile {}", profile.protocol, profile.display_name());
    Ok(profile)
}

fn has_scheme(text: &str, scheme: &str) -> bool {
    text.get(..scheme.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
}

fn parse_vmess(body: &str) -> Result<ServerProfile, ParseError> {
    let (payload, name) = match body.split_once('#') {
        Some((payload, fragment)) => (payload, percent_decode(fragment)),
        None => (body, String::new()),
    };

    let decoded = decode_flexible_base64(payload).ok_or(ParseError::Base64DecodeFailed)?;
    let obj: Map<String, Value> = serde_json::from_slice(&decoded)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let port = json_field(&obj, "port").trim().parse::<u16>().unwrap_or(0);
    let mut profile = ServerProfile::new(
        Protocol::Vmess,
        json_field(&obj, "add").trim(),
        port,
        json_field(&obj, "id").trim(),
    );

    profile.name = if name.is_empty() { json_field(&obj, "ps") } else { name };
    profile.encryption = non_empty_or(json_field(&obj, "scy"), "auto");
    profile.network = non_empty_or(json_field(&obj, "net").to_ascii_lowercase(), "tcp");
    profile.header_type = json_field(&obj, "type");
    profile.host = json_field(&obj, "host");
    profile.path = json_field(&obj, "path");
    profile.sni = json_field(&obj, "sni");
    profile.alpn = split_list(&json_field(&obj, "alpn"));
    profile.fingerprint = json_field(&obj, "fp");
    profile.public_key = json_field(&obj, "pbk");
    profile.short_id = json_field(&obj, "sid");
    profile.spider_x = json_field(&obj, "spx");
    profile.flow = json_field(&obj, "flow");
    profile.allow_insecure =
        is_truthy(&json_field(&obj, "allowInsecure")) || is_truthy(&json_field(&obj, "insecure"));

    let tls = json_field(&obj, "tls").to_ascii_lowercase();
    profile.security = if tls.is_empty() { "none".to_string() } else { tls };

    for (key, value) in obj {
        if !VMESS_KNOWN_KEYS.contains(&key.as_str()) {
            profile.insert_extra(key, value);
        }
    }

    Ok(profile)
}

fn parse_vless(text: &str) -> Result<ServerProfile, ParseError> {
    let url = Url::parse(text).map_err(|e| ParseError::InvalidUrl(e.to_string()))?;

    let address = url
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or(DEFAULT_VLESS_PORT);
    let user_id = percent_decode(url.username());

    let mut profile = ServerProfile::new(Protocol::Vless, address, port, user_id);

    let mut sni = String::new();
    let mut server_name = String::new();
    for (key, value) in url.query_pairs() {
        let value = value.trim().to_string();
        match &*key {
            "type" => profile.network = non_empty_or(value.to_ascii_lowercase(), "tcp"),
            "security" => profile.security = non_empty_or(value.to_ascii_lowercase(), "none"),
            "encryption" => profile.encryption = value,
            "flow" => profile.flow = value,
            "path" => profile.path = value,
            "host" => profile.host = value,
            "serviceName" => profile.service_name = value,
            "sni" => sni = value,
            "serverName" => server_name = value,
            "alpn" => profile.alpn = split_list(&value),
            "fp" => profile.fingerprint = value,
            "pbk" => profile.public_key = value,
            "sid" => profile.short_id = value,
            "spx" => profile.spider_x = value,
            "headerType" => profile.header_type = value,
            "allowInsecure" | "insecure" => profile.allow_insecure |= is_truthy(&value),
            other => {
                profile.insert_extra(other, Value::from(value));
            }
        }
    }

    profile.sni = if sni.is_empty() { server_name } else { sni };
    profile.encryption = non_empty_or(std::mem::take(&mut profile.encryption), "none");
    profile.name = url.fragment().map(percent_decode).unwrap_or_default();

    Ok(profile)
}

/// Decode base64 accepting the URL-safe alphabet and missing padding
///
/// Falls back to a plain standard-alphabet decode of the original input when
/// the normalised form yields nothing.
fn decode_flexible_base64(payload: &str) -> Option<Vec<u8>> {
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();

    let mut normalized = cleaned.replace('-', "+").replace('_', "/");
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }

    if let Ok(bytes) = STANDARD.decode(&normalized) {
        if !bytes.is_empty() {
            return Some(bytes);
        }
    }

    STANDARD.decode(&cleaned).ok().filter(|bytes| !bytes.is_empty())
}

/// WebSocket paths must start with `/`
fn normalize_ws_path(profile: &mut ServerProfile) {
    if profile.network == "ws" && !profile.path.starts_with('/') {
        profile.path.insert(0, '/');
    }
}

/// Read a JSON field as text; numbers and booleans are stringified
fn json_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn is_truthy(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
