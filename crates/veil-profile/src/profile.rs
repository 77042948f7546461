//! Server Profile
//!
//! Canonical description of one proxy server: endpoint, credentials and the
//! transport/security parameters the proxy engine needs to dial it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Sentinel stored in [`ServerProfile::last_ping_ms`] when latency is unknown
const UNKNOWN_PING: i64 = -1;

/// Serialized names of the modelled fields
const FIELD_KEYS: &[&str] = &[
    "id", "protocol", "address", "port", "userId", "network", "security", "sni", "alpn",
    "fingerprint", "publicKey", "shortId", "spiderX", "serviceName", "host", "path",
    "headerType", "flow", "encryption", "allowInsecure", "name", "sourceLink", "group", "source",
];

/// Prefix for extension keys that would shadow a modelled field
const SHADOWED_KEY_PREFIX: &str = "x-";

/// Proxy protocol spoken by the remote server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
}

impl Protocol {
    /// Protocol tag as used in share links and engine configs
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            other => Err(ValidationError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Profile validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Server address is empty")]
    MissingAddress,

    #[error("User id is empty")]
    MissingUserId,

    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
}

/// A reachable server endpoint
///
/// Profiles are treated as values: the store replaces them wholesale on
/// re-import, and only the liveness annotations (`ping_in_progress`,
/// `last_ping_ms`) are mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Stable identifier, preserved across re-imports
    #[serde(default)]
    pub id: String,
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    /// VMess/VLESS user id
    #[serde(rename = "userId")]
    pub user_id: String,

    /// Transport (tcp, ws, grpc, ...)
    #[serde(default = "default_network")]
    pub network: String,
    /// Security layer (none, tls, reality)
    #[serde(default = "default_security")]
    pub security: String,

    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub fingerprint: String,
    /// Reality public key
    #[serde(default, rename = "publicKey")]
    pub public_key: String,
    /// Reality short id
    #[serde(default, rename = "shortId")]
    pub short_id: String,
    /// Reality spider path
    #[serde(default, rename = "spiderX")]
    pub spider_x: String,
    /// gRPC service name
    #[serde(default, rename = "serviceName")]
    pub service_name: String,
    /// HTTP Host header (ws / http obfuscation)
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    /// TCP header obfuscation type
    #[serde(default, rename = "headerType")]
    pub header_type: String,
    /// VLESS flow control (e.g. xtls-rprx-vision)
    #[serde(default)]
    pub flow: String,
    /// VLESS encryption or VMess cipher
    #[serde(default)]
    pub encryption: String,
    #[serde(default, rename = "allowInsecure")]
    pub allow_insecure: bool,

    #[serde(default)]
    pub name: String,
    /// Share link the profile was imported from, kept verbatim
    #[serde(default, rename = "sourceLink")]
    pub source_link: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub source: String,

    /// Fields not modelled explicitly, kept for round-trip fidelity
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    pub ping_in_progress: bool,
    #[serde(skip, default = "unknown_ping")]
    pub last_ping_ms: i64,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_security() -> String {
    "none".to_string()
}

fn unknown_ping() -> i64 {
    UNKNOWN_PING
}

impl ServerProfile {
    /// Create a profile with a freshly generated identifier
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16, user_id: impl Into<String>) -> Self {
        Self {
            id: new_identifier(),
            protocol,
            address: address.into(),
            port,
            user_id: user_id.into(),
            network: default_network(),
            security: default_security(),
            sni: String::new(),
            alpn: Vec::new(),
            fingerprint: String::new(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: String::new(),
            service_name: String::new(),
            host: String::new(),
            path: String::new(),
            header_type: String::new(),
            flow: String::new(),
            encryption: String::new(),
            allow_insecure: false,
            name: String::new(),
            source_link: String::new(),
            group: String::new(),
            source: String::new(),
            extra: Map::new(),
            ping_in_progress: false,
            last_ping_ms: UNKNOWN_PING,
        }
    }

    /// Keep an unmodelled key; names of modelled fields get an `x-` prefix
    pub fn insert_extra(&mut self, key: impl Into<String>, value: Value) {
        let mut key = key.into();
        if FIELD_KEYS.contains(&key.as_str()) {
            key.insert_str(0, SHADOWED_KEY_PREFIX);
        }
        self.extra.insert(key, value);
    }

    /// Check the validity invariant
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.address.trim().is_empty() {
            return Err(ValidationError::MissingAddress);
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingUserId);
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }

    /// Is this a usable profile?
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Same protocol, address, port and user id (case-insensitive)
    pub fn same_endpoint(&self, other: &ServerProfile) -> bool {
        self.protocol == other.protocol
            && self.address.eq_ignore_ascii_case(&other.address)
            && self.port == other.port
            && self.user_id.eq_ignore_ascii_case(&other.user_id)
    }

    /// Identity test used by the store to merge re-imports
    pub fn matches_identity(&self, other: &ServerProfile) -> bool {
        if self.same_endpoint(other) {
            return true;
        }
        if !self.source_link.is_empty() && self.source_link == other.source_link {
            return true;
        }
        !self.id.is_empty() && self.id == other.id
    }

    /// Name for display, falling back to `address:port`
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            self.name.clone()
        }
    }

    /// Is a latency measurement available?
    pub fn has_ping(&self) -> bool {
        self.last_ping_ms >= 0
    }

    /// Ensure the profile carries an identifier
    pub fn ensure_identifier(&mut self) {
        if self.id.trim().is_empty() {
            self.id = new_identifier();
        }
    }

    /// The share link for this profile
    ///
    /// Returns the original link when one was imported, otherwise a link
    /// regenerated from the modelled fields.
    pub fn share_link(&self) -> String {
        if !self.source_link.is_empty() {
            return self.source_link.clone();
        }
        match self.protocol {
            Protocol::Vless => self.vless_link(),
            Protocol::Vmess => self.vmess_link(),
        }
    }

    fn vless_link(&self) -> String {
        let mut params: Vec<(&str, String)> = vec![
            ("type", self.network.clone()),
            ("security", self.security.clone()),
        ];
        let optional = [
            ("encryption", &self.encryption),
            ("flow", &self.flow),
            ("path", &self.path),
            ("host", &self.host),
            ("serviceName", &self.service_name),
            ("headerType", &self.header_type),
            ("sni", &self.sni),
            ("fp", &self.fingerprint),
            ("pbk", &self.public_key),
            ("sid", &self.short_id),
            ("spx", &self.spider_x),
        ];
        for (key, value) in optional {
            if !value.is_empty() {
                params.push((key, value.clone()));
            }
        }
        if !self.alpn.is_empty() {
            params.push(("alpn", self.alpn.join(",")));
        }
        if self.allow_insecure {
            params.push(("allowInsecure", "1".to_string()));
        }

        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();

        let host = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };

        let mut link = format!(
            "vless://{}@{}:{}?{}",
            urlencoding::encode(&self.user_id),
            host,
            self.port,
            query.join("&")
        );
        if !self.name.is_empty() {
            link.push('#');
            link.push_str(&urlencoding::encode(&self.name));
        }
        link
    }

    fn vmess_link(&self) -> String {
        let mut obj = Map::new();
        obj.insert("v".into(), Value::from("2"));
        obj.insert("ps".into(), Value::from(self.name.clone()));
        obj.insert("add".into(), Value::from(self.address.clone()));
        obj.insert("port".into(), Value::from(self.port.to_string()));
        obj.insert("id".into(), Value::from(self.user_id.clone()));
        obj.insert("aid".into(), Value::from("0"));
        obj.insert("scy".into(), Value::from(self.encryption.clone()));
        obj.insert("net".into(), Value::from(self.network.clone()));
        obj.insert("type".into(), Value::from(self.header_type.clone()));
        obj.insert("host".into(), Value::from(self.host.clone()));
        obj.insert("path".into(), Value::from(self.path.clone()));
        let tls = if self.security == "none" { "" } else { self.security.as_str() };
        obj.insert("tls".into(), Value::from(tls));
        obj.insert("sni".into(), Value::from(self.sni.clone()));
        obj.insert("alpn".into(), Value::from(self.alpn.join(",")));
        obj.insert("fp".into(), Value::from(self.fingerprint.clone()));

        let json = Value::Object(obj).to_string();
        format!("vmess://{}", STANDARD.encode(json))
    }
}

/// Generate a fresh opaque profile identifier
pub(crate) fn new_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}
