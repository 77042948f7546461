//! Config Compiler
//!
//! Turns a [`ServerProfile`] plus [`RoutingOptions`] into the engine's JSON
//! configuration document. Compilation is a pure function: the same inputs
//! always produce byte-identical output, and list order is preserved because
//! the engine routes on first match.
//!
//! # Document layout
//!
//! ```text
//! log
//! inbounds   mixed-in (always) │ tun-in (TUN) │ api-in (stats)
//! outbounds  proxy │ fragment (reality) │ dns-out (TUN) │ direct │ block
//! routing    api → dns → noise → private → local → block → direct → proxy → catch-all
//! api/stats/policy (stats)
//! dns (TUN)
//! ```

use crate::platform::{detect_platform, PlatformProvider};
use crate::routing::{DefaultPolicy, RoutingOptions, RuleList};
use serde_json::{json, Map, Value};
use std::fmt;
use veil_profile::{Protocol, ServerProfile};

/// Inbound and outbound tags used in the generated document
pub mod tags {
    pub const MIXED_IN: &str = "mixed-in";
    pub const TUN_IN: &str = "tun-in";
    pub const API_IN: &str = "api-in";

    pub const PROXY: &str = "proxy";
    pub const FRAGMENT: &str = "fragment";
    pub const DNS_OUT: &str = "dns-out";
    pub const DIRECT: &str = "direct";
    pub const BLOCK: &str = "block";
    pub const API: &str = "api";
}

const LOOPBACK: &str = "127.0.0.1";
const MUX_CONCURRENCY: u32 = 8;

const TUN_ADDRESSES: [&str; 2] = ["172.19.0.1/30", "fdfe:dcba:9876::1/126"];
const TUN_DNS_SERVERS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// NetBIOS name/datagram, mDNS, LLMNR
const NOISE_PORTS: &str = "137,138,5353,5355";
const NOISE_ADDRESSES: [&str; 5] = [
    "255.255.255.255/32",
    "224.0.0.0/4",
    "ff00::/8",
    "169.254.0.0/16",
    "fe80::/10",
];

const PRIVATE_CIDRS: [&str; 8] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "fc00::/7",
    "fe80::/10",
    "::1/128",
];

const LOCAL_DOMAINS: [&str; 2] = ["full:localhost", "domain:local"];

/// Prefixes the engine understands in domain rules
const DOMAIN_PREFIXES: [&str; 6] = ["domain:", "full:", "regexp:", "keyword:", "geosite:", "ext:"];

const LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "none"];

/// A compiled engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument(Value);

impl ConfigDocument {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Pretty-printed JSON, as written to disk
    pub fn to_pretty_string(&self) -> String {
        format!("{:#}", self.0)
    }

    pub fn inbound_tags(&self) -> Vec<&str> {
        self.tags_of("inbounds")
    }

    pub fn outbound_tags(&self) -> Vec<&str> {
        self.tags_of("outbounds")
    }

    /// Routing rules in match order
    pub fn rules(&self) -> &[Value] {
        self.0["routing"]["rules"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn tags_of(&self, section: &str) -> Vec<&str> {
        self.0[section]
            .as_array()
            .map(|items| items.iter().filter_map(|i| i["tag"].as_str()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

/// Compile for the running platform
pub fn build(profile: &ServerProfile, options: &RoutingOptions) -> ConfigDocument {
    build_for(profile, options, detect_platform())
}

/// Compile for an explicit platform
pub fn build_for(
    profile: &ServerProfile,
    options: &RoutingOptions,
    platform: &dyn PlatformProvider,
) -> ConfigDocument {
    let mut root = Map::new();
    root.insert("log".into(), json!({ "loglevel": log_level(&options.log_level) }));
    root.insert("inbounds".into(), Value::Array(inbounds(options, platform)));
    root.insert("outbounds".into(), Value::Array(outbounds(profile, options)));
    root.insert(
        "routing".into(),
        json!({
            "domainStrategy": "IPIfNonMatch",
            "rules": routing_rules(options),
        }),
    );

    if options.stats_port().is_some() {
        root.insert(
            "api".into(),
            json!({ "tag": tags::API, "services": ["StatsService"] }),
        );
        root.insert("stats".into(), json!({}));
        root.insert(
            "policy".into(),
            json!({
                "system": {
                    "statsOutboundUplink": true,
                    "statsOutboundDownlink": true,
                }
            }),
        );
    }

    if options.tun.enabled {
        root.insert(
            "dns".into(),
            json!({ "servers": TUN_DNS_SERVERS, "queryStrategy": "UseIP" }),
        );
    }

    ConfigDocument(Value::Object(root))
}

fn log_level(level: &str) -> &'static str {
    let level = level.trim();
    LOG_LEVELS
        .iter()
        .find(|l| l.eq_ignore_ascii_case(level))
        .copied()
        .unwrap_or("warning")
}

fn sniffing() -> Value {
    json!({
        "enabled": true,
        "destOverride": ["http", "tls", "quic", "fakedns"],
    })
}

fn inbounds(options: &RoutingOptions, platform: &dyn PlatformProvider) -> Vec<Value> {
    let mut inbounds = vec![json!({
        "tag": tags::MIXED_IN,
        "listen": LOOPBACK,
        "port": options.socks_port,
        "protocol": "mixed",
        "settings": { "auth": "noauth", "udp": true },
        "sniffing": sniffing(),
    })];

    if options.tun.enabled {
        let mut settings = platform.tun_fields(&options.tun.interface_name, options.tun.strict_route);
        settings.insert("address".into(), json!(TUN_ADDRESSES));
        inbounds.push(json!({
            "tag": tags::TUN_IN,
            "protocol": "tun",
            "settings": settings,
            "sniffing": sniffing(),
        }));
    }

    if let Some(port) = options.stats_port() {
        inbounds.push(json!({
            "tag": tags::API_IN,
            "listen": LOOPBACK,
            "port": port,
            "protocol": "dokodemo-door",
            "settings": { "address": LOOPBACK },
        }));
    }

    inbounds
}

fn outbounds(profile: &ServerProfile, options: &RoutingOptions) -> Vec<Value> {
    let security = normalized(&profile.security, "none");
    let mut outbounds = vec![proxy_outbound(profile, options.mux)];

    if security == "reality" {
        outbounds.push(json!({
            "tag": tags::FRAGMENT,
            "protocol": "freedom",
            "settings": {
                "fragment": {
                    "packets": "tlshello",
                    "length": "100-200",
                    "interval": "10-20",
                }
            },
        }));
    }

    if options.tun.enabled {
        outbounds.push(json!({ "tag": tags::DNS_OUT, "protocol": "dns" }));
    }

    outbounds.push(json!({ "tag": tags::DIRECT, "protocol": "freedom" }));
    outbounds.push(json!({ "tag": tags::BLOCK, "protocol": "blackhole" }));
    outbounds
}

fn proxy_outbound(profile: &ServerProfile, mux: bool) -> Value {
    let user = match profile.protocol {
        Protocol::Vless => {
            let mut user = Map::new();
            user.insert("id".into(), json!(profile.user_id));
            user.insert("encryption".into(), json!(normalized(&profile.encryption, "none")));
            if !profile.flow.trim().is_empty() {
                user.insert("flow".into(), json!(profile.flow.trim()));
            }
            Value::Object(user)
        }
        Protocol::Vmess => json!({
            "id": profile.user_id,
            "alterId": 0,
            "security": normalized(&profile.encryption, "auto"),
        }),
    };

    let mut outbound = Map::new();
    outbound.insert("tag".into(), json!(tags::PROXY));
    outbound.insert("protocol".into(), json!(profile.protocol.as_str()));
    outbound.insert(
        "settings".into(),
        json!({
            "vnext": [{
                "address": profile.address.trim(),
                "port": profile.port,
                "users": [user],
            }]
        }),
    );
    outbound.insert("streamSettings".into(), stream_settings(profile));
    if mux {
        outbound.insert(
            "mux".into(),
            json!({ "enabled": true, "concurrency": MUX_CONCURRENCY }),
        );
    }
    Value::Object(outbound)
}

fn stream_settings(profile: &ServerProfile) -> Value {
    let network = normalized(&profile.network, "tcp");
    let security = normalized(&profile.security, "none");

    let mut stream = Map::new();
    stream.insert("network".into(), json!(network));
    stream.insert("security".into(), json!(security));

    match network.as_str() {
        "ws" => {
            let mut ws = Map::new();
            ws.insert("path".into(), json!(non_empty(&profile.path).unwrap_or("/")));
            if let Some(host) = non_empty(&profile.host) {
                ws.insert("headers".into(), json!({ "Host": host }));
            }
            stream.insert("wsSettings".into(), Value::Object(ws));
        }
        "grpc" => {
            stream.insert(
                "grpcSettings".into(),
                json!({ "serviceName": profile.service_name.trim() }),
            );
        }
        "h2" | "http" => {
            let mut http = Map::new();
            http.insert("path".into(), json!(non_empty(&profile.path).unwrap_or("/")));
            if let Some(host) = non_empty(&profile.host) {
                http.insert("host".into(), json!([host]));
            }
            stream.insert("httpSettings".into(), Value::Object(http));
        }
        "tcp" => {
            let header_type = normalized(&profile.header_type, "none");
            if header_type != "none" {
                let mut header = Map::new();
                header.insert("type".into(), json!(header_type));
                if header_type == "http" {
                    let mut request = Map::new();
                    request.insert("path".into(), json!([non_empty(&profile.path).unwrap_or("/")]));
                    if let Some(host) = non_empty(&profile.host) {
                        request.insert("headers".into(), json!({ "Host": [host] }));
                    }
                    header.insert("request".into(), Value::Object(request));
                }
                stream.insert("tcpSettings".into(), json!({ "header": header }));
            }
        }
        _ => {}
    }

    match security.as_str() {
        "tls" => {
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(server_name(profile)));
            tls.insert("allowInsecure".into(), json!(profile.allow_insecure));
            if !profile.alpn.is_empty() {
                tls.insert("alpn".into(), json!(profile.alpn));
            }
            if let Some(fp) = non_empty(&profile.fingerprint) {
                tls.insert("fingerprint".into(), json!(fp));
            }
            stream.insert("tlsSettings".into(), Value::Object(tls));
        }
        "reality" => {
            stream.insert(
                "realitySettings".into(),
                json!({
                    "serverName": server_name(profile),
                    "fingerprint": non_empty(&profile.fingerprint).unwrap_or("chrome"),
                    "publicKey": profile.public_key.trim(),
                    "shortId": profile.short_id.trim(),
                    "spiderX": profile.spider_x.trim(),
                }),
            );
            stream.insert("sockopt".into(), json!({ "dialerProxy": tags::FRAGMENT }));
        }
        _ => {}
    }

    Value::Object(stream)
}

fn server_name(profile: &ServerProfile) -> &str {
    non_empty(&profile.sni)
        .or_else(|| non_empty(&profile.host))
        .unwrap_or_else(|| profile.address.trim())
}

fn routing_rules(options: &RoutingOptions) -> Vec<Value> {
    let tun = options.tun.enabled;
    let mut rules = Vec::new();

    if options.stats_port().is_some() {
        rules.push(json!({
            "type": "field",
            "inboundTag": [tags::API_IN],
            "outboundTag": tags::API,
        }));
    }

    if tun {
        rules.push(json!({
            "type": "field",
            "inboundTag": [tags::TUN_IN],
            "port": "53",
            "outboundTag": tags::DNS_OUT,
        }));
        rules.push(json!({
            "type": "field",
            "inboundTag": [tags::TUN_IN],
            "port": NOISE_PORTS,
            "outboundTag": tags::BLOCK,
        }));
        rules.push(json!({
            "type": "field",
            "inboundTag": [tags::TUN_IN],
            "ip": NOISE_ADDRESSES,
            "outboundTag": tags::BLOCK,
        }));
    }

    // With TUN on, only the mixed inbound may go direct for local ranges;
    // doing the same for tun-in would loop back into the interface.
    let mut private = Map::new();
    private.insert("type".into(), json!("field"));
    if tun {
        private.insert("inboundTag".into(), json!([tags::MIXED_IN]));
    }
    let mut local = private.clone();
    private.insert("ip".into(), json!(PRIVATE_CIDRS));
    private.insert("outboundTag".into(), json!(tags::DIRECT));
    local.insert("domain".into(), json!(LOCAL_DOMAINS));
    local.insert("outboundTag".into(), json!(tags::DIRECT));
    rules.push(Value::Object(private));
    rules.push(Value::Object(local));

    let user_rules = [
        (&options.block_domains, &options.block_processes, tags::BLOCK),
        (&options.direct_domains, &options.direct_processes, tags::DIRECT),
        (&options.proxy_domains, &options.proxy_processes, tags::PROXY),
    ];
    for (domains, processes, outbound) in user_rules {
        if let Some(rule) = domain_rule(domains, outbound) {
            rules.push(rule);
        }
        if options.process_routing {
            if let Some(rule) = process_rule(processes, outbound) {
                rules.push(rule);
            }
        }
    }

    let fallback = match (tun, options.default_policy) {
        (true, _) => tags::PROXY,
        (false, DefaultPolicy::Whitelist) => tags::DIRECT,
        (false, DefaultPolicy::Blacklist) => tags::PROXY,
    };
    rules.push(json!({
        "type": "field",
        "network": "tcp,udp",
        "outboundTag": fallback,
    }));

    rules
}

fn domain_rule(list: &RuleList, outbound: &str) -> Option<Value> {
    if list.is_empty() {
        return None;
    }
    let domains: Vec<String> = list.iter().map(normalize_domain).collect();
    Some(json!({
        "type": "field",
        "domain": domains,
        "outboundTag": outbound,
    }))
}

fn process_rule(list: &RuleList, outbound: &str) -> Option<Value> {
    if list.is_empty() {
        return None;
    }
    Some(json!({
        "type": "field",
        "process": list.as_slice(),
        "outboundTag": outbound,
    }))
}

/// Prefix bare entries with `domain:`
fn normalize_domain(entry: &str) -> String {
    let lower = entry.to_ascii_lowercase();
    if DOMAIN_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        entry.to_string()
    } else {
        format!("domain:{}", entry)
    }
}

fn normalized(value: &str, default: &str) -> String {
    match value.trim() {
        "" => default.to_string(),
        v => v.to_ascii_lowercase(),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    match value.trim() {
        "" => None,
        v => Some(v),
    }
}
