//! Routing Options
//!
//! Everything besides the server profile that shapes the engine config:
//! local ports, TUN mode, the default policy and the user rule lists.

use serde::{Deserialize, Serialize};

/// Default mixed (SOCKS + HTTP) inbound port
pub const DEFAULT_SOCKS_PORT: u16 = 10808;
/// Default stats API port
pub const DEFAULT_API_PORT: u16 = 10813;

/// What happens to traffic no rule matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    /// Only listed destinations go through the proxy
    Whitelist,
    /// Everything goes through the proxy unless listed otherwise
    #[default]
    Blacklist,
}

/// The six user rule lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    DirectDomain,
    ProxyDomain,
    BlockDomain,
    DirectProcess,
    ProxyProcess,
    BlockProcess,
}

impl RuleKind {
    pub const ALL: [RuleKind; 6] = [
        RuleKind::DirectDomain,
        RuleKind::ProxyDomain,
        RuleKind::BlockDomain,
        RuleKind::DirectProcess,
        RuleKind::ProxyProcess,
        RuleKind::BlockProcess,
    ];

    pub fn is_process(&self) -> bool {
        matches!(
            self,
            RuleKind::DirectProcess | RuleKind::ProxyProcess | RuleKind::BlockProcess
        )
    }
}

/// Ordered list of trimmed, case-insensitively unique entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct RuleList(Vec<String>);

impl RuleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; returns false for blanks and duplicates
    pub fn add(&mut self, entry: impl AsRef<str>) -> bool {
        let entry = entry.as_ref().trim();
        if entry.is_empty() || self.contains(entry) {
            return false;
        }
        self.0.push(entry.to_string());
        true
    }

    /// Remove an entry, ignoring case; returns whether anything was removed
    pub fn remove(&mut self, entry: impl AsRef<str>) -> bool {
        let entry = entry.as_ref().trim();
        let before = self.0.len();
        self.0.retain(|e| !e.eq_ignore_ascii_case(entry));
        self.0.len() != before
    }

    /// Replace the whole list, applying the same normalization as `add`
    pub fn replace<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.0.clear();
        for entry in entries {
            self.add(entry);
        }
    }

    pub fn contains(&self, entry: &str) -> bool {
        let entry = entry.trim();
        self.0.iter().any(|e| e.eq_ignore_ascii_case(entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for RuleList {
    fn from(entries: Vec<String>) -> Self {
        let mut list = Self::new();
        list.replace(entries);
        list
    }
}

impl From<RuleList> for Vec<String> {
    fn from(list: RuleList) -> Self {
        list.0
    }
}

impl<S: AsRef<str>> FromIterator<S> for RuleList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = Self::new();
        list.replace(iter);
        list
    }
}

/// TUN inbound settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunOptions {
    pub enabled: bool,
    /// Interface name; empty picks the platform default
    pub interface_name: String,
    /// Refuse traffic that would bypass the interface
    pub strict_route: bool,
}

impl Default for TunOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interface_name: String::new(),
            strict_route: true,
        }
    }
}

/// Engine-independent routing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingOptions {
    /// Mixed inbound port on loopback
    pub socks_port: u16,
    /// Stats API port; `None` disables the stats API
    #[serde(with = "optional_port")]
    pub api_port: Option<u16>,
    /// Engine log level (debug, info, warning, error, none)
    pub log_level: String,
    pub mux: bool,
    pub tun: TunOptions,
    pub default_policy: DefaultPolicy,

    pub direct_domains: RuleList,
    pub proxy_domains: RuleList,
    pub block_domains: RuleList,
    pub direct_processes: RuleList,
    pub proxy_processes: RuleList,
    pub block_processes: RuleList,

    /// Whether the installed engine understands process rules.
    /// Filled in from the version probe right before compiling.
    #[serde(skip)]
    pub process_routing: bool,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            socks_port: DEFAULT_SOCKS_PORT,
            api_port: Some(DEFAULT_API_PORT),
            log_level: "warning".to_string(),
            mux: false,
            tun: TunOptions::default(),
            default_policy: DefaultPolicy::default(),
            direct_domains: RuleList::new(),
            proxy_domains: RuleList::new(),
            block_domains: RuleList::new(),
            direct_processes: RuleList::new(),
            proxy_processes: RuleList::new(),
            block_processes: RuleList::new(),
            process_routing: false,
        }
    }
}

/// `None` is stored as port 0 so a disabled API survives formats without null
mod optional_port {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &Option<u16>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(port.unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
        let port = Option::<u16>::deserialize(d)?;
        Ok(port.filter(|p| *p != 0))
    }
}

impl RoutingOptions {
    pub fn rule_list(&self, kind: RuleKind) -> &RuleList {
        match kind {
            RuleKind::DirectDomain => &self.direct_domains,
            RuleKind::ProxyDomain => &self.proxy_domains,
            RuleKind::BlockDomain => &self.block_domains,
            RuleKind::DirectProcess => &self.direct_processes,
            RuleKind::ProxyProcess => &self.proxy_processes,
            RuleKind::BlockProcess => &self.block_processes,
        }
    }

    pub fn rule_list_mut(&mut self, kind: RuleKind) -> &mut RuleList {
        match kind {
            RuleKind::DirectDomain => &mut self.direct_domains,
            RuleKind::ProxyDomain => &mut self.proxy_domains,
            RuleKind::BlockDomain => &mut self.block_domains,
            RuleKind::DirectProcess => &mut self.direct_processes,
            RuleKind::ProxyProcess => &mut self.proxy_processes,
            RuleKind::BlockProcess => &mut self.block_processes,
        }
    }

    /// Stats API enabled with a usable port
    pub fn stats_port(&self) -> Option<u16> {
        self.api_port.filter(|p| *p != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_list_normalization() {
        let mut list = RuleList::new();
        assert!(list.add("  example.com "));
        assert!(!list.add("EXAMPLE.com"));
        assert!(!list.add("   "));
        assert!(list.add("full:foo.org"));
        assert_eq!(list.as_slice(), &["example.com", "full:foo.org"]);

        assert!(list.remove("Example.COM"));
        assert!(!list.remove("missing"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_rule_list_replace() {
        let mut list: RuleList = ["a.com", "b.com"].into_iter().collect();
        list.replace(["c.com", " C.com", "", "d.com"]);
        assert_eq!(list.as_slice(), &["c.com", "d.com"]);
    }

    #[test]
    fn test_rule_list_deserialize_dedups() {
        let list: RuleList = serde_json::from_str(r#"["x.com", "X.COM", " y.com "]"#).unwrap();
        assert_eq!(list.as_slice(), &["x.com", "y.com"]);
    }

    #[test]
    fn test_defaults() {
        let options = RoutingOptions::default();
        assert_eq!(options.socks_port, 10808);
        assert_eq!(options.stats_port(), Some(10813));
        assert_eq!(options.default_policy, DefaultPolicy::Blacklist);
        assert!(!options.tun.enabled);
        assert!(!options.mux);
    }

    #[test]
    fn test_rule_list_by_kind() {
        let mut options = RoutingOptions::default();
        for kind in RuleKind::ALL {
            options.rule_list_mut(kind).add(format!("{:?}", kind));
        }
        assert_eq!(options.block_processes.as_slice(), &["BlockProcess"]);
        assert!(RuleKind::ProxyProcess.is_process());
        assert!(!RuleKind::ProxyDomain.is_process());
    }

    #[test]
    fn test_zero_api_port_disables_stats() {
        let options = RoutingOptions {
            api_port: Some(0),
            ..Default::default()
        };
        assert_eq!(options.stats_port(), None);
    }

    #[test]
    fn test_disabled_api_port_persists() {
        let options = RoutingOptions {
            api_port: None,
            ..Default::default()
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["api_port"], 0);

        let back: RoutingOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back.api_port, None);

        let missing: RoutingOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.api_port, Some(DEFAULT_API_PORT));
    }
}
