//! Engine version probe
//!
//! Process-based routing rules only exist in newer engine releases. Older
//! ones reject the whole config when they see them, so the compiler only
//! emits them after `engine version` reports a new enough build.

use crate::binary::EngineBinary;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Bound on the `version` invocation
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// First release that accepts `process` routing rules
pub const MIN_PROCESS_ROUTING_VERSION: EngineVersion = EngineVersion {
    major: 25,
    minor: 8,
    patch: 3,
};

static VERSION_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok());

/// A `major.minor.patch` engine version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    /// Find the first `x.y.z` in `text`
    pub fn parse(text: &str) -> Option<Self> {
        let caps = VERSION_PATTERN.as_ref()?.captures(text)?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }

    pub fn supports_process_routing(&self) -> bool {
        *self >= MIN_PROCESS_ROUTING_VERSION
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Run `engine version` and parse the result
pub async fn probe_version(engine: &EngineBinary, timeout: Duration) -> Option<EngineVersion> {
    let output = match engine.output(&["version"], timeout).await {
        Ok(output) => output,
        Err(e) => {
            debug!("Engine version probe failed: {}", e);
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version = stdout
        .lines()
        .chain(stderr.lines())
        .find_map(EngineVersion::parse);

    if version.is_none() {
        debug!("Unrecognized engine version output: {}", stdout.trim());
    }
    version
}

/// Cached process-routing capability, keyed by executable path
///
/// Any failure counts as "unsupported" and is cached like a success; only
/// pointing at a different executable triggers a new probe.
#[derive(Debug)]
pub struct ProcessRoutingProbe {
    timeout: Duration,
    cached: Option<(PathBuf, bool)>,
}

impl Default for ProcessRoutingProbe {
    fn default() -> Self {
        Self::new(VERSION_PROBE_TIMEOUT)
    }
}

impl ProcessRoutingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cached: None,
        }
    }

    /// Cached answer for `engine`, if one exists
    pub fn cached(&self, engine: &EngineBinary) -> Option<bool> {
        match &self.cached {
            Some((path, supported)) if path == engine.path() => Some(*supported),
            _ => None,
        }
    }

    /// Whether `engine` accepts process rules, probing at most once per path
    pub async fn supported(&mut self, engine: &EngineBinary) -> bool {
        if let Some(supported) = self.cached(engine) {
            return supported;
        }

        let supported = match probe_version(engine, self.timeout).await {
            Some(version) => {
                let supported = version.supports_process_routing();
                info!(
                    "Engine version {} (process routing {})",
                    version,
                    if supported { "available" } else { "unavailable" }
                );
                supported
            }
            None => false,
        };

        self.cached = Some((engine.path().to_path_buf(), supported));
        supported
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert!(VERSION_PATTERN.is_some());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            EngineVersion::parse("Xray 25.8.3 (Xray, Penetrates Everything.) 4f0c0b6 (go1.24.6 linux/amd64)"),
            Some(EngineVersion {
                major: 25,
                minor: 8,
                patch: 3,
            })
        );
        assert_eq!(EngineVersion::parse("v1.8.24").map(|v| v.to_string()), Some("1.8.24".into()));
        assert_eq!(EngineVersion::parse("unknown build"), None);
    }

    #[test]
    fn test_version_floor() {
        assert!(MIN_PROCESS_ROUTING_VERSION.supports_process_routing());
        assert!(EngineVersion::parse("26.1.0").unwrap().supports_process_routing());
        assert!(!EngineVersion::parse("25.8.2").unwrap().supports_process_routing());
        assert!(!EngineVersion::parse("1.8.24").unwrap().supports_process_routing());
    }

    #[tokio::test]
    async fn test_missing_engine_is_unsupported_and_cached() {
        let mut probe = ProcessRoutingProbe::default();
        let engine = EngineBinary::new("/nonexistent/veil/xray");

        assert_eq!(probe.cached(&engine), None);
        assert!(!probe.supported(&engine).await);
        assert_eq!(probe.cached(&engine), Some(false));

        let other = EngineBinary::new("/nonexistent/veil/xray2");
        assert_eq!(probe.cached(&other), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("version"),
            "echo 'Xray 25.9.11 (Xray, Penetrates Everything.)'\n",
        )
        .unwrap();
        let engine = EngineBinary::new("/bin/sh").with_working_dir(Some(dir.path().to_path_buf()));

        let version = probe_version(&engine, VERSION_PROBE_TIMEOUT).await.unwrap();
        assert_eq!(version.to_string(), "25.9.11");

        let mut probe = ProcessRoutingProbe::default();
        assert!(probe.supported(&engine).await);

        // Cached per path: changing the script does not change the answer
        std::fs::write(dir.path().join("version"), "echo 'Xray 1.0.0'\n").unwrap();
        assert!(probe.supported(&engine).await);

        probe.invalidate();
        assert!(!probe.supported(&engine).await);
    }
}
