//! Platform capability providers
//!
//! The few engine-config fields that differ per OS (TUN interface naming,
//! packet stack, engine binary name) live behind [`PlatformProvider`]. The
//! provider is picked once at startup from the running OS, not at compile time,
//! so every variant stays testable on any host.

use serde_json::{json, Map, Value};

/// Per-OS pieces of the engine configuration
pub trait PlatformProvider: Send + Sync {
    /// Short OS name for logging
    fn name(&self) -> &'static str;

    /// Interface name used when the user did not pick one
    fn default_tun_name(&self) -> &'static str;

    /// Packet-processing stack for the TUN inbound
    fn tun_stack(&self) -> &'static str;

    /// File name of the engine executable
    fn engine_binary_name(&self) -> &'static str {
        "xray"
    }

    /// Platform-dependent part of the TUN inbound settings
    fn tun_fields(&self, interface_name: &str, strict_route: bool) -> Map<String, Value> {
        common_tun_fields(self, interface_name, strict_route)
    }
}

/// TUN settings shared by every platform
fn common_tun_fields<P: PlatformProvider + ?Sized>(
    platform: &P,
    interface_name: &str,
    strict_route: bool,
) -> Map<String, Value> {
    let name = match interface_name.trim() {
        "" => platform.default_tun_name(),
        name => name,
    };

    let mut fields = Map::new();
    fields.insert("name".into(), json!(name));
    fields.insert("stack".into(), json!(platform.tun_stack()));
    fields.insert("autoRoute".into(), json!(true));
    fields.insert("strictRoute".into(), json!(strict_route));
    fields
}

pub struct LinuxPlatform;

impl PlatformProvider for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn default_tun_name(&self) -> &'static str {
        "veil-tun"
    }

    fn tun_stack(&self) -> &'static str {
        "system"
    }
}

pub struct MacOsPlatform;

impl PlatformProvider for MacOsPlatform {
    fn name(&self) -> &'static str {
        "macos"
    }

    // utun names are assigned by the kernel from a fixed prefix
    fn default_tun_name(&self) -> &'static str {
        "utun199"
    }

    fn tun_stack(&self) -> &'static str {
        "system"
    }
}

pub struct WindowsPlatform;

impl PlatformProvider for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn default_tun_name(&self) -> &'static str {
        "VeilTun"
    }

    fn tun_stack(&self) -> &'static str {
        "gvisor"
    }

    fn engine_binary_name(&self) -> &'static str {
        "xray.exe"
    }

    fn tun_fields(&self, interface_name: &str, strict_route: bool) -> Map<String, Value> {
        let mut fields = common_tun_fields(self, interface_name, strict_route);
        // wintun drops packets above its default MTU on some adapters
        fields.insert("mtu".into(), json!(1500));
        fields
    }
}

/// Provider for an OS name as reported by `std::env::consts::OS`
pub fn platform_for(os: &str) -> &'static dyn PlatformProvider {
    match os {
        "windows" => &WindowsPlatform,
        "macos" => &MacOsPlatform,
        _ => &LinuxPlatform,
    }
}

/// Provider for the running OS
pub fn detect_platform() -> &'static dyn PlatformProvider {
    platform_for(std::env::consts::OS)
}
