//! Best-effort host identification and heartbeat sensors.
//!
//! Everything here degrades to a placeholder value instead of failing:
//! registration must never be blocked by a missing `/proc` entry or an
//! absent system utility.

use std::process::Command;

use serde::Serialize;
use sysinfo::{Networks, System};

/// Hardware fingerprint sent inside `register`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub hostname: String,
    pub cpu_model: String,
    pub mac_addresses: Vec<String>,
}

/// Static facts about the managed machine.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineInfo {
    pub machine_id: String,
    pub os_type: String,
    pub os_version: String,
    pub arch: String,
    pub fingerprint: Fingerprint,
}

impl MachineInfo {
    /// Collect machine facts for the running host.
    pub fn collect() -> Self {
        let hostname = hostname();
        let machine_id = machine_id().unwrap_or_else(|| hostname.clone());
        Self {
            machine_id,
            os_type: os_type().to_string(),
            os_version: os_version(),
            arch: std::env::consts::ARCH.to_string(),
            fingerprint: Fingerprint {
                hostname,
                cpu_model: cpu_model(),
                mac_addresses: mac_addresses(),
            },
        }
    }
}

/// Platform name as reported to the control plane and the update server.
pub fn os_type() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "windows" => "windows",
        _ => "linux",
    }
}

/// Power source reported with each heartbeat.
pub fn power_state() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") else {
            return "unknown";
        };
        let mut saw_battery = false;
        for entry in entries.flatten() {
            let path = entry.path();
            let kind = std::fs::read_to_string(path.join("type")).unwrap_or_default();
            match kind.trim() {
                "Mains" => {
                    let online = std::fs::read_to_string(path.join("online")).unwrap_or_default();
                    if online.trim() == "1" {
                        return "ac";
                    }
                }
                "Battery" => saw_battery = true,
                _ => {}
            }
        }
        if saw_battery { "battery" } else { "ac" }
    }
    #[cfg(target_os = "macos")]
    {
        match run("pmset", &["-g", "batt"]) {
            Some(out) if out.contains("AC Power") => "ac",
            Some(out) if out.contains("Battery Power") => "battery",
            _ => "unknown",
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "unknown"
    }
}

/// Whether the interactive session is currently locked.
pub fn is_screen_locked() -> bool {
    #[cfg(target_os = "linux")]
    {
        let Some(sessions) = run("loginctl", &["list-sessions", "--no-legend"]) else {
            return false;
        };
        sessions
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .filter_map(|id| run("loginctl", &["show-session", id, "-p", "LockedHint", "--value"]))
            .any(|v| v.trim() == "yes")
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

// ── Probes ───────────────────────────────────────────────────────

fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn hostname() -> String {
    System::host_name()
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

fn machine_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
    }
    #[cfg(target_os = "macos")]
    {
        let out = run("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"])?;
        out.lines()
            .find(|l| l.contains("IOPlatformUUID"))
            .and_then(|l| l.split('"').nth(3))
            .map(str::to_string)
    }
    #[cfg(target_os = "windows")]
    {
        let out = run(
            "reg",
            &["query", r"HKLM\SOFTWARE\Microsoft\Cryptography", "/v", "MachineGuid"],
        )?;
        out.lines()
            .find(|l| l.contains("MachineGuid"))
            .and_then(|l| l.split_whitespace().last())
            .map(str::to_string)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

fn os_version() -> String {
    System::long_os_version()
        .or_else(System::os_version)
        .or_else(System::kernel_version)
        .unwrap_or_default()
}

fn cpu_model() -> String {
    let mut system = System::new();
    system.refresh_cpu_all();
    system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

fn mac_addresses() -> Vec<String> {
    let networks = Networks::new_with_refreshed_list();
    hardware_macs(
        networks
            .iter()
            .map(|(name, data)| (name.as_str(), data.mac_address().to_string())),
    )
}

/// Sorted, de-duplicated addresses, skipping loopback and all-zero entries.
fn hardware_macs<'a>(interfaces: impl Iterator<Item = (&'a str, String)>) -> Vec<String> {
    let mut macs: Vec<String> = interfaces
        .filter(|(name, _)| *name != "lo")
        .map(|(_, mac)| mac.to_lowercase())
        .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
        .collect();
    macs.sort();
    macs.dedup();
    macs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_never_panics() {
        let info = MachineInfo::collect();
        assert!(!info.machine_id.is_empty());
        assert!(!info.fingerprint.hostname.is_empty());
        assert_eq!(info.arch, std::env::consts::ARCH);
    }

    #[test]
    fn fingerprint_serializes_camel_case() {
        let fp = Fingerprint {
            hostname: "box".into(),
            cpu_model: "cpu".into(),
            mac_addresses: vec!["aa:bb:cc:dd:ee:ff".into()],
        };
        let v = serde_json::to_value(&fp).unwrap();
        assert_eq!(v["cpuModel"], "cpu");
        assert_eq!(v["macAddresses"][0], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn hardware_macs_skip_loopback_and_zero() {
        let interfaces = [
            ("lo", "00:00:00:00:00:00".to_string()),
            ("eth0", "A4:83:E7:00:11:22".to_string()),
            ("wlan0", "a4:83:e7:00:11:22".to_string()),
            ("docker0", "00:00:00:00:00:00".to_string()),
            ("eth1", "02:42:ac:11:00:02".to_string()),
        ];
        assert_eq!(
            hardware_macs(interfaces.into_iter()),
            vec!["02:42:ac:11:00:02".to_string(), "a4:83:e7:00:11:22".to_string()]
        );
    }

    #[test]
    fn os_version_and_cpu_are_filled() {
        assert!(!cpu_model().is_empty());
        // Placeholder hostnames are never empty either.
        assert!(!hostname().is_empty());
        let _ = os_version();
    }
}
