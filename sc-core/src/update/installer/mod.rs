//! Self-replacement through an external install script.
//!
//! The running agent never overwrites its own binary. Instead it:
//!
//! 1. backs up the current binary and config directory (best effort),
//! 2. renders a native shell script for the platform,
//! 3. launches that script detached, elevated where needed,
//!
//! and then the caller exits so the script can stop the service, swap the
//! binary and start it again. Any failure before the launch rolls the
//! backup back into place.

pub mod linux;
pub mod macos;
pub mod windows;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Local;
use fs_extra::dir::CopyOptions;
use tracing::{info, warn};

use crate::error::ScError;
use crate::update::version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    /// Name used in manifest queries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::MacOs => "macos",
            Self::Linux => "linux",
        }
    }

    /// Log file the install script appends to.
    pub fn update_log_path(self) -> &'static str {
        match self {
            Self::Windows => r"C:\ProgramData\ScreenControl\logs\update.log",
            Self::MacOs => "/Library/Logs/ScreenControl/update.log",
            Self::Linux => "/var/log/screencontrol/update.log",
        }
    }

    pub fn default_staging_dir(self) -> PathBuf {
        PathBuf::from(match self {
            Self::Windows => r"C:\ProgramData\ScreenControl\updates",
            Self::MacOs => "/Library/Caches/ScreenControl/updates",
            Self::Linux => "/var/lib/screencontrol/updates",
        })
    }

    fn script_extension(self) -> &'static str {
        match self {
            Self::Windows => "cmd",
            _ => "sh",
        }
    }
}

/// Where the installed agent lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    /// Service name (Windows SCM), launchd plist label, or systemd unit.
    pub service_name: String,
    /// Installed agent executable, replaced by the script.
    pub binary_path: PathBuf,
    /// File name searched for inside the extracted package.
    pub executable_name: String,
    pub config_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_path: PathBuf,
    /// Tray/UI companion stopped and restarted around the swap.
    pub companion_ui: Option<PathBuf>,
}

impl InstallLayout {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Windows => Self {
                service_name: "ScreenControlAgent".into(),
                binary_path: r"C:\Program Files\ScreenControl\screencontrol-agent.exe".into(),
                executable_name: "screencontrol-agent.exe".into(),
                config_dir: r"C:\ProgramData\ScreenControl\config".into(),
                backup_dir: r"C:\ProgramData\ScreenControl\backup".into(),
                log_path: platform.update_log_path().into(),
                companion_ui: Some(r"C:\Program Files\ScreenControl\ScreenControlTray.exe".into()),
            },
            Platform::MacOs => Self {
                service_name: "com.screencontrol.agent".into(),
                binary_path: "/usr/local/bin/screencontrol-agent".into(),
                executable_name: "screencontrol-agent".into(),
                config_dir: "/Library/Application Support/ScreenControl".into(),
                backup_dir: "/Library/Caches/ScreenControl/backup".into(),
                log_path: platform.update_log_path().into(),
                companion_ui: Some("/Applications/ScreenControl.app".into()),
            },
            Platform::Linux => Self {
                service_name: "screencontrol-agent".into(),
                binary_path: "/usr/local/bin/screencontrol-agent".into(),
                executable_name: "screencontrol-agent".into(),
                config_dir: "/etc/screencontrol".into(),
                backup_dir: "/var/lib/screencontrol/backup".into(),
                log_path: platform.update_log_path().into(),
                companion_ui: None,
            },
        }
    }

    /// Systemd unit / launchd plist path derived from the service name.
    pub fn service_file(&self, platform: Platform) -> Option<PathBuf> {
        match platform {
            Platform::MacOs => Some(PathBuf::from(format!(
                "/Library/LaunchDaemons/{}.plist",
                self.service_name
            ))),
            _ => None,
        }
    }
}

/// One install run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub version: String,
    /// Verified package archive.
    pub package: PathBuf,
    /// Per-run download directory, removed by the script on success.
    pub work_dir: PathBuf,
    /// Directory the script is written to; must outlive `work_dir`.
    pub script_dir: PathBuf,
}

pub trait Installer: Send + Sync {
    /// Hand the plan to an external process. On `Ok` the caller must exit.
    fn install(&self, plan: &InstallPlan) -> Result<(), ScError>;
}

pub struct ScriptInstaller {
    platform: Platform,
    layout: InstallLayout,
}

impl ScriptInstaller {
    pub fn new(platform: Platform, layout: InstallLayout) -> Self {
        Self { platform, layout }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn render(&self, plan: &InstallPlan) -> String {
        match self.platform {
            Platform::Windows => windows::render_script(&self.layout, plan),
            Platform::MacOs => macos::render_script(&self.layout, plan),
            Platform::Linux => linux::render_script(&self.layout, plan),
        }
    }

    /// Copy the binary and config dir to a timestamped backup directory.
    fn backup(&self) -> Option<PathBuf> {
        let dir = self
            .layout
            .backup_dir
            .join(Local::now().format("%Y%m%d-%H%M%S").to_string());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "backup skipped: {e}");
            return None;
        }

        if let Some(name) = self.layout.binary_path.file_name() {
            if let Err(e) = std::fs::copy(&self.layout.binary_path, dir.join(name)) {
                warn!(path = %self.layout.binary_path.display(), "binary backup failed: {e}");
            }
        }
        if self.layout.config_dir.is_dir() {
            let mut options = CopyOptions::new();
            options.overwrite = true;
            if let Err(e) = fs_extra::dir::copy(&self.layout.config_dir, &dir, &options) {
                warn!(path = %self.layout.config_dir.display(), "config backup failed: {e}");
            }
        }
        info!(dir = %dir.display(), "backup created");
        Some(dir)
    }

    fn rollback(&self, backup: Option<&Path>) {
        let Some(dir) = backup else {
            warn!("rollback skipped: no backup");
            return;
        };
        let Some(name) = self.layout.binary_path.file_name() else {
            return;
        };
        let saved = dir.join(name);
        if !saved.exists() {
            warn!("rollback skipped: backup has no binary");
            return;
        }
        match std::fs::copy(&saved, &self.layout.binary_path) {
            Ok(_) => info!(from = %dir.display(), "rolled back to backup"),
            Err(e) => warn!("rollback failed: {e}"),
        }
    }

    fn write_script(&self, plan: &InstallPlan) -> Result<PathBuf, ScError> {
        std::fs::create_dir_all(&plan.script_dir)?;
        let path = plan.script_dir.join(format!(
            "install-{}.{}",
            version::sanitize(&plan.version),
            self.platform.script_extension()
        ));
        std::fs::write(&path, self.render(plan))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(path)
    }

    fn launch(&self, script: &Path) -> Result<(), ScError> {
        let (program, args) = launch_command(self.platform, script, LaunchContext::detect());
        info!(%program, ?args, "launching install script");
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }
        cmd.spawn()
            .map_err(|e| ScError::Installation(format!("failed to launch {program}: {e}")))?;
        Ok(())
    }
}

impl Installer for ScriptInstaller {
    fn install(&self, plan: &InstallPlan) -> Result<(), ScError> {
        if !version::is_valid(&plan.version) {
            return Err(ScError::Installation(format!(
                "refusing to install invalid version {:?}",
                plan.version
            )));
        }
        if !plan.package.is_file() {
            return Err(ScError::Installation(format!(
                "package {} is missing",
                plan.package.display()
            )));
        }
        let backup = self.backup();
        let result = self
            .write_script(plan)
            .map_err(|e| ScError::Installation(format!("cannot write install script: {e}")))
            .and_then(|script| self.launch(&script));
        if let Err(e) = &result {
            warn!("install hand-off failed: {e}");
            self.rollback(backup.as_deref());
        }
        result
    }
}

/// How the agent process was started, as far as launching the script cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchContext {
    /// Running as root / SYSTEM.
    pub privileged: bool,
    /// Running as a systemd unit (`INVOCATION_ID` is set). Children stay in
    /// the unit's cgroup and die with it unless moved to their own unit.
    pub under_systemd: bool,
}

impl LaunchContext {
    pub fn detect() -> Self {
        Self {
            privileged: is_privileged(),
            under_systemd: std::env::var_os("INVOCATION_ID").is_some(),
        }
    }
}

/// Transient unit the Linux install script runs in under systemd.
pub const SYSTEMD_UPDATE_UNIT: &str = "screencontrol-update";

/// Program and arguments that run `script` with the privileges it needs.
pub fn launch_command(platform: Platform, script: &Path, ctx: LaunchContext) -> (String, Vec<String>) {
    let script = script.display().to_string();
    match (platform, ctx.privileged) {
        (Platform::Windows, _) => ("cmd".into(), vec!["/c".into(), script]),
        // Stopping the agent unit kills its whole cgroup, script included.
        (Platform::Linux, _) if ctx.under_systemd => (
            "systemd-run".into(),
            vec![
                format!("--unit={SYSTEMD_UPDATE_UNIT}"),
                "--collect".into(),
                "/bin/bash".into(),
                script,
            ],
        ),
        (_, true) => ("/bin/bash".into(), vec![script]),
        (Platform::MacOs, false) => (
            "osascript".into(),
            vec![
                "-e".into(),
                format!(
                    "do shell script \"/bin/bash {}\" with administrator privileges",
                    script.replace('\\', "\\\\").replace('"', "\\\"")
                ),
            ],
        ),
        (Platform::Linux, false) => ("pkexec".into(), vec!["/bin/bash".into(), script]),
    }
}

#[cfg(unix)]
fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_privileged() -> bool {
    true
}

/// Single-quote a value for bash.
pub(crate) fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
