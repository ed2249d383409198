//! Commands answered by the agent itself: shell, filesystem and system.
//!
//! Every handler takes the request's `params` object and returns the JSON
//! result. Failures are `ScError`s; the dispatcher turns them into the
//! `{error}` shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fs_extra::dir::CopyOptions;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sysinfo::{Disks, System};
use tracing::{debug, info};

use crate::error::ScError;
use crate::machine::MachineInfo;

/// Default and upper bound for `shell_exec` timeouts.
const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_SHELL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Largest file `fs_read` returns in one response.
const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;

/// Decode `params` into a typed argument struct.
pub fn params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ScError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| ScError::Dispatch(format!("Invalid params for {method}: {e}")))
}

// ── Shell ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellArgs {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub async fn shell_exec(args: ShellArgs) -> Result<Value, ScError> {
    if args.command.trim().is_empty() {
        return Err(ScError::Dispatch("command is empty".into()));
    }
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SHELL_TIMEOUT)
        .min(MAX_SHELL_TIMEOUT);

    let mut cmd = if cfg!(windows) {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/c").arg(&args.command);
        c
    } else {
        let mut c = tokio::process::Command::new("/bin/sh");
        c.arg("-c").arg(&args.command);
        c
    };
    if let Some(cwd) = &args.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(&args.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %args.command, "shell_exec");
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| ScError::Timeout(timeout))??;

    let exit_code = output.status.code().unwrap_or(-1);
    debug!(exit_code, "shell_exec finished");
    Ok(json!({
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
        "exitCode": exit_code,
    }))
}

// ── Filesystem ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PathArgs {
    pub path: PathBuf,
}

pub async fn fs_list(args: PathArgs) -> Result<Value, ScError> {
    let mut dir = tokio::fs::read_dir(&args.path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await.ok();
        let modified = meta
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "isDir": meta.as_ref().is_some_and(|m| m.is_dir()),
            "size": meta.as_ref().map_or(0, |m| m.len()),
            "modified": modified,
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(json!({ "path": args.path, "entries": entries }))
}

pub async fn fs_read(args: PathArgs) -> Result<Value, ScError> {
    let meta = tokio::fs::metadata(&args.path).await?;
    if meta.is_dir() {
        return Err(ScError::Dispatch(format!("{} is a directory", args.path.display())));
    }
    if meta.len() > MAX_READ_BYTES {
        return Err(ScError::Dispatch(format!(
            "{} is {} bytes; limit is {MAX_READ_BYTES}",
            args.path.display(),
            meta.len()
        )));
    }
    let data = tokio::fs::read(&args.path).await?;
    Ok(json!({
        "path": args.path,
        "size": data.len(),
        "encoding": "base64",
        "content": BASE64.encode(&data),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteArgs {
    pub path: PathBuf,
    pub content: String,
    /// `"base64"` or `"utf8"` (default).
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub create_dirs: bool,
}

pub async fn fs_write(args: WriteArgs) -> Result<Value, ScError> {
    let data = match args.encoding.as_deref() {
        Some("base64") => BASE64
            .decode(args.content.as_bytes())
            .map_err(|e| ScError::Dispatch(format!("invalid base64 content: {e}")))?,
        None | Some("utf8") | Some("utf-8") => args.content.into_bytes(),
        Some(other) => return Err(ScError::Dispatch(format!("unsupported encoding: {other}"))),
    };
    if args.create_dirs {
        if let Some(parent) = args.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(&args.path, &data).await?;
    Ok(json!({ "path": args.path, "bytesWritten": data.len() }))
}

#[derive(Debug, Deserialize)]
pub struct CopyArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
}

pub async fn fs_copy(args: CopyArgs) -> Result<Value, ScError> {
    let message = tokio::task::spawn_blocking(move || copy_path(&args.source, &args.destination))
        .await
        .map_err(|e| ScError::Other(format!("copy task failed: {e}")))??;
    Ok(json!({ "message": message }))
}

/// Copy a file or directory. A destination that is an existing directory
/// receives the source inside it.
pub fn copy_path(src: &Path, dest: &Path) -> Result<String, ScError> {
    if !src.exists() {
        return Err(ScError::Dispatch(format!(
            "Source path '{}' does not exist",
            src.display()
        )));
    }
    if let (Ok(a), Ok(b)) = (std::fs::canonicalize(src), std::fs::canonicalize(dest)) {
        if a == b {
            return Err(ScError::Dispatch(
                "Source and destination are the same location".into(),
            ));
        }
    }

    if src.is_dir() {
        let mut options = CopyOptions::new();
        options.overwrite = true;
        options.copy_inside = true;
        fs_extra::dir::copy(src, dest, &options)?;
        Ok(format!("Directory '{}' copied to '{}'", src.display(), dest.display()))
    } else {
        let mut target = dest.to_path_buf();
        if target.is_dir() {
            if let Some(name) = src.file_name() {
                target.push(name);
            }
        }
        std::fs::copy(src, &target)?;
        Ok(format!("File '{}' copied to '{}'", src.display(), target.display()))
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteArgs {
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

pub async fn fs_delete(args: DeleteArgs) -> Result<Value, ScError> {
    let meta = tokio::fs::symlink_metadata(&args.path).await?;
    if meta.is_dir() {
        if args.recursive {
            tokio::fs::remove_dir_all(&args.path).await?;
        } else {
            tokio::fs::remove_dir(&args.path).await?;
        }
    } else {
        tokio::fs::remove_file(&args.path).await?;
    }
    Ok(json!({ "path": args.path, "deleted": true }))
}

/// Mounted volumes with their capacity.
pub fn list_drives() -> Value {
    let disks = Disks::new_with_refreshed_list();
    let mut drives: Vec<Value> = disks
        .list()
        .iter()
        .map(|d| {
            json!({
                "mountPoint": d.mount_point().display().to_string(),
                "name": d.name().to_string_lossy(),
                "fileSystem": d.file_system().to_string_lossy(),
                "totalSpace": d.total_space(),
                "availableSpace": d.available_space(),
                "removable": d.is_removable(),
            })
        })
        .collect();
    // Containers often expose no block devices at all.
    if drives.is_empty() {
        let root = if cfg!(windows) { "C:\\" } else { "/" };
        drives.push(json!({ "mountPoint": root }));
    }
    json!({ "drives": drives })
}

// ── System ───────────────────────────────────────────────────────

pub fn system_info(machine: &MachineInfo, agent_version: &str) -> Value {
    json!({
        "machineId": machine.machine_id,
        "hostname": machine.fingerprint.hostname,
        "osType": machine.os_type,
        "osVersion": machine.os_version,
        "arch": machine.arch,
        "cpuModel": machine.fingerprint.cpu_model,
        "cpuCount": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        "totalMemory": total_memory(),
        "macAddresses": machine.fingerprint.mac_addresses,
        "agentVersion": agent_version,
        "powerState": crate::machine::power_state(),
    })
}

fn total_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

#[derive(Debug, Deserialize)]
pub struct ActionArgs {
    pub action: String,
}

/// Power actions. Delayed so the response can still be delivered.
pub fn system_action(args: ActionArgs) -> Result<Value, ScError> {
    let (program, argv): (&str, &[&str]) = match (args.action.as_str(), std::env::consts::OS) {
        ("shutdown", "windows") => ("shutdown", &["/s", "/t", "60"]),
        ("reboot", "windows") => ("shutdown", &["/r", "/t", "60"]),
        ("sleep", "windows") => ("rundll32.exe", &["powrprof.dll,SetSuspendState", "0,1,0"]),
        ("shutdown", "macos") | ("shutdown", "linux") => ("shutdown", &["-h", "+1"]),
        ("reboot", "macos") | ("reboot", "linux") => ("shutdown", &["-r", "+1"]),
        ("sleep", "macos") => ("pmset", &["sleepnow"]),
        ("sleep", "linux") => ("systemctl", &["suspend"]),
        ("shutdown" | "reboot" | "sleep", os) => {
            return Err(ScError::Dispatch(format!("{} not supported on {os}", args.action)));
        }
        (other, _) => return Err(ScError::Dispatch(format!("Unknown system action: {other}"))),
    };
    std::process::Command::new(program).args(argv).spawn()?;
    info!(action = %args.action, "system action started");
    Ok(json!({ "action": args.action, "started": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_exec_captures_output_and_exit_code() {
        let cmd = if cfg!(windows) { "echo hello& exit 3" } else { "echo hello; exit 3" };
        let out = shell_exec(ShellArgs {
            command: cmd.into(),
            cwd: None,
            timeout_ms: None,
            env: HashMap::new(),
        })
        .await
        .unwrap();
        assert!(out["stdout"].as_str().unwrap().contains("hello"));
        assert_eq!(out["exitCode"], 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_exec_times_out() {
        let err = shell_exec(ShellArgs {
            command: "sleep 5".into(),
            cwd: None,
            timeout_ms: Some(100),
            env: HashMap::new(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ScError::Timeout(_)));
    }

    #[tokio::test]
    async fn write_read_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested/a.bin");

        let written = fs_write(WriteArgs {
            path: file.clone(),
            content: BASE64.encode([0u8, 1, 2, 255]),
            encoding: Some("base64".into()),
            create_dirs: true,
        })
        .await
        .unwrap();
        assert_eq!(written["bytesWritten"], 4);

        let read = fs_read(PathArgs { path: file.clone() }).await.unwrap();
        assert_eq!(
            BASE64.decode(read["content"].as_str().unwrap()).unwrap(),
            vec![0u8, 1, 2, 255]
        );

        let listing = fs_list(PathArgs {
            path: dir.path().join("nested"),
        })
        .await
        .unwrap();
        assert_eq!(listing["entries"][0]["name"], "a.bin");
        assert_eq!(listing["entries"][0]["isDir"], false);

        let nested = dir.path().join("nested");
        assert!(fs_delete(DeleteArgs { path: nested.clone(), recursive: false }).await.is_err());
        fs_delete(DeleteArgs { path: nested.clone(), recursive: true }).await.unwrap();
        assert!(!nested.exists());
    }

    #[test]
    fn copy_file_into_directory_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("f.txt"), b"x").unwrap();
        let dest = dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();

        copy_path(&src.join("f.txt"), &dest).unwrap();
        assert!(dest.join("f.txt").exists());

        copy_path(&src, &dest).unwrap();
        assert!(dest.join("src").join("f.txt").exists());

        assert!(copy_path(&dir.path().join("missing"), &dest).is_err());
        assert!(copy_path(&src, &src).is_err());
    }

    #[test]
    fn invalid_params_are_dispatch_errors() {
        let err = params::<PathArgs>("fs_list", json!({"nope": 1})).unwrap_err();
        assert!(err.to_string().starts_with("Invalid params for fs_list"));
    }

    #[test]
    fn drives_always_include_a_mount_point() {
        let listed = list_drives();
        let drives = listed["drives"].as_array().unwrap();
        assert!(!drives.is_empty());
        assert!(drives.iter().all(|d| d["mountPoint"].is_string()));
    }

    #[test]
    fn system_info_reports_memory() {
        let info = system_info(&MachineInfo::collect(), "1.2.3");
        assert_eq!(info["agentVersion"], "1.2.3");
        assert!(info["totalMemory"].is_u64());
        assert!(info["hostname"].as_str().is_some_and(|h| !h.is_empty()));
    }

    #[test]
    fn unknown_system_action() {
        let err = system_action(ActionArgs { action: "explode".into() }).unwrap_err();
        assert_eq!(err.to_string(), "Unknown system action: explode");
    }
}
