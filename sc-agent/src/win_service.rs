//! Running the agent under the Windows Service Control Manager.
//!
//! `--install` registers `ScreenControlAgent` as an auto-start LocalSystem
//! service that the SCM restarts after a crash. `--service` is the entry
//! the SCM launches: it reports START_PENDING, runs [`AgentService`] on a
//! tokio runtime and maps STOP / SHUTDOWN controls onto its running flag.

#![cfg(target_os = "windows")]

use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use windows::Win32::Foundation::{ERROR_CALL_NOT_IMPLEMENTED, ERROR_SERVICE_SPECIFIC_ERROR, NO_ERROR};
use windows::Win32::System::Services::*;
use windows::core::{PCWSTR, PWSTR};

use crate::config::AgentConfig;
use crate::service::{AgentService, RunOutcome};

/// Must match `InstallLayout::service_name` for Windows; the install
/// script stops and starts the service by this name.
const SERVICE_NAME: &str = "ScreenControlAgent";
const DISPLAY_NAME: &str = "ScreenControl Agent";
const DESCRIPTION: &str = "Remote management, screen streaming and self-update agent for ScreenControl";

/// Restart delays after the first, second and later crashes.
const RESTART_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(120),
];
/// Crash counter reset period.
const FAILURE_RESET: Duration = Duration::from_secs(24 * 3600);
const UNINSTALL_STOP_WAIT: Duration = Duration::from_secs(15);

// The SCM calls back through plain function pointers, so per-process
// service state has to live in statics.
static CONFIG: OnceLock<AgentConfig> = OnceLock::new();
static RUNNING: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static REPORTER: OnceLock<StatusReporter> = OnceLock::new();

/// NUL-terminated UTF-16 for the W APIs.
fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// `"<exe>" --service --config "<config>"`
fn service_command_line(exe: &Path, config: &Path) -> String {
    format!("\"{}\" --service --config \"{}\"", exe.display(), config.display())
}

// ── Handles ──────────────────────────────────────────────────────

/// Owned SCM or service handle, closed on drop.
struct ScHandle(SC_HANDLE);

impl ScHandle {
    fn manager(access: u32) -> windows::core::Result<Self> {
        // SAFETY: null machine and database names select the local SCM.
        unsafe { OpenSCManagerW(None, None, access) }.map(Self)
    }

    fn open_service(&self, access: u32) -> windows::core::Result<Self> {
        let name = wide(SERVICE_NAME);
        // SAFETY: `name` outlives the call; self.0 is a live SCM handle.
        unsafe { OpenServiceW(self.0, PCWSTR(name.as_ptr()), access) }.map(Self)
    }

    fn query_state(&self) -> Option<SERVICE_STATUS_CURRENT_STATE> {
        let mut status = SERVICE_STATUS::default();
        // SAFETY: out-pointer valid for the call.
        unsafe { QueryServiceStatus(self.0, &mut status) }
            .ok()
            .map(|()| status.dwCurrentState)
    }
}

impl Drop for ScHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by the SCM and is closed once.
        let _ = unsafe { CloseServiceHandle(self.0) };
    }
}

// ── Install / uninstall ──────────────────────────────────────────

/// Register the service. It is started with `--service --config <config>`.
pub fn install_service(config: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let exe = std::env::current_exe()?;
    let config = std::fs::canonicalize(config).unwrap_or_else(|_| config.to_path_buf());
    let command_line = wide(&service_command_line(&exe, &config));
    let name = wide(SERVICE_NAME);
    let display = wide(DISPLAY_NAME);

    let scm = ScHandle::manager(SC_MANAGER_CREATE_SERVICE)?;
    // SAFETY: every string pointer refers to a live NUL-terminated buffer.
    let service = unsafe {
        CreateServiceW(
            scm.0,
            PCWSTR(name.as_ptr()),
            PCWSTR(display.as_ptr()),
            SERVICE_ALL_ACCESS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_AUTO_START,
            SERVICE_ERROR_NORMAL,
            PCWSTR(command_line.as_ptr()),
            None,
            None,
            None,
            None,
            None,
        )
    }
    .map(ScHandle)
    .map_err(|e| format!("CreateService failed: {e}"))?;

    if let Err(e) = describe(&service) {
        warn!("cannot set service description: {e}");
    }
    if let Err(e) = restart_on_failure(&service) {
        warn!("cannot set service recovery actions: {e}");
    }
    info!(command = %exe.display(), "service installed");
    Ok(())
}

fn describe(service: &ScHandle) -> windows::core::Result<()> {
    let mut text = wide(DESCRIPTION);
    let desc = SERVICE_DESCRIPTIONW {
        lpDescription: PWSTR(text.as_mut_ptr()),
    };
    // SAFETY: `desc` and `text` outlive the call.
    unsafe {
        ChangeServiceConfig2W(
            service.0,
            SERVICE_CONFIG_DESCRIPTION,
            Some(&desc as *const _ as *const c_void),
        )
    }
}

/// Let the SCM bring the agent back after a crash.
fn restart_on_failure(service: &ScHandle) -> windows::core::Result<()> {
    let mut actions = RESTART_DELAYS.map(|delay| SC_ACTION {
        Type: SC_ACTION_RESTART,
        Delay: delay.as_millis() as u32,
    });
    let failure = SERVICE_FAILURE_ACTIONSW {
        dwResetPeriod: FAILURE_RESET.as_secs() as u32,
        lpRebootMsg: PWSTR::null(),
        lpCommand: PWSTR::null(),
        cActions: actions.len() as u32,
        lpsaActions: actions.as_mut_ptr(),
    };
    // SAFETY: `failure` and `actions` outlive the call.
    unsafe {
        ChangeServiceConfig2W(
            service.0,
            SERVICE_CONFIG_FAILURE_ACTIONS,
            Some(&failure as *const _ as *const c_void),
        )
    }
}

/// Stop the service if it runs, wait for it to exit, then delete it.
pub fn uninstall_service() -> Result<(), Box<dyn std::error::Error>> {
    let scm = ScHandle::manager(SC_MANAGER_CONNECT)?;
    let service = scm
        .open_service(SERVICE_ALL_ACCESS)
        .map_err(|e| format!("OpenService failed: {e}"))?;

    let mut status = SERVICE_STATUS::default();
    // SAFETY: out-pointer valid for the call. Fails harmlessly when stopped.
    if unsafe { ControlService(service.0, SERVICE_CONTROL_STOP, &mut status) }.is_ok() {
        let deadline = Instant::now() + UNINSTALL_STOP_WAIT;
        while service.query_state().is_some_and(|s| s != SERVICE_STOPPED) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    // SAFETY: live service handle opened with full access.
    unsafe { DeleteService(service.0) }.map_err(|e| format!("DeleteService failed: {e}"))?;
    info!("service uninstalled");
    Ok(())
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Hand the process to the SCM dispatcher. Blocks until the service stops.
pub fn run_as_windows_service(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let _ = CONFIG.set(config);
    let mut name = wide(SERVICE_NAME);
    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: PWSTR(name.as_mut_ptr()),
            lpServiceProc: Some(service_main),
        },
        SERVICE_TABLE_ENTRYW::default(),
    ];
    // SAFETY: the table is NUL-entry terminated and outlives the dispatcher.
    unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) }
        .map_err(|e| format!("StartServiceCtrlDispatcher failed: {e}"))?;
    Ok(())
}

/// Status updates for the SCM, with the checkpoint counter it expects
/// during pending states.
struct StatusReporter {
    handle: SERVICE_STATUS_HANDLE,
    checkpoint: AtomicU32,
}

// SAFETY: SetServiceStatus may be called from any thread with this handle.
unsafe impl Send for StatusReporter {}
unsafe impl Sync for StatusReporter {}

impl StatusReporter {
    fn pending(&self, state: SERVICE_STATUS_CURRENT_STATE, wait_hint: Duration) {
        let checkpoint = self.checkpoint.fetch_add(1, Ordering::Relaxed) + 1;
        self.set(state, 0, checkpoint, wait_hint);
    }

    fn running(&self) {
        self.checkpoint.store(0, Ordering::Relaxed);
        self.set(SERVICE_RUNNING, SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN, 0, Duration::ZERO);
    }

    /// `exit_code` 0 is a clean stop; anything else is reported as a
    /// service-specific error.
    fn stopped(&self, exit_code: u32) {
        let win32 = if exit_code == 0 { NO_ERROR.0 } else { ERROR_SERVICE_SPECIFIC_ERROR.0 };
        let status = SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: SERVICE_STOPPED,
            dwControlsAccepted: 0,
            dwWin32ExitCode: win32,
            dwServiceSpecificExitCode: exit_code,
            dwCheckPoint: 0,
            dwWaitHint: 0,
        };
        // SAFETY: handle from RegisterServiceCtrlHandlerExW.
        let _ = unsafe { SetServiceStatus(self.handle, &status) };
    }

    fn set(
        &self,
        state: SERVICE_STATUS_CURRENT_STATE,
        accepted: u32,
        checkpoint: u32,
        wait_hint: Duration,
    ) {
        let status = SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: state,
            dwControlsAccepted: accepted,
            dwWin32ExitCode: NO_ERROR.0,
            dwServiceSpecificExitCode: 0,
            dwCheckPoint: checkpoint,
            dwWaitHint: wait_hint.as_millis() as u32,
        };
        // SAFETY: handle from RegisterServiceCtrlHandlerExW.
        let _ = unsafe { SetServiceStatus(self.handle, &status) };
    }
}

unsafe extern "system" fn service_main(_argc: u32, _argv: *mut PWSTR) {
    let name = wide(SERVICE_NAME);
    // SAFETY: `name` outlives the call; the handler is a 'static fn.
    let handle = match unsafe {
        RegisterServiceCtrlHandlerExW(PCWSTR(name.as_ptr()), Some(on_control), None)
    } {
        Ok(handle) => handle,
        Err(e) => {
            error!("RegisterServiceCtrlHandlerEx failed: {e}");
            return;
        }
    };
    let reporter = REPORTER.get_or_init(|| StatusReporter {
        handle,
        checkpoint: AtomicU32::new(0),
    });
    reporter.pending(SERVICE_START_PENDING, Duration::from_secs(5));

    let service = AgentService::new(CONFIG.get().cloned().unwrap_or_default());
    let _ = RUNNING.set(service.stop_handle());

    let exit_code = match tokio::runtime::Runtime::new() {
        Ok(runtime) => {
            reporter.running();
            runtime.block_on(async {
                match service.run().await {
                    Ok(RunOutcome::Stopped) => 0,
                    Ok(RunOutcome::UpdateHandedOff { version }) => {
                        info!(%version, "service exiting for update");
                        0
                    }
                    Err(e) => {
                        error!("agent stopped with error: {e}");
                        1
                    }
                }
            })
        }
        Err(e) => {
            error!("cannot start tokio runtime: {e}");
            2
        }
    };
    reporter.stopped(exit_code);
}

unsafe extern "system" fn on_control(
    control: u32,
    _event_type: u32,
    _event_data: *mut c_void,
    _context: *mut c_void,
) -> u32 {
    match control {
        SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
            if let Some(reporter) = REPORTER.get() {
                reporter.pending(SERVICE_STOP_PENDING, Duration::from_secs(10));
            }
            if let Some(running) = RUNNING.get() {
                running.store(false, Ordering::SeqCst);
            }
            NO_ERROR.0
        }
        SERVICE_CONTROL_INTERROGATE => NO_ERROR.0,
        _ => ERROR_CALL_NOT_IMPLEMENTED.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_strings_are_nul_terminated() {
        assert_eq!(wide("Sc"), vec![b'S' as u16, b'c' as u16, 0]);
        assert_eq!(wide(""), vec![0]);
    }

    #[test]
    fn command_line_quotes_paths() {
        let line = service_command_line(
            Path::new(r"C:\Program Files\ScreenControl\agent.exe"),
            Path::new(r"C:\ProgramData\ScreenControl\agent.toml"),
        );
        assert_eq!(
            line,
            r#""C:\Program Files\ScreenControl\agent.exe" --service --config "C:\ProgramData\ScreenControl\agent.toml""#
        );
    }

    #[test]
    fn restart_delays_escalate() {
        assert!(RESTART_DELAYS.windows(2).all(|w| w[0] < w[1]));
        assert!(FAILURE_RESET > RESTART_DELAYS[2]);
    }
}
