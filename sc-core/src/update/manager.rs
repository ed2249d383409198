//! The update state machine.
//!
//! One `UpdateManager` per process, shared as an `Arc`. Public operations
//! are serialized by an operation lock; the state snapshot lives behind a
//! separate short-lived mutex so `state()` never waits on a download.
//!
//! Heartbeats drive automatic cycles (check, download, maybe install).
//! The dispatcher drives manual ones through the same operations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime, Utc};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::control::message::UpdateFlag;
use crate::error::ScError;
use crate::schedule::CronSchedule;
use crate::update::installer::{InstallPlan, Installer, Platform};
use crate::update::source::{ManifestQuery, UpdateSource};
use crate::update::status::{UpdateInfo, UpdateState, UpdateStatus};
use crate::update::version;

const PROGRESS_STEP: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub current_version: String,
    pub platform: Platform,
    pub arch: String,
    pub channel: String,
    /// Heartbeats between automatic checks.
    pub check_interval_heartbeats: u32,
    /// Automatic retries after a failure wait this long.
    pub failure_cooldown: Duration,
    /// Install downloaded updates without being asked. Forced updates
    /// install regardless.
    pub auto_install: bool,
    /// Local-time window for non-forced automatic installs.
    pub install_window: Option<CronSchedule>,
    pub staging_dir: PathBuf,
}

impl UpdateConfig {
    pub fn new(current_version: impl Into<String>) -> Self {
        let platform = Platform::current();
        Self {
            current_version: current_version.into(),
            platform,
            arch: std::env::consts::ARCH.to_string(),
            channel: "stable".into(),
            check_interval_heartbeats: 60,
            failure_cooldown: Duration::from_secs(600),
            auto_install: true,
            install_window: None,
            staging_dir: platform.default_staging_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    StatusChanged(UpdateStatus),
    Progress { downloaded: u64, total: u64 },
    /// The installer owns the update now; the agent must exit.
    HandedOff { version: String },
}

pub struct UpdateManager {
    config: UpdateConfig,
    source: Arc<dyn UpdateSource>,
    installer: Arc<dyn Installer>,
    state: Mutex<UpdateState>,
    heartbeats: AtomicU32,
    cancel: AtomicBool,
    cancel_notify: Notify,
    op_lock: Arc<tokio::sync::Mutex<()>>,
    events: mpsc::UnboundedSender<UpdateEvent>,
}

impl UpdateManager {
    pub fn new(
        config: UpdateConfig,
        source: Arc<dyn UpdateSource>,
        installer: Arc<dyn Installer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            state: Mutex::new(UpdateState::new(config.current_version.clone())),
            config,
            source,
            installer,
            heartbeats: AtomicU32::new(0),
            cancel: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            events,
        });
        (manager, rx)
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn state(&self) -> UpdateState {
        lock(&self.state).clone()
    }

    /// Count a heartbeat and start an automatic cycle when one is due.
    ///
    /// A cycle is due every `check_interval_heartbeats`, when the server
    /// flags an update, or once the cooldown after a failure has run out.
    /// Returns whether a cycle was started.
    pub fn on_heartbeat(self: &Arc<Self>, flag: UpdateFlag) -> bool {
        let (busy, cooling_down, retry_due) = {
            let state = lock(&self.state);
            let failed_for = (state.status == UpdateStatus::Failed)
                .then_some(state.failed_at)
                .flatten()
                .map(|at| at.elapsed());
            (
                state.status.is_busy(),
                failed_for.is_some_and(|d| d < self.config.failure_cooldown),
                failed_for.is_some_and(|d| d >= self.config.failure_cooldown),
            )
        };

        let count = self.heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.config.check_interval_heartbeats.max(1) && !flag.wants_check() && !retry_due {
            return false;
        }
        self.heartbeats.store(0, Ordering::Relaxed);

        if busy {
            debug!("update cycle skipped: busy");
            return false;
        }
        if cooling_down {
            debug!("update cycle skipped: cooling down after failure");
            return false;
        }
        if retry_due {
            debug!("failure cooldown elapsed; retrying update cycle");
        }

        let Ok(guard) = Arc::clone(&self.op_lock).try_lock_owned() else {
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.automatic_cycle(flag == UpdateFlag::Forced).await;
        });
        true
    }

    pub async fn check_for_update(&self) -> Result<UpdateStatus, ScError> {
        let _guard = self.op_lock.lock().await;
        self.check_locked().await
    }

    pub async fn download_update(&self) -> Result<PathBuf, ScError> {
        let _guard = self.op_lock.lock().await;
        self.download_locked().await
    }

    pub async fn apply_update(&self) -> Result<(), ScError> {
        let _guard = self.op_lock.lock().await;
        self.apply_locked().await
    }

    /// Start a download in the background and return immediately.
    pub fn start_download(self: &Arc<Self>) -> Result<(), ScError> {
        let guard = Arc::clone(&self.op_lock)
            .try_lock_owned()
            .map_err(|_| ScError::InvalidState("an update operation is already running".into()))?;
        if lock(&self.state).available.is_none() {
            return Err(ScError::InvalidState("no update available".into()));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let _ = this.download_locked().await;
        });
        Ok(())
    }

    /// Start the install hand-off in the background.
    pub fn start_apply(self: &Arc<Self>) -> Result<(), ScError> {
        let guard = Arc::clone(&self.op_lock)
            .try_lock_owned()
            .map_err(|_| ScError::InvalidState("an update operation is already running".into()))?;
        let status = lock(&self.state).status;
        if status != UpdateStatus::Downloaded {
            return Err(ScError::InvalidState(format!("cannot install from {status}")));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let _ = this.apply_locked().await;
        });
        Ok(())
    }

    /// Ask a running download to stop. The worker moves to `Idle` at the
    /// next chunk boundary.
    pub fn cancel_download(&self) -> bool {
        if lock(&self.state).status != UpdateStatus::Downloading {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        true
    }

    pub fn install_window_open(&self, now: NaiveDateTime) -> bool {
        self.config
            .install_window
            .as_ref()
            .is_none_or(|window| window.matches(&now))
    }

    // ── Workers (op_lock held) ───────────────────────────────────

    async fn automatic_cycle(&self, forced_flag: bool) {
        if self.check_locked().await.is_err() {
            return;
        }
        let (status, info) = {
            let state = lock(&self.state);
            (state.status, state.available.clone())
        };
        let Some(info) = info else {
            return;
        };
        match status {
            UpdateStatus::Available => {
                if self.download_locked().await.is_err() {
                    return;
                }
            }
            UpdateStatus::Downloaded => {}
            _ => return,
        }

        let forced = forced_flag || info.forced;
        if !forced && !self.config.auto_install {
            info!(version = %info.version, "update downloaded; automatic install disabled");
            return;
        }
        if !forced && !self.install_window_open(Local::now().naive_local()) {
            info!(version = %info.version, "update downloaded; outside install window");
            return;
        }
        let _ = self.apply_locked().await;
    }

    async fn check_locked(&self) -> Result<UpdateStatus, ScError> {
        self.set_status(UpdateStatus::Checking);
        let query = ManifestQuery {
            platform: self.config.platform.as_str().into(),
            arch: self.config.arch.clone(),
            channel: self.config.channel.clone(),
            current_version: self.config.current_version.clone(),
        };

        let manifest = match self.source.fetch_manifest(&query).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        if let Some(m) = manifest.as_ref().filter(|m| !version::is_valid(&m.version)) {
            {
                let mut state = lock(&self.state);
                state.last_check = Some(Utc::now());
                state.available = None;
                state.downloaded_path = None;
            }
            let err = ScError::Verification(format!("invalid version in manifest: {:?}", m.version));
            self.fail(&err);
            return Err(err);
        }

        let next = {
            let mut state = lock(&self.state);
            state.last_check = Some(Utc::now());
            state.last_error = None;
            match manifest.filter(|m| version::is_newer(&m.version, &self.config.current_version)) {
                Some(info) => {
                    let already_downloaded = state
                        .available
                        .as_ref()
                        .is_some_and(|a| a.version == info.version && a.sha256 == info.sha256)
                        && state.downloaded_path.as_deref().is_some_and(Path::is_file);
                    info!(version = %info.version, forced = info.forced, "update available");
                    state.available = Some(info);
                    if already_downloaded {
                        UpdateStatus::Downloaded
                    } else {
                        state.downloaded_path = None;
                        UpdateStatus::Available
                    }
                }
                None => {
                    state.available = None;
                    UpdateStatus::UpToDate
                }
            }
        };
        self.set_status(next);
        Ok(next)
    }

    async fn download_locked(&self) -> Result<PathBuf, ScError> {
        let info = {
            let state = lock(&self.state);
            if state.status == UpdateStatus::Downloaded {
                if let Some(path) = state.downloaded_path.as_ref().filter(|p| p.is_file()) {
                    return Ok(path.clone());
                }
            }
            state
                .available
                .clone()
                .ok_or_else(|| ScError::InvalidState("no update available".into()))?
        };

        self.cancel.store(false, Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            state.downloaded_bytes = 0;
            state.total_bytes = info.size;
            state.downloaded_path = None;
        }
        self.set_status(UpdateStatus::Downloading);

        let run_dir = self.config.staging_dir.join(format!(
            "{}-{}",
            version::sanitize(&info.version),
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        match self.fetch_package(&info, &run_dir).await {
            Ok(path) => {
                info!(path = %path.display(), "update package verified");
                lock(&self.state).downloaded_path = Some(path.clone());
                self.set_status(UpdateStatus::Downloaded);
                Ok(path)
            }
            Err(ScError::Cancelled) => {
                remove_run_dir(&run_dir).await;
                info!("update download cancelled");
                {
                    let mut state = lock(&self.state);
                    state.downloaded_bytes = 0;
                }
                self.set_status(UpdateStatus::Idle);
                Err(ScError::Cancelled)
            }
            Err(e) => {
                remove_run_dir(&run_dir).await;
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn fetch_package(&self, info: &UpdateInfo, run_dir: &Path) -> Result<PathBuf, ScError> {
        tokio::fs::create_dir_all(run_dir).await?;
        let name = Path::new(&info.filename)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "update.pkg".into());
        let path = run_dir.join(name);
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = self.source.open_package(info).await?;

        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut reported = 0u64;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(ScError::Cancelled);
            }
            let chunk = tokio::select! {
                _ = self.cancel_notify.notified() => continue,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            lock(&self.state).downloaded_bytes = downloaded;
            if downloaded - reported >= PROGRESS_STEP {
                reported = downloaded;
                let _ = self.events.send(UpdateEvent::Progress {
                    downloaded,
                    total: info.size,
                });
            }
        }
        file.flush().await?;
        drop(file);
        let _ = self.events.send(UpdateEvent::Progress {
            downloaded,
            total: info.size,
        });

        if info.size > 0 && downloaded != info.size {
            return Err(ScError::Verification(format!(
                "size mismatch: expected {} bytes, got {downloaded}",
                info.size
            )));
        }
        let digest = hex::encode(hasher.finalize());
        if !digest.eq_ignore_ascii_case(info.sha256.trim()) {
            return Err(ScError::Verification(format!(
                "checksum mismatch: expected {}, got {digest}",
                info.sha256
            )));
        }
        Ok(path)
    }

    async fn apply_locked(&self) -> Result<(), ScError> {
        let (info, package) = {
            let state = lock(&self.state);
            match (state.status, &state.available, &state.downloaded_path) {
                (UpdateStatus::Downloaded, Some(info), Some(path)) => (info.clone(), path.clone()),
                (status, ..) => {
                    return Err(ScError::InvalidState(format!("cannot install from {status}")));
                }
            }
        };
        let work_dir = package
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.staging_dir.clone());
        let plan = InstallPlan {
            version: info.version.clone(),
            package,
            work_dir,
            script_dir: self.config.staging_dir.clone(),
        };

        self.set_status(UpdateStatus::Installing);
        let installer = Arc::clone(&self.installer);
        let result = tokio::task::spawn_blocking(move || installer.install(&plan))
            .await
            .map_err(|e| ScError::Installation(format!("installer task failed: {e}")))
            .and_then(|r| r);

        match result {
            Ok(()) => {
                info!(version = %info.version, "update handed off to installer");
                let _ = self.events.send(UpdateEvent::HandedOff {
                    version: info.version,
                });
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn set_status(&self, status: UpdateStatus) {
        let previous = std::mem::replace(&mut lock(&self.state).status, status);
        if previous != status {
            info!(from = %previous, to = %status, "update status");
            let _ = self.events.send(UpdateEvent::StatusChanged(status));
        }
    }

    fn fail(&self, err: &ScError) {
        {
            let mut state = lock(&self.state);
            state.last_error = Some(err.to_string());
            state.failed_at = Some(Instant::now());
        }
        warn!("update failed: {err}");
        self.set_status(UpdateStatus::Failed);
    }
}

async fn remove_run_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), "cannot remove download dir: {e}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::source::PackageStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::atomic::AtomicUsize;

    struct FakeSource {
        manifest: Result<Option<UpdateInfo>, &'static str>,
        chunks: Vec<&'static [u8]>,
        stall: bool,
    }

    #[async_trait]
    impl UpdateSource for FakeSource {
        async fn fetch_manifest(&self, _: &ManifestQuery) -> Result<Option<UpdateInfo>, ScError> {
            self.manifest.clone().map_err(|e| ScError::Transport(e.into()))
        }

        async fn open_package(&self, _: &UpdateInfo) -> Result<PackageStream, ScError> {
            let body = stream::iter(
                self.chunks
                    .iter()
                    .map(|c| Ok::<_, ScError>(Bytes::from_static(*c)))
                    .collect::<Vec<_>>(),
            );
            if self.stall {
                Ok(Box::pin(body.chain(stream::pending())))
            } else {
                Ok(Box::pin(body))
            }
        }
    }

    #[derive(Default)]
    struct CountingInstaller(AtomicUsize);

    impl Installer for CountingInstaller {
        fn install(&self, plan: &InstallPlan) -> Result<(), ScError> {
            assert!(plan.package.is_file());
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const BODY: &[u8] = b"new agent build";

    fn info(sha256: String) -> UpdateInfo {
        UpdateInfo {
            version: "2.0.0".into(),
            channel: "stable".into(),
            size: BODY.len() as u64,
            sha256,
            filename: "agent.tar.gz".into(),
            release_notes: None,
            download_url: "/downloads/agent.tar.gz".into(),
            forced: false,
        }
    }

    fn good_info() -> UpdateInfo {
        info(hex::encode(Sha256::digest(BODY)))
    }

    fn setup(
        source: FakeSource,
        tweak: impl FnOnce(&mut UpdateConfig),
    ) -> (
        Arc<UpdateManager>,
        mpsc::UnboundedReceiver<UpdateEvent>,
        Arc<CountingInstaller>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UpdateConfig::new("1.0.0");
        config.staging_dir = dir.path().join("staging");
        tweak(&mut config);
        let installer = Arc::new(CountingInstaller::default());
        let (manager, rx) = UpdateManager::new(config, Arc::new(source), installer.clone());
        (manager, rx, installer, dir)
    }

    fn source(manifest: Option<UpdateInfo>) -> FakeSource {
        FakeSource {
            manifest: Ok(manifest),
            chunks: vec![&BODY[..4], &BODY[4..]],
            stall: false,
        }
    }

    async fn wait_for(manager: &UpdateManager, status: UpdateStatus) {
        for _ in 0..200 {
            if manager.state().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {status}; state: {:?}", manager.state());
    }

    #[tokio::test]
    async fn check_reports_available_or_up_to_date() {
        let (m, ..) = setup(source(Some(good_info())), |_| {});
        assert_eq!(m.check_for_update().await.unwrap(), UpdateStatus::Available);
        assert!(m.state().last_check.is_some());

        let mut same = good_info();
        same.version = "1.0.0".into();
        let (m, ..) = setup(source(Some(same)), |_| {});
        assert_eq!(m.check_for_update().await.unwrap(), UpdateStatus::UpToDate);

        let (m, ..) = setup(source(None), |_| {});
        assert_eq!(m.check_for_update().await.unwrap(), UpdateStatus::UpToDate);
    }

    #[tokio::test]
    async fn check_failure_records_time() {
        let (m, ..) = setup(
            FakeSource {
                manifest: Err("unreachable"),
                chunks: vec![],
                stall: false,
            },
            |_| {},
        );
        assert!(m.check_for_update().await.is_err());
        let state = m.state();
        assert_eq!(state.status, UpdateStatus::Failed);
        assert!(state.failed_at.is_some());
        assert!(state.last_error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn download_verifies_and_keeps_package() {
        let (m, ..) = setup(source(Some(good_info())), |_| {});
        m.check_for_update().await.unwrap();
        let path = m.download_update().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        let state = m.state();
        assert_eq!(state.status, UpdateStatus::Downloaded);
        assert_eq!(state.progress_percent(), Some(100));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_removes_package() {
        let (m, mut rx, installer, dir) = setup(source(Some(info("00".repeat(32)))), |_| {});
        m.check_for_update().await.unwrap();
        let err = m.download_update().await.unwrap_err();
        assert!(matches!(err, ScError::Verification(_)));
        assert_eq!(m.state().status, UpdateStatus::Failed);
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
        assert!(m.apply_update().await.is_err());
        assert_eq!(installer.0.load(Ordering::SeqCst), 0);
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event, UpdateEvent::StatusChanged(UpdateStatus::Installing));
        }
    }

    #[tokio::test]
    async fn cancel_returns_to_idle() {
        let (m, _rx, _installer, dir) = setup(
            FakeSource {
                manifest: Ok(Some(good_info())),
                chunks: vec![&BODY[..4]],
                stall: true,
            },
            |_| {},
        );
        m.check_for_update().await.unwrap();
        m.start_download().unwrap();
        wait_for(&m, UpdateStatus::Downloading).await;
        assert!(m.cancel_download());
        wait_for(&m, UpdateStatus::Idle).await;
        assert!(!m.cancel_download());
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
        // The operation lock was released by the worker.
        assert!(m.start_download().is_ok());
    }

    #[tokio::test]
    async fn heartbeat_interval_triggers_check() {
        let (m, ..) = setup(source(None), |c| c.check_interval_heartbeats = 3);
        assert!(!m.on_heartbeat(UpdateFlag::None));
        assert!(!m.on_heartbeat(UpdateFlag::None));
        assert!(m.on_heartbeat(UpdateFlag::None));
        wait_for(&m, UpdateStatus::UpToDate).await;
    }

    #[tokio::test]
    async fn failure_cooldown_blocks_automatic_retry() {
        let (m, ..) = setup(
            FakeSource {
                manifest: Err("down"),
                chunks: vec![],
                stall: false,
            },
            |_| {},
        );
        let _ = m.check_for_update().await;
        assert!(!m.on_heartbeat(UpdateFlag::Available));
        // Manual checks are not gated.
        assert!(m.check_for_update().await.is_err());
    }

    #[tokio::test]
    async fn retry_starts_once_cooldown_elapses() {
        let (m, ..) = setup(
            FakeSource {
                manifest: Err("down"),
                chunks: vec![],
                stall: false,
            },
            |c| {
                c.check_interval_heartbeats = 1000;
                c.failure_cooldown = Duration::from_millis(20);
            },
        );
        let _ = m.check_for_update().await;
        let first = m.state().failed_at.unwrap();
        assert!(!m.on_heartbeat(UpdateFlag::None));

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Far from the heartbeat interval, but the cooldown is over.
        assert!(m.on_heartbeat(UpdateFlag::None));
        for _ in 0..200 {
            if m.state().failed_at.is_some_and(|at| at > first) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("retry never ran; state: {:?}", m.state());
    }

    #[tokio::test]
    async fn manifest_with_shell_payload_in_version_fails() {
        let mut hostile = good_info();
        hostile.version = r#"9.0.0"; touch /tmp/pwned; echo ""#.into();
        assert!(version::is_newer(&hostile.version, "1.0.0"));

        let (m, _rx, installer, dir) = setup(source(Some(hostile)), |_| {});
        let err = m.check_for_update().await.unwrap_err();
        assert!(matches!(err, ScError::Verification(_)));
        let state = m.state();
        assert_eq!(state.status, UpdateStatus::Failed);
        assert!(state.available.is_none());
        assert!(state.last_error.unwrap().contains("invalid version"));

        assert!(m.download_update().await.is_err());
        assert!(m.apply_update().await.is_err());
        assert_eq!(installer.0.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn forced_flag_overrides_auto_install() {
        let (m, mut rx, installer, _dir) = setup(source(Some(good_info())), |c| c.auto_install = false);
        assert!(m.on_heartbeat(UpdateFlag::Forced));
        wait_for(&m, UpdateStatus::Installing).await;
        let mut handed_off = false;
        while let Some(event) = rx.recv().await {
            if let UpdateEvent::HandedOff { version } = event {
                assert_eq!(version, "2.0.0");
                handed_off = true;
                break;
            }
        }
        assert!(handed_off);
        assert_eq!(installer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_install_disabled_stops_at_downloaded() {
        let (m, _rx, installer, _dir) = setup(source(Some(good_info())), |c| c.auto_install = false);
        assert!(m.on_heartbeat(UpdateFlag::Available));
        wait_for(&m, UpdateStatus::Downloaded).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(m.state().status, UpdateStatus::Downloaded);
        assert_eq!(installer.0.load(Ordering::SeqCst), 0);

        // A later check keeps the verified package instead of downloading again.
        assert_eq!(m.check_for_update().await.unwrap(), UpdateStatus::Downloaded);
        m.apply_update().await.unwrap();
        assert_eq!(installer.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_window() {
        let (m, ..) = setup(source(None), |c| {
            c.install_window = Some(CronSchedule::parse("* 2-4 * * *").unwrap())
        });
        let at = |h, min| {
            chrono::NaiveDate::from_ymd_opt(2026, 10, 19)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap()
        };
        assert!(m.install_window_open(at(3, 15)));
        assert!(!m.install_window_open(at(12, 0)));
    }
}
