//! systemd install script.

use super::{InstallLayout, InstallPlan, sh_quote};

pub fn render_script(layout: &InstallLayout, plan: &InstallPlan) -> String {
    let log_dir = layout
        .log_path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/var/log".into());

    format!(
        r#"#!/bin/bash
# ScreenControl agent update
VERSION={version}
LOG={log}
PKG={pkg}
WORK={work}
TARGET={target}
SERVICE={service}
EXE={exe}
EXTRACT="$WORK/extract"

mkdir -p {log_dir}
log() {{ echo "[$(date '+%Y-%m-%d %H:%M:%S')] $*" >> "$LOG"; }}
fail() {{ log "ERROR: $*"; systemctl start "$SERVICE" >> "$LOG" 2>&1; exit 1; }}

log "Starting update to version $VERSION"
sleep 2

log "Stopping service $SERVICE"
systemctl stop "$SERVICE" >> "$LOG" 2>&1 || log "WARN: systemctl stop returned $?"

log "Extracting $PKG"
rm -rf "$EXTRACT"
mkdir -p "$EXTRACT" || fail "cannot create $EXTRACT"
tar -xzf "$PKG" -C "$EXTRACT" >> "$LOG" 2>&1 || fail "extraction failed"

if [ -f "$EXTRACT/screencontrol/$EXE" ]; then
    NEW="$EXTRACT/screencontrol/$EXE"
elif [ -f "$EXTRACT/$EXE" ]; then
    NEW="$EXTRACT/$EXE"
else
    log "ERROR: $EXE not found in package"
    log "Contents of $EXTRACT:"
    ls -la "$EXTRACT" >> "$LOG" 2>&1
    if [ -d "$EXTRACT/screencontrol" ]; then
        log "Contents of $EXTRACT/screencontrol:"
        ls -la "$EXTRACT/screencontrol" >> "$LOG" 2>&1
    fi
    systemctl start "$SERVICE" >> "$LOG" 2>&1
    exit 1
fi

log "Installing $NEW to $TARGET"
cp -f "$NEW" "$TARGET" >> "$LOG" 2>&1 || fail "copy failed"
chmod 755 "$TARGET"
chown root:root "$TARGET"

log "Starting service $SERVICE"
systemctl start "$SERVICE" >> "$LOG" 2>&1 || log "WARN: systemctl start returned $?"

log "Removing $WORK"
rm -rf "$WORK"
log "Update to $VERSION complete"
exit 0
"#,
        version = sh_quote(&plan.version),
        log = sh_quote(&layout.log_path.display().to_string()),
        pkg = sh_quote(&plan.package.display().to_string()),
        work = sh_quote(&plan.work_dir.display().to_string()),
        target = sh_quote(&layout.binary_path.display().to_string()),
        service = sh_quote(&layout.service_name),
        exe = sh_quote(&layout.executable_name),
        log_dir = sh_quote(&log_dir),
    )
}
