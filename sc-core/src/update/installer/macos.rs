//! launchd install script.

use super::{InstallLayout, InstallPlan, Platform, sh_quote};

pub fn render_script(layout: &InstallLayout, plan: &InstallPlan) -> String {
    let plist = layout
        .service_file(Platform::MacOs)
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let ui = layout
        .companion_ui
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let log_dir = layout
        .log_path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/Library/Logs".into());

    format!(
        r#"#!/bin/bash
# ScreenControl agent update
VERSION={version}
LOG={log}
PKG={pkg}
WORK={work}
TARGET={target}
PLIST={plist}
UI_APP={ui}
EXE={exe}
EXTRACT="$WORK/extract"

mkdir -p {log_dir}
log() {{ echo "[$(date '+%Y-%m-%d %H:%M:%S')] $*" >> "$LOG"; }}
start_service() {{
    launchctl load -w "$PLIST" >> "$LOG" 2>&1 || log "WARN: launchctl load returned $?"
    if [ -n "$UI_APP" ] && [ -d "$UI_APP" ]; then
        CONSOLE_UID=$(stat -f %u /dev/console)
        launchctl asuser "$CONSOLE_UID" open -a "$UI_APP" >> "$LOG" 2>&1 || log "WARN: could not start UI"
    fi
}}
fail() {{ log "ERROR: $*"; start_service; exit 1; }}

log "Starting update to version $VERSION"
sleep 2

log "Stopping service"
launchctl unload "$PLIST" >> "$LOG" 2>&1 || log "WARN: launchctl unload returned $?"
if [ -n "$UI_APP" ]; then
    pkill -f "$UI_APP" >> "$LOG" 2>&1
fi

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
    start_service
    exit 1
fi

log "Installing $NEW to $TARGET"
cp -f "$NEW" "$TARGET" >> "$LOG" 2>&1 || fail "copy failed"
chmod 755 "$TARGET"
chown root:wheel "$TARGET"
xattr -d com.apple.quarantine "$TARGET" >> "$LOG" 2>&1

log "Starting service"
start_service

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
        plist = sh_quote(&plist),
        ui = sh_quote(&ui),
        exe = sh_quote(&layout.executable_name),
        log_dir = sh_quote(&log_dir),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_launchctl_and_wheel_ownership() {
        let s = render_script(
            &InstallLayout::for_platform(Platform::MacOs),
            &InstallPlan {
                version: "3.0.0".into(),
                package: "/Library/Caches/ScreenControl/updates/run/agent.tar.gz".into(),
                work_dir: "/Library/Caches/ScreenControl/updates/run".into(),
                script_dir: "/Library/Caches/ScreenControl/updates".into(),
            },
        );
        assert!(s.contains("PLIST='/Library/LaunchDaemons/com.screencontrol.agent.plist'"));
        assert!(s.contains("LOG='/Library/Logs/ScreenControl/update.log'"));
        assert!(s.contains("UI_APP='/Applications/ScreenControl.app'"));
        assert!(s.contains("chown root:wheel \"$TARGET\""));
        let unload = s.find("launchctl unload").unwrap();
        let copy = s.find("cp -f").unwrap();
        assert!(unload < copy);
        assert!(s.contains("VERSION='3.0.0'"));
    }

    #[test]
    fn version_cannot_break_out_of_quotes() {
        let s = render_script(
            &InstallLayout::for_platform(Platform::MacOs),
            &InstallPlan {
                version: r#"9.0.0"; touch /tmp/pwned; echo ""#.into(),
                package: "/tmp/run/agent.tar.gz".into(),
                work_dir: "/tmp/run".into(),
                script_dir: "/tmp".into(),
            },
        );
        assert!(s.contains(r#"VERSION='9.0.0"; touch /tmp/pwned; echo "'"#));
        assert_eq!(s.matches("touch /tmp/pwned").count(), 1);
        assert!(s.contains(r#"log "Update to $VERSION complete""#));
    }
}
