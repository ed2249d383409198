//! Batch install script for the Windows service.

use super::{InstallLayout, InstallPlan};

pub fn render_script(layout: &InstallLayout, plan: &InstallPlan) -> String {
    let log_dir = layout
        .log_path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| r"C:\ProgramData".into());
    let ui = layout
        .companion_ui
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    // `Path::file_name` only splits on `\` when built for Windows.
    let ui_image = ui.rsplit(['\\', '/']).next().unwrap_or_default().to_string();

    let script = format!(
        r#"@echo off
setlocal
rem ScreenControl agent update
set "VERSION={version}"
set "LOG={log}"
set "PKG={pkg}"
set "WORK={work}"
set "TARGET={target}"
set "SERVICE={service}"
set "EXE={exe}"
set "UI={ui}"
set "UI_IMAGE={ui_image}"
set "EXTRACT=%WORK%\extract"

if not exist "{log_dir}" mkdir "{log_dir}"
call :log Starting update to version "%VERSION%"
ping -n 3 127.0.0.1 > nul

call :log Stopping service %SERVICE%
sc stop "%SERVICE%" >> "%LOG%" 2>&1
ping -n 6 127.0.0.1 > nul
if defined UI_IMAGE taskkill /IM "%UI_IMAGE%" /F >> "%LOG%" 2>&1

call :log Extracting %PKG%
if exist "%EXTRACT%" rmdir /s /q "%EXTRACT%"
mkdir "%EXTRACT%"
tar -xf "%PKG%" -C "%EXTRACT%" >> "%LOG%" 2>&1
if errorlevel 1 (
    call :log ERROR: extraction failed
    goto restart_fail
)

set "NEW="
if exist "%EXTRACT%\screencontrol\%EXE%" set "NEW=%EXTRACT%\screencontrol\%EXE%"
if not defined NEW if exist "%EXTRACT%\%EXE%" set "NEW=%EXTRACT%\%EXE%"
if not defined NEW goto not_found

call :log Installing %NEW% to %TARGET%
copy /y "%NEW%" "%TARGET%" >> "%LOG%" 2>&1
if errorlevel 1 (
    call :log ERROR: copy failed
    goto restart_fail
)

call :log Starting service %SERVICE%
sc start "%SERVICE%" >> "%LOG%" 2>&1
if defined UI if exist "%UI%" start "" "%UI%"

call :log Removing %WORK%
rmdir /s /q "%WORK%"
call :log Update to "%VERSION%" complete
exit /b 0

:not_found
call :log ERROR: %EXE% not found in package
call :log Contents of %EXTRACT%:
dir "%EXTRACT%" >> "%LOG%" 2>&1
if exist "%EXTRACT%\screencontrol" dir "%EXTRACT%\screencontrol" >> "%LOG%" 2>&1

:restart_fail
sc start "%SERVICE%" >> "%LOG%" 2>&1
exit /b 1

:log
echo [%date% %time%] %* >> "%LOG%"
goto :eof
"#,
        version = batch_literal(&plan.version),
        log = layout.log_path.display(),
        pkg = plan.package.display(),
        work = plan.work_dir.display(),
        target = layout.binary_path.display(),
        service = layout.service_name,
        exe = layout.executable_name,
    );
    // cmd.exe wants CRLF line endings.
    script.replace('\n', "\r\n")
}

/// Make a value inert inside `set "NAME=..."` and later `%NAME%` expansion.
fn batch_literal(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '"' | '%' | '!' | '^' | '&' | '|' | '<' | '>' | '(' | ')' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::installer::Platform;

    fn script() -> String {
        render_script(
            &InstallLayout::for_platform(Platform::Windows),
            &InstallPlan {
                version: "3.0.0".into(),
                package: r"C:\ProgramData\ScreenControl\updates\run\agent.zip".into(),
                work_dir: r"C:\ProgramData\ScreenControl\updates\run".into(),
                script_dir: r"C:\ProgramData\ScreenControl\updates".into(),
            },
        )
    }

    #[test]
    fn service_control_and_log_path() {
        let s = script();
        assert!(s.contains(r#"set "LOG=C:\ProgramData\ScreenControl\logs\update.log""#));
        assert!(s.contains(r#"sc stop "%SERVICE%""#));
        assert!(s.contains(r#"set "SERVICE=ScreenControlAgent""#));
        assert!(s.contains(r#"set "UI_IMAGE=ScreenControlTray.exe""#));
        assert!(s.contains("\r\n"));
        assert!(s.contains(r#"set "VERSION=3.0.0""#));
    }

    #[test]
    fn ui_image_from_either_separator() {
        let mut layout = InstallLayout::for_platform(Platform::Windows);
        let plan = InstallPlan {
            version: "3.0.0".into(),
            package: r"C:\u\agent.zip".into(),
            work_dir: r"C:\u".into(),
            script_dir: r"C:\u".into(),
        };
        layout.companion_ui = Some(r"D:\Tools\Tray\Tray.exe".into());
        assert!(render_script(&layout, &plan).contains(r#"set "UI_IMAGE=Tray.exe""#));
        layout.companion_ui = Some("/opt/tray/tray-bin".into());
        assert!(render_script(&layout, &plan).contains(r#"set "UI_IMAGE=tray-bin""#));
        layout.companion_ui = None;
        assert!(render_script(&layout, &plan).contains(r#"set "UI_IMAGE=""#));
    }

    #[test]
    fn version_metacharacters_are_neutralized() {
        assert_eq!(
            batch_literal(r#"9.0.0" & del /q C:\* & rem "%PATH%"#),
            r"9.0.0_ _ del /q C:\* _ rem __PATH_"
        );
        let s = render_script(
            &InstallLayout::for_platform(Platform::Windows),
            &InstallPlan {
                version: r#"9.0.0" & calc & ""#.into(),
                package: r"C:\u\agent.zip".into(),
                work_dir: r"C:\u".into(),
                script_dir: r"C:\u".into(),
            },
        );
        assert!(s.contains(r#"set "VERSION=9.0.0_ _ calc _ _""#));
        assert!(!s.contains("& calc"));
    }

    #[test]
    fn nested_before_flat_then_listing() {
        let s = script();
        let nested = s.find(r"%EXTRACT%\screencontrol\%EXE%").unwrap();
        let flat = s.find(r#"if not defined NEW if exist "%EXTRACT%\%EXE%""#).unwrap();
        assert!(nested < flat);
        assert!(s.contains(":not_found"));
        assert!(s.contains("exit /b 1"));
    }
}
