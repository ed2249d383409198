//! Screen capture capability.
//!
//! The streaming engine only talks to [`CaptureBackend`] and
//! [`ScreenCapture`]. Windows gets a DXGI Desktop Duplication backend;
//! everywhere else [`HeadlessBackend`] reports whether a graphical session
//! exists but cannot capture it.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

use crate::error::ScError;
use crate::stream::types::{DisplayInfo, RawScreenFrame};

// ── Traits ───────────────────────────────────────────────────────

/// An open capture of one display. Owned by a single capture thread.
pub trait ScreenCapture: Send {
    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` means no new frame arrived in time.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawScreenFrame>, ScError>;
}

/// Factory for [`ScreenCapture`]s plus display discovery.
pub trait CaptureBackend: Send + Sync {
    fn displays(&self) -> Vec<DisplayInfo>;

    /// Whether the process may capture the screen at all.
    fn has_permission(&self) -> bool;

    /// Open `display_id`. Called on the thread that will own the capture.
    fn open(&self, display_id: u32, capture_cursor: bool) -> Result<Box<dyn ScreenCapture>, ScError>;
}

/// Backend for the running platform.
pub fn platform_backend() -> Arc<dyn CaptureBackend> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(dxgi::DxgiBackend)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Arc::new(HeadlessBackend)
    }
}

// ── Headless backend ─────────────────────────────────────────────

/// Process names that indicate a running display server.
const DISPLAY_SERVERS: &[&str] = &[
    "Xorg",
    "X",
    "Xwayland",
    "gnome-shell",
    "kwin_wayland",
    "kwin_x11",
    "sway",
    "weston",
    "mutter",
    "WindowServer",
];

/// Discovery-only backend for platforms without native capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessBackend;

impl CaptureBackend for HeadlessBackend {
    fn displays(&self) -> Vec<DisplayInfo> {
        if graphical_session_present() {
            vec![DisplayInfo {
                id: 0,
                name: "Main Display".into(),
                width: 1920,
                height: 1080,
                is_primary: true,
                synthetic: true,
            }]
        } else {
            Vec::new()
        }
    }

    fn has_permission(&self) -> bool {
        false
    }

    fn open(&self, _display_id: u32, _capture_cursor: bool) -> Result<Box<dyn ScreenCapture>, ScError> {
        Err(ScError::Capability(
            "screen capture is not available on this platform".into(),
        ))
    }
}

/// Best-effort: a display-server process, else a graphical login session.
pub fn graphical_session_present() -> bool {
    display_server_running() || session_manager_reports_graphical()
}

fn is_display_server(process_name: &str) -> bool {
    let name = process_name.trim();
    let name = name.rsplit('/').next().unwrap_or(name);
    DISPLAY_SERVERS.contains(&name)
}

fn is_graphical_session_type(kind: &str) -> bool {
    matches!(kind.trim(), "x11" | "wayland" | "mir")
}

fn display_server_running() -> bool {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system
        .processes()
        .values()
        .any(|p| is_display_server(&p.name().to_string_lossy()))
}

fn session_manager_reports_graphical() -> bool {
    let run = |args: &[&str]| {
        std::process::Command::new("loginctl")
            .args(args)
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
    };
    let Some(sessions) = run(&["list-sessions", "--no-legend"]) else {
        return false;
    };
    sessions
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter_map(|id| run(&["show-session", id, "-p", "Type", "--value"]))
        .any(|kind| is_graphical_session_type(&kind))
}

// ── DXGI backend (Windows) ───────────────────────────────────────

#[cfg(target_os = "windows")]
pub mod dxgi {
    //! DXGI Desktop Duplication.
    //!
    //! 1. Create a D3D11 device and walk Device → Adapter → Output.
    //! 2. Duplicate the output and create a CPU-readable staging texture.
    //! 3. Per frame: `AcquireNextFrame`, copy to staging, map, memcpy,
    //!    unmap, release.
    //!
    //! All unsafe FFI calls are confined to this module.

    use std::time::{Duration, Instant};

    use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
    use windows::Win32::Graphics::Direct3D11::*;
    use windows::Win32::Graphics::Dxgi::Common::*;
    use windows::Win32::Graphics::Dxgi::*;
    use windows::core::Interface;

    use super::{CaptureBackend, ScreenCapture};
    use crate::error::ScError;
    use crate::stream::pointer::{self, PointerKind, PointerShape};
    use crate::stream::types::{DisplayInfo, PixelFormat, RawScreenFrame};

    fn win(what: &str) -> impl Fn(windows::core::Error) -> ScError + '_ {
        move |e| ScError::Capability(format!("{what} failed: {e}"))
    }

    fn create_device() -> Result<(ID3D11Device, ID3D11DeviceContext), ScError> {
        let mut device = None;
        let mut context = None;
        // SAFETY: out-pointers are valid for the duration of the call.
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(win("D3D11CreateDevice"))?;
        }
        let device = device.ok_or_else(|| ScError::Capability("no D3D11 device".into()))?;
        let context = context.ok_or_else(|| ScError::Capability("no D3D11 context".into()))?;
        Ok((device, context))
    }

    fn adapter(device: &ID3D11Device) -> Result<IDXGIAdapter, ScError> {
        let dxgi_device: IDXGIDevice = device.cast().map_err(win("cast to IDXGIDevice"))?;
        // SAFETY: plain COM getter on a live interface.
        unsafe { dxgi_device.GetAdapter() }.map_err(win("GetAdapter"))
    }

    pub struct DxgiBackend;

    impl CaptureBackend for DxgiBackend {
        fn displays(&self) -> Vec<DisplayInfo> {
            let Ok((device, _)) = create_device() else {
                return Vec::new();
            };
            let Ok(adapter) = adapter(&device) else {
                return Vec::new();
            };
            let mut displays = Vec::new();
            // SAFETY: EnumOutputs returns an error once the index runs past the last output.
            while let Ok(output) = unsafe { adapter.EnumOutputs(displays.len() as u32) } {
                let Ok(desc) = (unsafe { output.GetDesc() }) else {
                    break;
                };
                let r = desc.DesktopCoordinates;
                let name_len = desc.DeviceName.iter().position(|&c| c == 0).unwrap_or(desc.DeviceName.len());
                let id = displays.len() as u32;
                displays.push(DisplayInfo {
                    id,
                    name: String::from_utf16_lossy(&desc.DeviceName[..name_len]),
                    width: (r.right - r.left).max(0) as u32,
                    height: (r.bottom - r.top).max(0) as u32,
                    is_primary: r.left == 0 && r.top == 0,
                    synthetic: false,
                });
            }
            displays
        }

        fn has_permission(&self) -> bool {
            true
        }

        fn open(&self, display_id: u32, capture_cursor: bool) -> Result<Box<dyn ScreenCapture>, ScError> {
            Ok(Box::new(DxgiCapturer::new(display_id, capture_cursor)?))
        }
    }

    pub struct DxgiCapturer {
        width: u32,
        height: u32,
        context: ID3D11DeviceContext,
        duplication: IDXGIOutputDuplication,
        staging_texture: ID3D11Texture2D,
        _device: ID3D11Device,
        capture_cursor: bool,
        /// Last reported pointer position, `None` while hidden.
        pointer_at: Option<(i32, i32)>,
        pointer_shape: Option<PointerShape>,
    }

    // SAFETY: the COM objects are created on and only used from the owning
    // capture thread; the box is moved there before first use.
    unsafe impl Send for DxgiCapturer {}

    impl DxgiCapturer {
        pub fn new(output_index: u32, capture_cursor: bool) -> Result<Self, ScError> {
            let (device, context) = create_device()?;
            let adapter = adapter(&device)?;
            // SAFETY: COM calls on live interfaces; descriptors are fully initialised.
            unsafe {
                let output: IDXGIOutput = adapter
                    .EnumOutputs(output_index)
                    .map_err(|_| ScError::Capability(format!("display {output_index} not found")))?;
                let output1: IDXGIOutput1 = output.cast().map_err(win("cast to IDXGIOutput1"))?;
                let duplication = output1.DuplicateOutput(&device).map_err(win("DuplicateOutput"))?;

                let desc = duplication.GetDesc();
                let width = desc.ModeDesc.Width;
                let height = desc.ModeDesc.Height;

                let staging_desc = D3D11_TEXTURE2D_DESC {
                    Width: width,
                    Height: height,
                    MipLevels: 1,
                    ArraySize: 1,
                    Format: DXGI_FORMAT_B8G8R8A8_UNORM,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    Usage: D3D11_USAGE_STAGING,
                    BindFlags: 0,
                    CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
                    MiscFlags: 0,
                };
                let mut staging = None;
                device
                    .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                    .map_err(win("CreateTexture2D"))?;
                let staging_texture =
                    staging.ok_or_else(|| ScError::Capability("no staging texture".into()))?;

                Ok(Self {
                    width,
                    height,
                    context,
                    duplication,
                    staging_texture,
                    _device: device,
                    capture_cursor,
                    pointer_at: None,
                    pointer_shape: None,
                })
            }
        }
    }

    impl ScreenCapture for DxgiCapturer {
        fn next_frame(&mut self, timeout: Duration) -> Result<Option<RawScreenFrame>, ScError> {
            let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
            let mut resource = None;
            // SAFETY: every acquired frame is released before returning.
            unsafe {
                match self
                    .duplication
                    .AcquireNextFrame(timeout.as_millis() as u32, &mut info, &mut resource)
                {
                    Ok(()) => {}
                    Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Ok(None),
                    Err(e) => return Err(ScError::Capability(format!("AcquireNextFrame failed: {e}"))),
                }

                let texture: Result<ID3D11Texture2D, _> = match resource {
                    Some(r) => r.cast().map_err(win("cast to ID3D11Texture2D")),
                    None => Err(ScError::Capability("acquired frame has no resource".into())),
                };
                if let Ok(texture) = &texture {
                    self.context.CopyResource(&self.staging_texture, texture);
                }
                if self.capture_cursor {
                    self.track_pointer(&info);
                }
                let _ = self.duplication.ReleaseFrame();
                texture?;

                let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
                self.context
                    .Map(&self.staging_texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                    .map_err(win("Map"))?;
                let stride = mapped.RowPitch;
                let len = stride as usize * self.height as usize;
                let data = std::slice::from_raw_parts(mapped.pData as *const u8, len).to_vec();
                self.context.Unmap(&self.staging_texture, 0);

                let mut frame = RawScreenFrame {
                    width: self.width,
                    height: self.height,
                    stride,
                    format: PixelFormat::Bgra8,
                    data,
                    timestamp: Instant::now(),
                };
                if let (Some((x, y)), Some(shape)) = (self.pointer_at, &self.pointer_shape) {
                    pointer::composite(&mut frame, shape, x, y);
                }
                Ok(Some(frame))
            }
        }
    }

    impl DxgiCapturer {
        /// Pick up pointer moves and shape changes from an acquired frame.
        /// Must run before the frame is released.
        fn track_pointer(&mut self, info: &DXGI_OUTDUPL_FRAME_INFO) {
            if info.LastMouseUpdateTime != 0 {
                let pos = info.PointerPosition;
                self.pointer_at = pos.Visible.as_bool().then_some((pos.Position.x, pos.Position.y));
            }
            if info.PointerShapeBufferSize == 0 {
                return;
            }
            let mut buffer = vec![0u8; info.PointerShapeBufferSize as usize];
            let mut required = 0u32;
            let mut shape = DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();
            // SAFETY: the buffer is exactly the size the frame info reported.
            let fetched = unsafe {
                self.duplication.GetFramePointerShape(
                    buffer.len() as u32,
                    buffer.as_mut_ptr().cast(),
                    &mut required,
                    &mut shape,
                )
            };
            if fetched.is_err() {
                return;
            }
            let kind = match shape.Type {
                t if t == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MONOCHROME.0 as u32 => PointerKind::Monochrome,
                t if t == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MASKED_COLOR.0 as u32 => PointerKind::MaskedColor,
                _ => PointerKind::Color,
            };
            let height = match kind {
                PointerKind::Monochrome => shape.Height / 2,
                _ => shape.Height,
            };
            self.pointer_shape = Some(PointerShape {
                kind,
                width: shape.Width,
                height,
                pitch: shape.Pitch,
                data: buffer,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_display_server_names() {
        assert!(is_display_server("Xorg\n"));
        assert!(is_display_server("/usr/bin/Xwayland"));
        assert!(is_display_server("gnome-shell"));
        assert!(!is_display_server("sshd"));
        assert!(!is_display_server("Xorg-helper"));
    }

    #[test]
    fn recognises_graphical_session_types() {
        assert!(is_graphical_session_type("wayland\n"));
        assert!(is_graphical_session_type("x11"));
        assert!(!is_graphical_session_type("tty"));
        assert!(!is_graphical_session_type("unspecified"));
    }

    #[test]
    fn process_scan_completes() {
        // No display server is required; the scan itself must not fail.
        let _ = display_server_running();
    }

    #[test]
    fn headless_backend_cannot_open() {
        let backend = HeadlessBackend;
        assert!(!backend.has_permission());
        assert!(matches!(backend.open(0, false), Err(ScError::Capability(_))));
        // Discovery never returns more than the single synthetic display.
        let displays = backend.displays();
        assert!(displays.len() <= 1);
        assert!(displays.iter().all(|d| d.synthetic));
    }
}
