/// Full-screen detection for one process.
///
/// A [`WindowWatcher`] is spawned by the orchestrator for every tracked
/// process.  It polls the on-screen window list on a fixed cadence and sends
/// [`DaemonEvent::Window`] only when the process starts or stops owning a
/// window that covers the primary display.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::event::{DaemonEvent, Pid, WatchId, WindowEvent};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TOLERANCE: f64 = 1.0;

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in global display coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    fn max_x(&self) -> f64 {
        self.x + self.width
    }

    fn max_y(&self) -> f64 {
        self.y + self.height
    }

    /// Moves every edge inwards by `by`; a negative amount grows the rectangle.
    pub fn inset(&self, by: f64) -> Self {
        Self::new(self.x + by, self.y + by, self.width - 2.0 * by, self.height - 2.0 * by)
    }

    /// Whether `other` lies entirely inside `self` (edges may touch).
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }
}

/// A window covers the display when it is no smaller than the display shrunk
/// by `tolerance` and no larger than the display grown by `tolerance`.
pub fn covers_display(window: &Rect, display: &Rect, tolerance: f64) -> bool {
    window.contains(&display.inset(tolerance)) && display.inset(-tolerance).contains(window)
}

// ── Window source ─────────────────────────────────────────────────────────────

/// Where the watcher reads display and window geometry from.
pub trait WindowSource: Send + Sync {
    /// Bounds of the primary display, if one can be resolved.
    fn display_bounds(&self) -> Option<Rect>;

    /// Bounds of the on-screen windows owned by `pid`.
    fn window_bounds(&self, pid: Pid) -> Vec<Rect>;
}

/// Whether `pid` currently owns a window covering the primary display.
pub fn has_fullscreen_window(source: &dyn WindowSource, pid: Pid, tolerance: f64) -> bool {
    let Some(display) = source.display_bounds() else {
        trace!("no primary display bounds available");
        return false;
    };
    source
        .window_bounds(pid)
        .iter()
        .any(|window| covers_display(window, &display, tolerance))
}

/// The window source for the current platform.
pub fn platform_source() -> Arc<dyn WindowSource> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(imp::CoreGraphicsWindows)
    }
    #[cfg(not(target_os = "macos"))]
    {
        tracing::warn!("full-screen detection is only available on macOS; streaming will never be reported");
        Arc::new(NoWindows)
    }
}

/// Reports no display and no windows.
#[cfg(not(target_os = "macos"))]
pub struct NoWindows;

#[cfg(not(target_os = "macos"))]
impl WindowSource for NoWindows {
    fn display_bounds(&self) -> Option<Rect> {
        None
    }

    fn window_bounds(&self, _pid: Pid) -> Vec<Rect> {
        Vec::new()
    }
}

// ── Watcher ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowWatchConfig {
    pub interval: Duration,
    pub tolerance: f64,
}

impl Default for WindowWatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Handle to a running window-polling task.  Dropping it cancels the task.
pub struct WindowWatcher {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WindowWatcher {
    /// Spawns a polling task for `pid` on the current tokio runtime.  Every
    /// event it sends is tagged with `watch`.
    ///
    /// The task stops once `cancel` fires or the event channel closes.
    pub fn spawn(
        pid: Pid,
        watch: WatchId,
        config: WindowWatchConfig,
        source: Arc<dyn WindowSource>,
        tx: mpsc::UnboundedSender<DaemonEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run(pid, watch, config, source, tx, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the task and waits for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for WindowWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    pid: Pid,
    watch: WatchId,
    config: WindowWatchConfig,
    source: Arc<dyn WindowSource>,
    tx: mpsc::UnboundedSender<DaemonEvent>,
    cancel: CancellationToken,
) {
    debug!(pid, watch, interval = ?config.interval, "window watcher started");
    let mut streaming = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let fullscreen = has_fullscreen_window(source.as_ref(), pid, config.tolerance);
        if fullscreen != streaming {
            streaming = fullscreen;
            let event = if fullscreen {
                info!(pid, "full-screen window detected, streaming started");
                WindowEvent::Streaming
            } else {
                info!(pid, "full-screen window gone, streaming ended");
                WindowEvent::NotStreaming
            };

            if cancel.is_cancelled() {
                break;
            }
            if tx.send(DaemonEvent::Window { pid, watch, event }).is_err() {
                break;
            }
        } else {
            trace!(pid, fullscreen, "no streaming state change");
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    debug!(pid, "window watcher stopped");
}

// ── macOS window list ─────────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod imp {
    use system_configuration::core_foundation::array::{CFArray, CFArrayRef};
    use system_configuration::core_foundation::base::{CFType, TCFType};
    use system_configuration::core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
    use system_configuration::core_foundation::number::CFNumber;
    use system_configuration::core_foundation::string::CFString;
    use tracing::debug;

    use super::{Rect, WindowSource};
    use crate::event::Pid;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    struct CGPoint {
        x: f64,
        y: f64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    struct CGSize {
        width: f64,
        height: f64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    struct CGRect {
        origin: CGPoint,
        size: CGSize,
    }

    impl From<CGRect> for Rect {
        fn from(r: CGRect) -> Self {
            Rect::new(r.origin.x, r.origin.y, r.size.width, r.size.height)
        }
    }

    #[link(name = "CoreGraphics", kind = "framework")]
    extern "C" {
        fn CGMainDisplayID() -> u32;
        fn CGDisplayBounds(display: u32) -> CGRect;
        fn CGWindowListCopyWindowInfo(option: u32, relative_to_window: u32) -> CFArrayRef;
        fn CGRectMakeWithDictionaryRepresentation(dict: CFDictionaryRef, rect: *mut CGRect) -> bool;
    }

    const ON_SCREEN_ONLY: u32 = 1 << 0;
    const EXCLUDE_DESKTOP_ELEMENTS: u32 = 1 << 4;
    const NULL_WINDOW_ID: u32 = 0;

    pub struct CoreGraphicsWindows;

    impl WindowSource for CoreGraphicsWindows {
        fn display_bounds(&self) -> Option<Rect> {
            // SAFETY: both calls take and return plain values.
            let bounds = unsafe { CGDisplayBounds(CGMainDisplayID()) };
            Some(bounds.into())
        }

        fn window_bounds(&self, pid: Pid) -> Vec<Rect> {
            // SAFETY: returns an owned CFArray or NULL.
            let list_ptr = unsafe {
                CGWindowListCopyWindowInfo(ON_SCREEN_ONLY | EXCLUDE_DESKTOP_ELEMENTS, NULL_WINDOW_ID)
            };
            if list_ptr.is_null() {
                debug!("failed to copy window list");
                return Vec::new();
            }
            // SAFETY: non-null and obtained under the create rule.
            let windows: CFArray<CFDictionary<CFString, CFType>> =
                unsafe { CFArray::wrap_under_create_rule(list_ptr) };

            let owner_key = CFString::from_static_string("kCGWindowOwnerPID");
            let bounds_key = CFString::from_static_string("kCGWindowBounds");

            windows
                .iter()
                .filter(|info| {
                    info.find(&owner_key)
                        .and_then(|owner| owner.downcast::<CFNumber>())
                        .and_then(|owner| owner.to_i32())
                        == Some(pid)
                })
                .filter_map(|info| {
                    let bounds = info.find(&bounds_key)?;
                    let mut rect = CGRect::default();
                    // SAFETY: kCGWindowBounds holds a CGRect dictionary representation.
                    let ok = unsafe {
                        CGRectMakeWithDictionaryRepresentation(
                            bounds.as_CFTypeRef() as CFDictionaryRef,
                            &mut rect,
                        )
                    };
                    ok.then(|| rect.into())
                })
                .collect()
        }
    }
}
