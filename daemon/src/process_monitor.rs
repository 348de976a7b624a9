/// Lifecycle tracking of the target application.
///
/// On macOS the watcher subscribes to `NSWorkspace` launch and terminate
/// notifications filtered by bundle identifier.  Elsewhere it polls the
/// process table every [`POLL_INTERVAL_SECS`] seconds for the configured
/// executable name.  Both report through [`DaemonEvent::Process`].
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::TargetConfig;
use crate::event::{DaemonEvent, Pid, ProcessEvent};

#[cfg_attr(target_os = "macos", allow(dead_code))]
const POLL_INTERVAL_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum ProcessWatchError {
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    #[error("process watcher must be started on the main thread")]
    NotMainThread,
    #[cfg_attr(target_os = "macos", allow(dead_code))]
    #[error("process watcher must be started inside a tokio runtime")]
    NoRuntime,
}

/// Live subscription to application lifecycle events.  Dropping it
/// unsubscribes.
pub struct ProcessWatcher {
    _registration: imp::Registration,
}

impl ProcessWatcher {
    /// Starts watching for `target`.  If it is already running a
    /// `Launched` event is queued before any notification is delivered.
    pub fn start(
        target: &TargetConfig,
        tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Self, ProcessWatchError> {
        Ok(Self {
            _registration: imp::start(target, tx)?,
        })
    }
}

/// Pid of a running process whose executable name matches `name`
/// (case-insensitive).  The lowest pid wins when several match.
pub fn running_pid(name: &str) -> Option<Pid> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, false);
    find_pid(&sys, name)
}

fn find_pid(sys: &System, name: &str) -> Option<Pid> {
    let target = name.to_lowercase();
    sys.processes()
        .iter()
        .filter(|(_, p)| p.name().to_string_lossy().to_lowercase() == target)
        .map(|(pid, _)| pid.as_u32() as Pid)
        .min()
}

/// Events implied by the tracked pid changing from `active` to `found`.
#[cfg_attr(target_os = "macos", allow(dead_code))]
fn transitions(active: Option<Pid>, found: Option<Pid>) -> Vec<ProcessEvent> {
    match (active, found) {
        (None, Some(pid)) => vec![ProcessEvent::Launched(pid)],
        (Some(pid), None) => vec![ProcessEvent::Terminated(pid)],
        (Some(old), Some(new)) if old != new => {
            vec![ProcessEvent::Terminated(old), ProcessEvent::Launched(new)]
        }
        _ => Vec::new(), // No change.
    }
}

/// Send used from OS callbacks on the main thread.  Never blocks and never
/// drops; it fails only once the orchestrator is gone.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn emit(tx: &mpsc::UnboundedSender<DaemonEvent>, event: ProcessEvent) {
    if tx.send(DaemonEvent::Process(event)).is_err() {
        warn!(?event, "event channel closed, dropped process event");
    }
}

// ── macOS implementation ──────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod imp {
    use block2::RcBlock;
    use objc2::rc::Retained;
    use objc2::runtime::{AnyObject, ProtocolObject};
    use objc2::{msg_send, ClassType};
    use objc2_app_kit::{NSRunningApplication, NSWorkspace};
    use objc2_foundation::{
        MainThreadMarker, NSNotification, NSNotificationCenter, NSObjectProtocol,
        NSOperationQueue, NSString,
    };
    use tokio::sync::mpsc;
    use tracing::{debug, info, trace, warn};

    use super::{emit, ProcessWatchError};
    use crate::config::TargetConfig;
    use crate::event::{DaemonEvent, Pid, ProcessEvent};

    const DID_LAUNCH: &str = "NSWorkspaceDidLaunchApplicationNotification";
    const DID_TERMINATE: &str = "NSWorkspaceDidTerminateApplicationNotification";
    const APPLICATION_KEY: &str = "NSWorkspaceApplicationKey";

    type Observer = Retained<ProtocolObject<dyn NSObjectProtocol>>;

    pub(super) struct Registration {
        center: Retained<NSNotificationCenter>,
        observers: Vec<Observer>,
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            for observer in self.observers.drain(..) {
                // SAFETY: `observer` was returned by this center's addObserverForName.
                unsafe {
                    let _: () = msg_send![&*self.center, removeObserver: &*observer];
                }
            }
            debug!("process watcher unsubscribed");
        }
    }

    pub(super) fn start(
        target: &TargetConfig,
        tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Registration, ProcessWatchError> {
        let _mtm = MainThreadMarker::new().ok_or(ProcessWatchError::NotMainThread)?;
        info!(bundle_id = %target.bundle_id, "starting process watcher");

        // SAFETY: sharedWorkspace takes no arguments and returns a retained singleton.
        let workspace: Retained<NSWorkspace> =
            unsafe { msg_send![NSWorkspace::class(), sharedWorkspace] };

        if let Some(pid) = running_target(&workspace, &target.bundle_id) {
            info!(bundle_id = %target.bundle_id, pid, "target application already running");
            emit(&tx, ProcessEvent::Launched(pid));
        }

        let center = workspace.notificationCenter();
        let observers = vec![
            observe(&center, DID_LAUNCH, &target.bundle_id, tx.clone(), ProcessEvent::Launched),
            observe(&center, DID_TERMINATE, &target.bundle_id, tx, ProcessEvent::Terminated),
        ];

        Ok(Registration { center, observers })
    }

    fn running_target(workspace: &NSWorkspace, bundle_id: &str) -> Option<Pid> {
        workspace
            .runningApplications()
            .iter()
            .find(|app| bundle_identifier(app).as_deref() == Some(bundle_id))
            .map(|app| process_identifier(&app))
    }

    fn observe(
        center: &NSNotificationCenter,
        name: &str,
        bundle_id: &str,
        tx: mpsc::UnboundedSender<DaemonEvent>,
        to_event: fn(Pid) -> ProcessEvent,
    ) -> Observer {
        let target = bundle_id.to_string();
        let block = RcBlock::new(move |notification: *mut NSNotification| {
            // SAFETY: the pointer is valid for the duration of the callback.
            let notification = unsafe { &*notification };
            if let Some(pid) = target_pid(notification, &target) {
                let event = to_event(pid);
                info!(bundle_id = %target, ?event, "target application lifecycle change");
                emit(&tx, event);
            }
        });

        let name = NSString::from_str(name);
        let queue = NSOperationQueue::mainQueue();
        // SAFETY: the block is copied by the center; a null object observes all senders.
        let observer: Observer = unsafe {
            msg_send![
                center,
                addObserverForName: &*name,
                object: std::ptr::null::<AnyObject>(),
                queue: &*queue,
                usingBlock: &*block,
            ]
        };
        debug!(notification = %name, "registered workspace observer");
        observer
    }

    /// Pid of the application carried by `notification` if it is the target.
    fn target_pid(notification: &NSNotification, bundle_id: &str) -> Option<Pid> {
        let Some(user_info) = notification.userInfo() else {
            warn!("workspace notification without userInfo");
            return None;
        };
        let key = NSString::from_str(APPLICATION_KEY);
        let app: Option<Retained<NSRunningApplication>> = user_info
            .objectForKey(&key)
            // SAFETY: NSWorkspaceApplicationKey always maps to an NSRunningApplication.
            .map(|object| unsafe { msg_send![&object, self] });
        let Some(app) = app else {
            warn!("workspace notification without application");
            return None;
        };

        match bundle_identifier(&app) {
            Some(id) if id == bundle_id => Some(process_identifier(&app)),
            other => {
                trace!(bundle_id = ?other, "ignoring non-target application");
                None
            }
        }
    }

    fn bundle_identifier(app: &NSRunningApplication) -> Option<String> {
        app.bundleIdentifier().map(|id| id.to_string())
    }

    fn process_identifier(app: &NSRunningApplication) -> Pid {
        // SAFETY: processIdentifier is a plain pid_t getter.
        unsafe { msg_send![app, processIdentifier] }
    }
}

// ── Polling fallback ──────────────────────────────────────────────────────────

#[cfg(not(target_os = "macos"))]
mod imp {
    use sysinfo::{ProcessesToUpdate, System};
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{interval, Duration};
    use tracing::info;

    use super::{find_pid, transitions, ProcessWatchError, POLL_INTERVAL_SECS};
    use crate::config::TargetConfig;
    use crate::event::{DaemonEvent, Pid};

    pub(super) struct Registration {
        task: JoinHandle<()>,
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    pub(super) fn start(
        target: &TargetConfig,
        tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Registration, ProcessWatchError> {
        let runtime = Handle::try_current().map_err(|_| ProcessWatchError::NoRuntime)?;
        info!(process = %target.process_name, "starting polling process watcher");
        let task = runtime.spawn(poll(target.process_name.clone(), tx));
        Ok(Registration { task })
    }

    async fn poll(name: String, tx: mpsc::UnboundedSender<DaemonEvent>) {
        let mut sys = System::new();
        let mut active: Option<Pid> = None;
        let mut ticker = interval(Duration::from_secs(POLL_INTERVAL_SECS));

        loop {
            ticker.tick().await;

            sys.refresh_processes(ProcessesToUpdate::All, true);
            let found = find_pid(&sys, &name);

            for event in transitions(active, found) {
                info!(process = %name, ?event, "target process lifecycle change");
                if tx.send(DaemonEvent::Process(event)).is_err() {
                    return;
                }
            }
            active = found;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InterfaceEvent;

    // ── transitions ───────────────────────────────────────────────────────────

    #[test]
    fn appearance_is_a_launch() {
        assert_eq!(transitions(None, Some(7)), vec![ProcessEvent::Launched(7)]);
    }

    #[test]
    fn disappearance_is_a_termination() {
        assert_eq!(transitions(Some(7), None), vec![ProcessEvent::Terminated(7)]);
    }

    #[test]
    fn steady_state_emits_nothing() {
        assert!(transitions(None, None).is_empty());
        assert!(transitions(Some(7), Some(7)).is_empty());
    }

    #[test]
    fn pid_change_terminates_before_launching() {
        assert_eq!(
            transitions(Some(7), Some(9)),
            vec![ProcessEvent::Terminated(7), ProcessEvent::Launched(9)]
        );
    }

    // ── emit / running_pid ────────────────────────────────────────────────────

    #[test]
    fn emit_survives_a_burst_of_link_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        emit(&tx, ProcessEvent::Launched(100));
        for _ in 0..256 {
            tx.send(DaemonEvent::Interface(InterfaceEvent::StateChanged { is_up: true }))
                .unwrap();
        }
        emit(&tx, ProcessEvent::Terminated(100));

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 258);
        assert_eq!(received[0], DaemonEvent::Process(ProcessEvent::Launched(100)));
        assert_eq!(
            received[257],
            DaemonEvent::Process(ProcessEvent::Terminated(100))
        );
    }

    #[test]
    fn emit_after_receiver_is_gone_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit(&tx, ProcessEvent::Launched(1));
    }

    #[test]
    fn running_pid_finds_nothing_for_unknown_name() {
        assert_eq!(running_pid("definitely-not-a-running-process-name"), None);
    }

    #[test]
    fn error_messages_name_the_requirement() {
        assert!(ProcessWatchError::NotMainThread.to_string().contains("main thread"));
        assert!(ProcessWatchError::NoRuntime.to_string().contains("tokio runtime"));
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn polling_watcher_requires_and_uses_the_runtime() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = TargetConfig {
            bundle_id: "com.example.none".to_string(),
            process_name: "definitely-not-a-running-process-name".to_string(),
        };
        let watcher = ProcessWatcher::start(&target, tx);
        assert!(watcher.is_ok());
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn polling_watcher_outside_runtime_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = TargetConfig {
            bundle_id: "com.example.none".to_string(),
            process_name: "none".to_string(),
        };
        assert!(matches!(
            ProcessWatcher::start(&target, tx),
            Err(ProcessWatchError::NoRuntime)
        ));
    }
}
