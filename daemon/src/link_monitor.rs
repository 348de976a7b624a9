/// Watches the configuration store for link changes on one interface.
///
/// Whenever `State:/Network/Interface/<name>/Link` changes, the current up
/// flag is read back through the actuator and sent as
/// [`InterfaceEvent::StateChanged`].  The orchestrator uses this to notice the
/// OS re-enabling the interface while streaming.
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{DaemonEvent, InterfaceEvent};
use crate::interface::{InterfaceActuator, InterfaceControl, InterfaceName};

#[derive(Debug, Error)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub enum LinkWatchError {
    #[error("failed to create dynamic store")]
    StoreCreation,
    #[error("failed to set notification keys")]
    SetNotificationKeys,
    #[error("failed to create run loop source")]
    RunLoopSource,
}

/// Configuration store key carrying the link state of `name`.
pub fn link_key(name: &InterfaceName) -> String {
    format!("State:/Network/Interface/{name}/Link")
}

/// Live registration on the current run loop.  Dropping it stops delivery.
pub struct LinkStateWatcher {
    _registration: imp::Registration,
}

impl LinkStateWatcher {
    /// Registers for link notifications on the calling thread's run loop.
    pub fn start(
        actuator: InterfaceActuator,
        tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Self, LinkWatchError> {
        Ok(Self {
            _registration: imp::start(actuator, tx)?,
        })
    }
}

/// Reads the flag and forwards it; a failed read produces no event.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn report(control: &dyn InterfaceControl, tx: &mpsc::UnboundedSender<DaemonEvent>) {
    let is_up = match control.is_up() {
        Ok(up) => up,
        Err(e) => {
            warn!(interface = %control.name(), error = %e, "link changed but flags are unreadable");
            return;
        }
    };
    debug!(interface = %control.name(), is_up, "link state changed");
    let event = DaemonEvent::Interface(InterfaceEvent::StateChanged { is_up });
    if tx.send(event).is_err() {
        warn!("event channel closed, dropped link state event");
    }
}

// ── macOS implementation ──────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod imp {
    use system_configuration::core_foundation::array::CFArray;
    use system_configuration::core_foundation::runloop::{
        kCFRunLoopCommonModes, CFRunLoop, CFRunLoopSource,
    };
    use system_configuration::core_foundation::string::CFString;
    use system_configuration::dynamic_store::{
        SCDynamicStore, SCDynamicStoreBuilder, SCDynamicStoreCallBackContext,
    };
    use tokio::sync::mpsc;
    use tracing::{info, trace};

    use super::{link_key, report, LinkWatchError};
    use crate::event::DaemonEvent;
    use crate::interface::{InterfaceActuator, InterfaceControl};

    const STORE_NAME: &str = "awdl-guard-link-watcher";

    struct Context {
        actuator: InterfaceActuator,
        tx: mpsc::UnboundedSender<DaemonEvent>,
    }

    pub(super) struct Registration {
        _store: SCDynamicStore,
        run_loop: CFRunLoop,
        source: CFRunLoopSource,
    }

    impl Drop for Registration {
        fn drop(&mut self) {
            // SAFETY: kCFRunLoopCommonModes is an immutable framework constant.
            self.run_loop
                .remove_source(&self.source, unsafe { kCFRunLoopCommonModes });
        }
    }

    #[allow(clippy::needless_pass_by_value)]
    fn on_change(_store: SCDynamicStore, changed: CFArray<CFString>, context: &mut Context) {
        trace!(count = changed.len(), "dynamic store callback");
        report(&context.actuator, &context.tx);
    }

    pub(super) fn start(
        actuator: InterfaceActuator,
        tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Registration, LinkWatchError> {
        let key = link_key(actuator.name());
        info!(interface = %actuator.name(), key = %key, "starting link state watcher");

        let store = SCDynamicStoreBuilder::new(STORE_NAME)
            .callback_context(SCDynamicStoreCallBackContext {
                callout: on_change,
                info: Context { actuator, tx },
            })
            .build()
            .ok_or(LinkWatchError::StoreCreation)?;

        let keys = CFArray::from_CFTypes(&[CFString::new(&key)]);
        let patterns: CFArray<CFString> = CFArray::from_CFTypes(&[]);
        if !store.set_notification_keys(&keys, &patterns) {
            return Err(LinkWatchError::SetNotificationKeys);
        }

        let source = store
            .create_run_loop_source()
            .ok_or(LinkWatchError::RunLoopSource)?;
        let run_loop = CFRunLoop::get_current();
        // SAFETY: kCFRunLoopCommonModes is an immutable framework constant.
        run_loop.add_source(&source, unsafe { kCFRunLoopCommonModes });

        Ok(Registration {
            _store: store,
            run_loop,
            source,
        })
    }
}

// ── Unsupported platforms ─────────────────────────────────────────────────────

#[cfg(not(target_os = "macos"))]
mod imp {
    use tokio::sync::mpsc;
    use tracing::warn;

    use super::LinkWatchError;
    use crate::event::DaemonEvent;
    use crate::interface::{InterfaceActuator, InterfaceControl};

    pub(super) struct Registration;

    pub(super) fn start(
        actuator: InterfaceActuator,
        _tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Registration, LinkWatchError> {
        warn!(
            interface = %actuator.name(),
            "link notifications are unavailable on this platform; re-assertion is disabled"
        );
        Ok(Registration)
    }
}
