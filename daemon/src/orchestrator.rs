/// The daemon's single event consumer.
///
/// Owns the interface actuator and at most one [`WindowWatcher`], and maps
/// process, window and link events onto up/down decisions:
///
/// | State                  | Event                  | Action                    |
/// |------------------------|------------------------|---------------------------|
/// | Idle                   | Launched(pid)          | watch windows of pid      |
/// | Tracking(pid, false)   | Streaming              | bring interface down      |
/// | Tracking(pid, true)    | NotStreaming           | bring interface up        |
/// | Tracking(pid, s)       | Terminated(pid)        | stop watcher; up if s     |
/// | Tracking(pid, true)    | link came back up      | bring interface down      |
/// | Tracking(pid, s)       | Launched(other)        | stop watcher; up if s; watch other |
///
/// Actuation failures are logged and recorded in the status file; the state
/// machine advances regardless.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::event::{DaemonEvent, InterfaceEvent, Pid, ProcessEvent, WatchId, WindowEvent};
use crate::interface::InterfaceControl;
use crate::status::{self, DaemonState, DaemonStatus};
use crate::window_monitor::{WindowSource, WindowWatchConfig, WindowWatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Tracking { pid: Pid, streaming: bool },
}

struct Tracked {
    pid: Pid,
    watch: WatchId,
    streaming: bool,
    watcher: WindowWatcher,
}

pub struct Orchestrator<C: InterfaceControl> {
    control: C,
    windows: Arc<dyn WindowSource>,
    window_config: WindowWatchConfig,
    /// Handed to each window watcher.
    events: mpsc::UnboundedSender<DaemonEvent>,
    shutdown: CancellationToken,
    tracked: Option<Tracked>,
    last_watch: WatchId,
    status: DaemonStatus,
    status_path: Option<PathBuf>,
}

impl<C: InterfaceControl> Orchestrator<C> {
    pub fn new(
        control: C,
        windows: Arc<dyn WindowSource>,
        window_config: WindowWatchConfig,
        events: mpsc::UnboundedSender<DaemonEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let status = DaemonStatus::new(control.name().as_str());
        Self {
            control,
            windows,
            window_config,
            events,
            shutdown,
            tracked: None,
            last_watch: 0,
            status,
            status_path: None,
        }
    }

    /// Publishes state changes to `path`.
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_path = Some(path);
        self
    }

    pub fn phase(&self) -> Phase {
        match &self.tracked {
            None => Phase::Idle,
            Some(t) => Phase::Tracking {
                pid: t.pid,
                streaming: t.streaming,
            },
        }
    }

    /// Consumes events until shutdown is requested or every sender is gone,
    /// then restores the interface.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DaemonEvent>) {
        info!(interface = %self.control.name(), "orchestrator started");
        self.publish();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        self.finish().await;
    }

    /// Applies one event.  Never blocks.
    pub fn handle(&mut self, event: DaemonEvent) {
        trace!(?event, phase = ?self.phase(), "handling event");
        match event {
            DaemonEvent::Process(ProcessEvent::Launched(pid)) => self.on_launched(pid),
            DaemonEvent::Process(ProcessEvent::Terminated(pid)) => self.on_terminated(pid),
            DaemonEvent::Window { pid, watch, event } => self.on_window(pid, watch, event),
            DaemonEvent::Interface(InterfaceEvent::StateChanged { is_up }) => {
                self.on_link_changed(is_up)
            }
        }
    }

    /// Stops the watcher and brings the interface back up if it was held down.
    pub async fn finish(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            tracked.watcher.stop().await;
            if tracked.streaming {
                info!(pid = tracked.pid, "restoring interface before exit");
                self.actuate(true);
            }
            self.publish();
        }
        info!("orchestrator stopped");
    }

    fn on_launched(&mut self, pid: Pid) {
        if let Phase::Tracking { pid: current, .. } = self.phase() {
            if current == pid {
                debug!(pid, "already tracking");
                return;
            }
        }
        self.release();

        self.last_watch += 1;
        let watch = self.last_watch;
        info!(pid, watch, "tracking target application");
        let watcher = WindowWatcher::spawn(
            pid,
            watch,
            self.window_config,
            Arc::clone(&self.windows),
            self.events.clone(),
            self.shutdown.child_token(),
        );
        self.tracked = Some(Tracked {
            pid,
            watch,
            streaming: false,
            watcher,
        });
        self.publish();
    }

    fn on_terminated(&mut self, pid: Pid) {
        match self.phase() {
            Phase::Tracking { pid: current, .. } if current == pid => {
                info!(pid, "target application terminated");
                self.release();
                self.publish();
            }
            _ => debug!(pid, "ignoring termination of untracked process"),
        }
    }

    fn on_window(&mut self, pid: Pid, watch: WatchId, event: WindowEvent) {
        let streaming = event == WindowEvent::Streaming;
        let Some(tracked) = self.tracked.as_mut() else {
            debug!(pid, ?event, "ignoring window event while idle");
            return;
        };
        if tracked.pid != pid || tracked.watch != watch {
            debug!(pid, watch, tracked = tracked.pid, "dropping stale window event");
            return;
        }
        if tracked.streaming == streaming {
            return;
        }

        tracked.streaming = streaming;
        if streaming {
            info!(pid, "streaming started, bringing interface down");
        } else {
            info!(pid, "streaming ended, bringing interface up");
        }
        self.actuate(!streaming);
        self.publish();
    }

    fn on_link_changed(&mut self, is_up: bool) {
        match self.phase() {
            Phase::Tracking { pid, streaming: true } if is_up => {
                info!(pid, "interface came back up while streaming, re-asserting down");
                self.actuate(false);
                self.publish();
            }
            _ => trace!(is_up, "link change needs no action"),
        }
    }

    /// Cancels the current watcher and undoes any down it caused.
    fn release(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            tracked.watcher.cancel();
            if tracked.streaming {
                self.actuate(true);
            }
        }
    }

    fn actuate(&mut self, up: bool) {
        let result = if up {
            self.control.bring_up()
        } else {
            self.control.bring_down()
        };
        match result {
            Ok(()) => self.status.error = None,
            Err(e) => {
                error!(
                    interface = %self.control.name(),
                    error = %e,
                    os_error = ?e.raw_os_error(),
                    up,
                    "interface actuation failed"
                );
                self.status.error = Some(e.to_string());
            }
        }
    }

    fn publish(&mut self) {
        let (state, pid) = match self.phase() {
            Phase::Idle => (DaemonState::Idle, None),
            Phase::Tracking { pid, streaming: false } => (DaemonState::Tracking, Some(pid)),
            Phase::Tracking { pid, streaming: true } => (DaemonState::Streaming, Some(pid)),
        };
        self.status.transition(state, pid);
        if let Some(path) = &self.status_path {
            status::write_status(path, &self.status);
        }
    }

    #[cfg(test)]
    fn watcher_token(&self) -> Option<CancellationToken> {
        self.tracked.as_ref().map(|t| t.watcher.cancellation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{InterfaceError, InterfaceName, Result as InterfaceResult};
    use crate::window_monitor::tests::{ScriptedWindows, DISPLAY};
    use crate::window_monitor::Rect;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Up,
        Down,
    }

    /// Records actuation calls; optionally fails every one of them.
    #[derive(Clone)]
    struct RecordingControl {
        name: InterfaceName,
        calls: Arc<Mutex<Vec<Call>>>,
        fail: bool,
    }

    impl RecordingControl {
        fn new() -> Self {
            Self {
                name: InterfaceName::new("awdl0").unwrap(),
                calls: Arc::new(Mutex::new(Vec::new())),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> InterfaceResult<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                Err(InterfaceError::WriteFlags {
                    interface: self.name.clone(),
                    source: std::io::Error::from_raw_os_error(1),
                })
            } else {
                Ok(())
            }
        }
    }

    impl InterfaceControl for RecordingControl {
        fn name(&self) -> &InterfaceName {
            &self.name
        }

        fn bring_up(&self) -> InterfaceResult<()> {
            self.record(Call::Up)
        }

        fn bring_down(&self) -> InterfaceResult<()> {
            self.record(Call::Down)
        }

        fn is_up(&self) -> InterfaceResult<bool> {
            Ok(true)
        }
    }

    /// No display, so spawned watchers never report anything.
    struct Headless;

    impl WindowSource for Headless {
        fn display_bounds(&self) -> Option<Rect> {
            None
        }

        fn window_bounds(&self, _pid: Pid) -> Vec<Rect> {
            Vec::new()
        }
    }

    struct Harness {
        control: RecordingControl,
        orchestrator: Orchestrator<RecordingControl>,
        shutdown: CancellationToken,
        _rx: mpsc::UnboundedReceiver<DaemonEvent>,
    }

    fn harness_with(control: RecordingControl) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            control.clone(),
            Arc::new(Headless),
            WindowWatchConfig::default(),
            tx,
            shutdown.clone(),
        );
        Harness {
            control,
            orchestrator,
            shutdown,
            _rx: rx,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingControl::new())
    }

    fn launched(pid: Pid) -> DaemonEvent {
        DaemonEvent::Process(ProcessEvent::Launched(pid))
    }

    fn terminated(pid: Pid) -> DaemonEvent {
        DaemonEvent::Process(ProcessEvent::Terminated(pid))
    }

    fn streaming(pid: Pid, watch: WatchId) -> DaemonEvent {
        DaemonEvent::Window {
            pid,
            watch,
            event: WindowEvent::Streaming,
        }
    }

    fn not_streaming(pid: Pid, watch: WatchId) -> DaemonEvent {
        DaemonEvent::Window {
            pid,
            watch,
            event: WindowEvent::NotStreaming,
        }
    }

    fn link(is_up: bool) -> DaemonEvent {
        DaemonEvent::Interface(InterfaceEvent::StateChanged { is_up })
    }

    // ── scenarios ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn launch_then_streaming_brings_interface_down_once() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: false });
        assert!(h.control.calls().is_empty());

        h.orchestrator.handle(streaming(100, 1));
        assert_eq!(h.control.calls(), vec![Call::Down]);
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: true });
    }

    #[tokio::test(start_paused = true)]
    async fn interface_coming_back_up_while_streaming_is_reasserted() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(100, 1));

        h.orchestrator.handle(link(true));
        assert_eq!(h.control.calls(), vec![Call::Down, Call::Down]);
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: true });
    }

    #[tokio::test(start_paused = true)]
    async fn termination_while_streaming_restores_interface() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(100, 1));
        let token = h.orchestrator.watcher_token().unwrap();

        h.orchestrator.handle(terminated(100));
        assert_eq!(h.control.calls(), vec![Call::Down, Call::Up]);
        assert_eq!(h.orchestrator.phase(), Phase::Idle);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn termination_of_other_pid_is_ignored() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(terminated(999));
        assert!(h.control.calls().is_empty());
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: false });
        assert!(!h.orchestrator.watcher_token().unwrap().is_cancelled());
    }

    // ── idempotence and stale events ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn repeated_streaming_does_not_bring_down_twice() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(100, 1));
        h.orchestrator.handle(streaming(100, 1));
        assert_eq!(h.control.calls(), vec![Call::Down]);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_end_brings_interface_up() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(100, 1));
        h.orchestrator.handle(not_streaming(100, 1));
        h.orchestrator.handle(not_streaming(100, 1));
        assert_eq!(h.control.calls(), vec![Call::Down, Call::Up]);
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: false });
    }

    #[tokio::test(start_paused = true)]
    async fn stale_window_events_are_dropped() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(7, 1));
        assert!(h.control.calls().is_empty());
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: false });
    }

    #[tokio::test(start_paused = true)]
    async fn window_events_while_idle_are_ignored() {
        let mut h = harness();
        h.orchestrator.handle(streaming(100, 1));
        assert!(h.control.calls().is_empty());
        assert_eq!(h.orchestrator.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn link_changes_outside_streaming_are_ignored() {
        let mut h = harness();
        h.orchestrator.handle(link(true));
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(link(true));
        h.orchestrator.handle(streaming(100, 1));
        h.orchestrator.handle(link(false));
        assert_eq!(h.control.calls(), vec![Call::Down]);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_without_streaming_does_not_touch_interface() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(terminated(100));
        assert!(h.control.calls().is_empty());
        assert_eq!(h.orchestrator.phase(), Phase::Idle);
    }

    // ── relaunch ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn duplicate_launch_keeps_the_watcher() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(100, 1));
        let token = h.orchestrator.watcher_token().unwrap();

        h.orchestrator.handle(launched(100));
        assert!(!token.is_cancelled());
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: true });
        assert_eq!(h.control.calls(), vec![Call::Down]);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_of_other_pid_supersedes_and_restores() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(streaming(100, 1));
        let old = h.orchestrator.watcher_token().unwrap();

        h.orchestrator.handle(launched(200));
        assert!(old.is_cancelled());
        assert_eq!(h.control.calls(), vec![Call::Down, Call::Up]);
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 200, streaming: false });

        // Late event from the superseded watcher.
        h.orchestrator.handle(streaming(100, 1));
        assert_eq!(h.control.calls(), vec![Call::Down, Call::Up]);
    }

    #[tokio::test(start_paused = true)]
    async fn relaunch_with_reused_pid_drops_the_old_watchers_events() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        h.orchestrator.handle(terminated(100));
        h.orchestrator.handle(launched(100));

        h.orchestrator.handle(streaming(100, 1));
        assert!(h.control.calls().is_empty());
        assert_eq!(h.orchestrator.phase(), Phase::Tracking { pid: 100, streaming: false });

        h.orchestrator.handle(streaming(100, 2));
        assert_eq!(h.control.calls(), vec![Call::Down]);
    }

    // ── failures and status ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn failed_actuation_still_advances_and_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let h = harness_with(RecordingControl::failing());
        let mut orchestrator = h.orchestrator.with_status_file(path.clone());

        orchestrator.handle(launched(100));
        orchestrator.handle(streaming(100, 1));
        assert_eq!(h.control.calls(), vec![Call::Down]);
        assert_eq!(orchestrator.phase(), Phase::Tracking { pid: 100, streaming: true });

        let written = status::read_status(&path).unwrap().unwrap();
        assert_eq!(written.state, DaemonState::Streaming);
        assert_eq!(written.tracked_pid, Some(100));
        assert!(written.error.unwrap().contains("awdl0"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_file_follows_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let h = harness();
        let mut orchestrator = h.orchestrator.with_status_file(path.clone());

        orchestrator.handle(launched(100));
        let written = status::read_status(&path).unwrap().unwrap();
        assert_eq!(written.state, DaemonState::Tracking);
        assert_eq!(written.interface, "awdl0");

        orchestrator.handle(terminated(100));
        let written = status::read_status(&path).unwrap().unwrap();
        assert_eq!(written.state, DaemonState::Idle);
        assert!(written.tracked_pid.is_none());
        assert!(written.error.is_none());
    }

    // ── run / shutdown ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_streaming_restores_interface() {
        let control = RecordingControl::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            control.clone(),
            Arc::new(Headless),
            WindowWatchConfig::default(),
            tx.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(orchestrator.run(rx));

        tx.send(launched(100)).unwrap();
        tx.send(streaming(100, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control.calls(), vec![Call::Down]);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(control.calls(), vec![Call::Down, Call::Up]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_idle_touches_nothing() {
        let mut h = harness();
        h.shutdown.cancel();
        h.orchestrator.finish().await;
        assert!(h.control.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn finish_stops_the_watcher() {
        let mut h = harness();
        h.orchestrator.handle(launched(100));
        let token = h.orchestrator.watcher_token().unwrap();
        h.orchestrator.finish().await;
        assert!(token.is_cancelled());
        assert_eq!(h.orchestrator.phase(), Phase::Idle);
        assert!(h.control.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_watcher_brings_interface_down_and_shutdown_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let control = RecordingControl::new();
        let windows = ScriptedWindows::new();
        windows.set(vec![(100, DISPLAY)]);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            control.clone(),
            windows.clone(),
            WindowWatchConfig::default(),
            tx.clone(),
            shutdown.clone(),
        )
        .with_status_file(path.clone());
        let task = tokio::spawn(orchestrator.run(rx));

        tx.send(launched(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control.calls(), vec![Call::Down]);
        let written = status::read_status(&path).unwrap().unwrap();
        assert_eq!(written.state, DaemonState::Streaming);
        assert_eq!(written.tracked_pid, Some(100));

        // Further polls see the same window and stay quiet.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(control.calls(), vec![Call::Down]);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(control.calls(), vec![Call::Down, Call::Up]);
        let written = status::read_status(&path).unwrap().unwrap();
        assert_eq!(written.state, DaemonState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_after_a_burst_of_link_events_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let control = RecordingControl::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            control.clone(),
            Arc::new(Headless),
            WindowWatchConfig::default(),
            tx.clone(),
            shutdown.clone(),
        )
        .with_status_file(path.clone());

        tx.send(launched(100)).unwrap();
        for _ in 0..256 {
            tx.send(link(true)).unwrap();
        }
        tx.send(terminated(100)).unwrap();
        let task = tokio::spawn(orchestrator.run(rx));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let written = status::read_status(&path).unwrap().unwrap();
        assert_eq!(written.state, DaemonState::Idle);
        assert!(written.tracked_pid.is_none());
        assert!(control.calls().is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
