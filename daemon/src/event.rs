/// Process identifier as reported by the OS.
pub type Pid = i32;

/// Sequence number the orchestrator gives each window watcher it spawns.
pub type WatchId = u64;

/// Lifecycle transition of the target application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Launched(Pid),
    Terminated(Pid),
}

/// Full-screen state change reported by the window watcher of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Streaming,
    NotStreaming,
}

/// Change of the watched interface as observed from the configuration store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceEvent {
    StateChanged { is_up: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// The target application launched or terminated.
    Process(ProcessEvent),
    /// The window watcher spawned for `pid` saw a full-screen transition.
    /// `pid` and `watch` let the orchestrator drop events from a superseded
    /// watcher, even when a relaunch reuses the pid.
    Window {
        pid: Pid,
        watch: WatchId,
        event: WindowEvent,
    },
    /// The interface's link state changed underneath us.
    Interface(InterfaceEvent),
}
