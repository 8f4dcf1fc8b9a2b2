use parking_lot::RwLock;
use serde::Serialize;

/// Observable state of one background component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Disabled,
    Starting,
    Running,
    /// The directory the component watches or scrapes is not accessible
    DirMissing,
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub watcher: ComponentState,
    pub scanner: ComponentState,
    pub tunnel: ComponentState,
    pub preview_remote: ComponentState,
}

/// Shared health registry the HTTP surface reports from. Components own
/// their slot and update it as they start, fail and recover.
pub struct HealthState {
    watcher: RwLock<ComponentState>,
    scanner: RwLock<ComponentState>,
    tunnel: RwLock<ComponentState>,
    preview_remote: RwLock<ComponentState>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            watcher: RwLock::new(ComponentState::Starting),
            scanner: RwLock::new(ComponentState::Disabled),
            tunnel: RwLock::new(ComponentState::Disabled),
            preview_remote: RwLock::new(ComponentState::Disabled),
        }
    }

    pub fn set_watcher(&self, state: ComponentState) {
        *self.watcher.write() = state;
    }

    pub fn set_scanner(&self, state: ComponentState) {
        *self.scanner.write() = state;
    }

    pub fn set_tunnel(&self, state: ComponentState) {
        *self.tunnel.write() = state;
    }

    pub fn set_preview_remote(&self, state: ComponentState) {
        *self.preview_remote.write() = state;
    }

    pub fn scanner_state(&self) -> ComponentState {
        self.scanner.read().clone()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            watcher: self.watcher.read().clone(),
            scanner: self.scanner.read().clone(),
            tunnel: self.tunnel.read().clone(),
            preview_remote: self.preview_remote.read().clone(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
