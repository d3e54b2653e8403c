//! Connectivity and focus signals.
//!
//! Both managers are plain shared handles over a `tokio::sync::watch` channel.
//! The embedding application reports changes; paused fetches and refetch
//! triggers react to them.

use std::sync::Arc;

use tokio::sync::watch;

/// Reports whether the application can reach the network.
///
/// Fetches using [`NetworkMode::Online`](crate::NetworkMode::Online) pause while
/// offline and resume once [`set_online(true)`](OnlineManager::set_online) is
/// reported.
#[derive(Debug, Clone)]
pub struct OnlineManager {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl OnlineManager {
    /// Create a manager with the given initial connectivity.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a connectivity change.
    ///
    /// Returns `true` if the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        })
    }

    /// Subscribe to connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the manager reports online.
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|online| *online).await;
    }
}

/// Reports whether the application is focused by the user.
#[derive(Debug, Clone)]
pub struct FocusManager {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FocusManager {
    /// Create a manager with the given initial focus.
    pub fn new(focused: bool) -> Self {
        let (tx, _) = watch::channel(focused);
        Self { tx: Arc::new(tx) }
    }

    /// Current focus.
    pub fn is_focused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a focus change. Returns `true` if the value changed.
    pub fn set_focused(&self, focused: bool) -> bool {
        self.tx.send_if_modified(|current| {
            let changed = *current != focused;
            *current = focused;
            changed
        })
    }

    /// Subscribe to focus changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
