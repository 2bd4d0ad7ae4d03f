//! Host network-presence signal
//!
//! Independent of the connection state: the host reports whether the
//! network is usable at all, and the coordinator only drains or resyncs when
//! both this signal and the connection agree.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag
///
/// Clones share the flag. Starts online.
#[derive(Debug, Clone)]
pub struct NetworkPresence {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for NetworkPresence {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkPresence {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a change in host connectivity
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_presence_notifies_on_change_only() {
        let presence = NetworkPresence::default();
        let mut rx = presence.subscribe();
        assert!(presence.is_online());

        presence.set_online(true);
        assert!(!rx.has_changed().unwrap());

        presence.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!presence.clone().is_online());
    }
}
