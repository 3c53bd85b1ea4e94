use std::sync::Arc;
use tokio::sync::watch;

/// Online/offline observer. Transitions are delivered through a `watch`
/// channel; only the latest state matters to the core.
pub trait ConnectivityObserver: Send + Sync {
    fn current_status(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity fed by the shell, e.g. from `navigator.onLine` events or the
/// platform network monitor.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityState {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a transition. Repeating the current state is not a transition.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl ConnectivityObserver for ConnectivityState {
    fn current_status(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_real_transitions_wake_subscribers() {
        let state = ConnectivityState::new(false);
        let mut rx = state.subscribe();

        state.set_online(false);
        assert!(!rx.has_changed().unwrap());

        state.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(state.current_status());
    }
}
