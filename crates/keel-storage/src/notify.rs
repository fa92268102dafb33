use std::collections::HashMap;

use tokio::sync::watch;

/// Per-(namespace, repository) change signal.
///
/// Senders are versioned counters behind `tokio::sync::watch`, which gives
/// watchers exactly the coalescing the reactive-query contract asks for:
/// any number of notifications between two polls collapse into one wakeup.
pub(crate) struct ChangeNotifier {
    channels: std::sync::Mutex<HashMap<(String, String), watch::Sender<u64>>>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        Self {
            channels: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn notify(&self, namespace: &str, repository: &str) {
        let mut channels = self.channels.lock().expect("Mutex poisoned");
        let sender = channels
            .entry((namespace.to_owned(), repository.to_owned()))
            .or_insert_with(|| watch::channel(0).0);
        sender.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub(crate) fn subscribe(&self, namespace: &str, repository: &str) -> watch::Receiver<u64> {
        let mut channels = self.channels.lock().expect("Mutex poisoned");
        channels
            .entry((namespace.to_owned(), repository.to_owned()))
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Drop every sender, ending all subscribed streams.
    pub(crate) fn close(&self) {
        self.channels.lock().expect("Mutex poisoned").clear();
    }
}
