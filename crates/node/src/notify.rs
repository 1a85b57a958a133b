//! Observers notified of committed validation state changes.
//!
//! Notifications run synchronously on the validating thread, in registration order, after the
//! change they describe is durable. An observer error never undoes that change; failures are
//! collected and handed back to the caller as a [`NotificationError`].

use std::sync::{Arc, RwLock};

use zcore_chainstate::blockindex::BlockIndexEntry;
use zcore_mempool::MempoolEntry;
use zcore_primitives::block::Block;
use zcore_primitives::transaction::Transaction;

pub type ObserverResult = Result<(), String>;

pub trait ValidationObserver: Send + Sync {
    fn name(&self) -> &str;

    fn block_connected(&self, _block: &Block, _entry: &BlockIndexEntry) -> ObserverResult {
        Ok(())
    }

    fn block_disconnected(&self, _block: &Block) -> ObserverResult {
        Ok(())
    }

    fn tx_accepted_to_pool(&self, _tx: &Transaction, _entry: &MempoolEntry) -> ObserverResult {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    BlockConnected,
    BlockDisconnected,
    TxAcceptedToPool,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::BlockConnected => "block_connected",
            Event::BlockDisconnected => "block_disconnected",
            Event::TxAcceptedToPool => "tx_accepted_to_pool",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObserverFailure {
    pub observer: String,
    pub event: Event,
    pub message: String,
}

/// Every observer failure from one notification round. The triggering change stays committed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NotificationError {
    pub failures: Vec<ObserverFailure>,
}

impl NotificationError {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: NotificationError) {
        self.failures.extend(other.failures);
    }

    pub fn into_result(self) -> Result<(), NotificationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for NotificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} observer notification(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(
                f,
                "; {} on {}: {}",
                failure.observer,
                failure.event.as_str(),
                failure.message
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for NotificationError {}

#[derive(Default)]
pub struct ValidationRegistry {
    observers: RwLock<Vec<Arc<dyn ValidationObserver>>>,
}

impl ValidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `observer` unless the same instance is already registered.
    pub fn register(&self, observer: Arc<dyn ValidationObserver>) -> bool {
        let mut observers = self.observers.write().expect("registry lock");
        if observers.iter().any(|existing| same(existing, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    pub fn unregister(&self, observer: &Arc<dyn ValidationObserver>) -> bool {
        let mut observers = self.observers.write().expect("registry lock");
        let before = observers.len();
        observers.retain(|existing| !same(existing, observer));
        observers.len() != before
    }

    pub fn unregister_all(&self) {
        self.observers.write().expect("registry lock").clear();
    }

    pub fn len(&self) -> usize {
        self.observers.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_connected(&self, block: &Block, entry: &BlockIndexEntry) -> NotificationError {
        self.fan_out(Event::BlockConnected, |observer| {
            observer.block_connected(block, entry)
        })
    }

    pub fn block_disconnected(&self, block: &Block) -> NotificationError {
        self.fan_out(Event::BlockDisconnected, |observer| {
            observer.block_disconnected(block)
        })
    }

    pub fn tx_accepted_to_pool(&self, tx: &Transaction, entry: &MempoolEntry) -> NotificationError {
        self.fan_out(Event::TxAcceptedToPool, |observer| {
            observer.tx_accepted_to_pool(tx, entry)
        })
    }

    fn fan_out<F>(&self, event: Event, mut notify: F) -> NotificationError
    where
        F: FnMut(&dyn ValidationObserver) -> ObserverResult,
    {
        // Observers may register or unregister from inside a callback.
        let observers = self.observers.read().expect("registry lock").clone();
        let mut error = NotificationError::default();
        for observer in observers {
            if let Err(message) = notify(observer.as_ref()) {
                zcore_log::log_warn!(
                    "observer {} failed on {}: {message}",
                    observer.name(),
                    event.as_str()
                );
                error.failures.push(ObserverFailure {
                    observer: observer.name().to_string(),
                    event,
                    message,
                });
            }
        }
        error
    }
}

fn same(a: &Arc<dyn ValidationObserver>, b: &Arc<dyn ValidationObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use zcore_primitives::block::BlockHeader;

    use super::*;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ValidationObserver for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn block_disconnected(&self, _block: &Block) -> ObserverResult {
            self.log.lock().expect("log").push(self.name.to_string());
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn block() -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                final_sapling_root: [0u8; 32],
                time: 0,
                bits: 0x200f_0f0f,
                nonce: [0u8; 32],
                solution: Vec::new(),
            },
            transactions: Vec::new(),
        }
    }

    #[test]
    fn notifies_in_registration_order_and_collects_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ValidationRegistry::new();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            registry.register(Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
                fail,
            }));
        }

        let error = registry.block_disconnected(&block());
        assert_eq!(*log.lock().expect("log"), vec!["first", "second", "third"]);
        assert_eq!(error.failures.len(), 1);
        assert_eq!(error.failures[0].observer, "second");
        assert_eq!(error.failures[0].event, Event::BlockDisconnected);
        assert!(error.into_result().is_err());
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = ValidationRegistry::new();
        let observer: Arc<dyn ValidationObserver> = Arc::new(Recorder {
            name: "only",
            log: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        });
        assert!(registry.register(Arc::clone(&observer)));
        assert!(!registry.register(Arc::clone(&observer)));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(&observer));
        assert!(!registry.unregister(&observer));
        assert!(registry.is_empty());
        assert!(registry.block_disconnected(&block()).is_empty());
    }
}
