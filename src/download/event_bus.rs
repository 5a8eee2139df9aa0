//! 线程安全的事件总线。
//!
//! 工作线程通过 `publish` 把事件写入无界通道（永不阻塞）；UI 所在线程通过
//! `run_dispatch` 以固定节拍批量取出事件，并按订阅顺序同步调用监听器。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel as channel;
use tracing::{debug, error, info, warn};

use super::models::{DownloadEvent, EventKind};
use crate::base_system::panic_message;

pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Subscriber callback. An `Err` or a panic is logged and isolated to that call.
pub type Listener = Arc<dyn Fn(&DownloadEvent) -> anyhow::Result<()> + Send + Sync>;

pub struct EventBus {
    listeners: Mutex<[Vec<Listener>; EventKind::COUNT]>,
    tx: channel::Sender<DownloadEvent>,
    rx: channel::Receiver<DownloadEvent>,
    dispatching: AtomicBool,
    wake_tx: channel::Sender<()>,
    wake_rx: channel::Receiver<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            listeners: Mutex::new(Default::default()),
            tx,
            rx,
            dispatching: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    /// Registers `listener` for `kind` and returns the stored handle for `unsubscribe`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Listener
    where
        F: Fn(&DownloadEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.subscribe_listener(kind, listener.clone());
        listener
    }

    pub fn subscribe_listener(&self, kind: EventKind, listener: Listener) {
        let mut g = self.lock_listeners();
        let slot = &mut g[kind.index()];
        slot.push(listener);
        debug!(target: "event_bus", "subscribed to {kind:?}, total listeners: {}", slot.len());
    }

    pub fn unsubscribe(&self, kind: EventKind, listener: &Listener) {
        let mut g = self.lock_listeners();
        let slot = &mut g[kind.index()];
        if let Some(pos) = slot.iter().position(|l| Arc::ptr_eq(l, listener)) {
            slot.remove(pos);
            debug!(target: "event_bus", "unsubscribed from {kind:?}");
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock_listeners()[kind.index()].len()
    }

    /// Queues an event for the next drain cycle. Never blocks, never calls listeners.
    pub fn publish(&self, event: DownloadEvent) {
        let kind = event.kind();
        // rx lives as long as self, so the channel cannot be disconnected here.
        let _ = self.tx.send(event);
        debug!(target: "event_bus", "{kind:?} queued, queue size: {}", self.rx.len());
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }

    /// Drains the events buffered when the call began and dispatches them in order.
    ///
    /// Events published by listeners during this cycle wait for the next one.
    pub fn dispatch_pending(&self) -> usize {
        let budget = self.rx.len();
        let mut processed = 0;
        while processed < budget {
            let Ok(event) = self.rx.try_recv() else {
                break;
            };
            self.dispatch_event(&event);
            processed += 1;
        }
        if processed > 0 {
            debug!(target: "event_bus", "processed {processed} events (queue was {budget})");
        }
        processed
    }

    /// Runs the drain loop on the calling thread until [`EventBus::stop_dispatch`].
    ///
    /// Returns immediately if another thread is already dispatching.
    pub fn run_dispatch(&self, interval: Duration) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            warn!(target: "event_bus", "dispatch loop already running, skipping");
            return;
        }
        // stale wake-ups from an earlier stop
        while self.wake_rx.try_recv().is_ok() {}

        info!(target: "event_bus", "starting event dispatch loop ({} ms)", interval.as_millis());
        let ticker = channel::tick(interval);
        loop {
            self.dispatch_pending();
            if !self.dispatching.load(Ordering::SeqCst) {
                break;
            }
            channel::select! {
                recv(ticker) -> _ => {}
                recv(self.wake_rx) -> _ => {}
            }
            if !self.dispatching.load(Ordering::SeqCst) {
                break;
            }
        }
        info!(target: "event_bus", "event dispatch loop stopped");
    }

    /// Ends a running [`EventBus::run_dispatch`] loop.
    ///
    /// Only affects a loop that is already running: a stop issued while the
    /// bus is idle is a no-op, and a loop started afterwards runs until the
    /// next stop.
    pub fn stop_dispatch(&self) {
        if self.dispatching.swap(false, Ordering::SeqCst) {
            info!(target: "event_bus", "stopping event dispatch");
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Drops every subscription and every buffered event.
    pub fn clear(&self) {
        for slot in self.lock_listeners().iter_mut() {
            slot.clear();
        }
        let dropped = self.rx.try_iter().count();
        info!(target: "event_bus", "cleared all listeners and {dropped} queued events");
    }

    fn dispatch_event(&self, event: &DownloadEvent) {
        let kind = event.kind();
        // Copy out so listeners may (un)subscribe without deadlocking.
        let listeners = self.lock_listeners()[kind.index()].clone();
        if listeners.is_empty() {
            debug!(target: "event_bus", "no listeners registered for {kind:?}");
            return;
        }

        for (i, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(target: "event_bus", "error in {kind:?} listener {}: {err:#}", i + 1);
                }
                Err(payload) => {
                    error!(
                        target: "event_bus",
                        "{kind:?} listener {} panicked: {}",
                        i + 1,
                        panic_message(payload)
                    );
                }
            }
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, [Vec<Listener>; EventKind::COUNT]> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
