//! The injected, process-wide task runner: a single cooperative I/O worker
//! that both drains deferred tasks (self-destruction, reentrancy-avoiding
//! follow-up work) and pumps every registered [`Pumpable`] transport, built
//! around one dedicated background thread fed by a channel.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Where deferred work gets posted. No singleton: callers own an instance
/// and decide its lifetime, with their own initialization/teardown.
pub trait TaskRunner: Send + Sync {
    /// Enqueues `task` to run later, on the runner's own worker context.
    /// Never runs `task` synchronously on the calling thread.
    fn post(&self, task: Task);
}

/// Something the I/O worker drives on every tick — in practice, a
/// [`crate::routed::RoutedChannel`] pumping its transport for inbound
/// frames.
pub trait Pumpable: Send + Sync {
    fn pump(&self);
}

const TICK: Duration = Duration::from_millis(5);

/// The default `TaskRunner`/pump driver: one dedicated `std::thread`
/// draining a task channel and, between tasks, pumping every registered
/// [`Pumpable`]. All `RoutedChannel` inbound dispatch happens on this
/// thread, giving a single-threaded cooperative scheduling model.
pub struct ThreadTaskRunner {
    tx: crossbeam_channel::Sender<Task>,
    pumpables: Mutex<Vec<Weak<dyn Pumpable>>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadTaskRunner {
    /// Spawns the worker thread, named `name` for debugging.
    pub fn spawn(name: &str) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let this = Arc::new(Self {
            tx,
            pumpables: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        });

        let worker = Arc::clone(&this);
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || loop {
                match rx.recv_timeout(TICK) {
                    Ok(task) => task(),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
                worker.pump_all();
            })
            .expect("failed to spawn io worker thread");

        *this.handle.lock() = Some(handle);
        this
    }

    /// Registers `pumpable` to be polled every tick. Held weakly: once the
    /// channel itself is dropped, it silently stops being pumped instead of
    /// being kept alive by the worker.
    pub fn register_pumpable(&self, pumpable: Weak<dyn Pumpable>) {
        self.pumpables.lock().push(pumpable);
    }

    fn pump_all(&self) {
        let mut pumpables = self.pumpables.lock();
        pumpables.retain(|p| p.upgrade().is_some());
        let live: Vec<_> = pumpables.iter().filter_map(Weak::upgrade).collect();
        drop(pumpables);
        for p in live {
            p.pump();
        }
    }

    /// Blocks until the worker thread exits. The worker exits once every
    /// `Arc<Self>` (and thus every `Sender<Task>` clone) is dropped.
    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn post(&self, task: Task) {
        // An error here means the worker thread is gone; there's nothing
        // useful to do but drop the task, since the runner has no caller to
        // report back to.
        let _ = self.tx.send(task);
    }
}
