//! Ordered, single-consumer delivery of work from any thread.
//!
//! Backend callbacks, GATT completions and command handlers can all run on
//! different threads but applications want to observe one sequence of events.
//! Anything that should become visible to the application is `post`ed to a
//! [`Marshaller`] and later run by the one [`Dispatcher`] bound to it, strictly
//! in the order it was posted.

use std::sync::{Arc, Mutex as StdMutex};

use log::{trace, warn};
use tokio::sync::{broadcast, mpsc};

use crate::{Error, Event, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct Marshaller {
    inner: Arc<MarshallerInner>,
}

struct MarshallerInner {
    queue: mpsc::UnboundedSender<Task>,

    // Taken by the first (and only) call to bind(). Until then anything that's
    // posted simply accumulates in the channel.
    pending: StdMutex<Option<mpsc::UnboundedReceiver<Task>>>,
}

impl std::fmt::Debug for Marshaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marshaller")
         .field("bound", &self.is_bound())
         .finish()
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Marshaller::new()
    }
}

impl Marshaller {
    pub fn new() -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MarshallerInner {
                queue,
                pending: StdMutex::new(Some(pending)),
            }),
        }
    }

    /// Queues `task` to run on the dispatcher. Never blocks.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.inner.queue.send(Box::new(task)).is_err() {
            warn!("Dispatcher has gone away, dropping posted task");
        }
    }

    /// Hands out the dispatcher for this marshaller.
    ///
    /// There can only be one consumer, so this fails with `AlreadyInProgress`
    /// if it has already been bound.
    pub fn bind(&self) -> Result<Dispatcher> {
        match self.inner.pending.lock().unwrap().take() {
            Some(tasks) => {
                trace!("Marshaller bound to a dispatcher");
                Ok(Dispatcher { tasks })
            }
            None => Err(Error::AlreadyInProgress),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.inner.pending.lock().unwrap().is_none()
    }
}

/// The consuming end of a [`Marshaller`].
pub struct Dispatcher {
    tasks: mpsc::UnboundedReceiver<Task>,
}

impl Dispatcher {
    /// Runs tasks as they arrive until every `Marshaller` handle is dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.tasks.recv().await {
            task();
        }
        trace!("Dispatcher finished, marshaller dropped");
    }

    /// Runs everything that's currently queued (including anything queued by
    /// those tasks) and returns how many tasks ran.
    ///
    /// For applications that want to pump events from their own event loop.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.tasks.try_recv() {
            task();
            count += 1;
        }
        count
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Marshals [`Event`]s onto the session's event bus.
#[derive(Clone, Debug)]
pub(crate) struct EventEmitter {
    marshaller: Marshaller,
    event_bus: broadcast::Sender<Event>,
}

impl EventEmitter {
    pub(crate) fn new(marshaller: Marshaller, event_bus: broadcast::Sender<Event>) -> Self {
        Self {
            marshaller,
            event_bus,
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        let event_bus = self.event_bus.clone();
        self.marshaller.post(move || {
            // No subscribers is fine
            let _ = event_bus.send(event);
        });
    }
}
