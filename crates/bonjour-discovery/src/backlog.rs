//! Serialized resolve backlog.
//!
//! Platform resolvers mishandle concurrent resolve requests, so found services
//! are queued here and handed to a dedicated worker thread one at a time. The
//! consumer calls [`ResolveBacklog::advance`] once it has fully handled an
//! item (including any asynchronous completion) to release the next one.
//!
//! ```text
//! Idle --submit--> Processing --advance (empty)--> Idle
//!                  Processing --advance (queued)--> Processing
//! any  --stop--> Stopped
//! ```
//!
//! `submit` never blocks: when the queue is full the newest item is rejected
//! with [`DiscoveryError::QueueSaturated`].

use bonjour_core::{DiscoveryError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::thread;
use tracing::{debug, trace};

/// Lifecycle phase of a [`ResolveBacklog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogPhase {
    /// Nothing in flight
    Idle,
    /// One item has been dispatched and not yet advanced past
    Processing,
    /// Terminal
    Stopped,
}

struct BacklogState<T> {
    queue: VecDeque<T>,
    phase: BacklogPhase,
    dispatch: Option<flume::Sender<T>>,
}

/// Bounded FIFO that dispatches at most one item at a time to a worker thread.
pub struct ResolveBacklog<T> {
    state: Mutex<BacklogState<T>>,
    capacity: usize,
}

impl<T: Send + 'static> ResolveBacklog<T> {
    /// Creates a backlog and spawns its worker thread. `handler` runs on that
    /// thread for each dispatched item.
    pub fn new<F>(name: impl Into<String>, capacity: usize, handler: F) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + 'static,
    {
        let name = name.into();
        let (dispatch, items) = flume::unbounded::<T>();

        thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(item) = items.recv() {
                handler(item);
            }
            trace!(backlog = %name, "Resolve worker exiting");
        })?;

        Ok(Self {
            state: Mutex::new(BacklogState {
                queue: VecDeque::with_capacity(capacity),
                phase: BacklogPhase::Idle,
                dispatch: Some(dispatch),
            }),
            capacity,
        })
    }

    /// Enqueues an item, dispatching it immediately if the backlog is idle.
    pub fn submit(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            BacklogPhase::Stopped => Err(DiscoveryError::BacklogStopped),
            BacklogPhase::Idle => {
                state.phase = BacklogPhase::Processing;
                Self::dispatch(&mut state, item);
                Ok(())
            }
            BacklogPhase::Processing => {
                if state.queue.len() >= self.capacity {
                    return Err(DiscoveryError::QueueSaturated {
                        capacity: self.capacity,
                    });
                }
                state.queue.push_back(item);
                Ok(())
            }
        }
    }

    /// Marks the in-flight item as handled and dispatches the next one, or
    /// goes idle when nothing is queued.
    pub fn advance(&self) {
        let mut state = self.state.lock();
        if state.phase == BacklogPhase::Stopped {
            return;
        }

        match state.queue.pop_front() {
            Some(next) => {
                state.phase = BacklogPhase::Processing;
                Self::dispatch(&mut state, next);
            }
            None => state.phase = BacklogPhase::Idle,
        }
    }

    /// Stops the backlog. Queued items are discarded and the worker exits once
    /// its current item (if any) returns.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.phase == BacklogPhase::Stopped {
            return;
        }

        let discarded = state.queue.len();
        state.queue.clear();
        state.phase = BacklogPhase::Stopped;
        state.dispatch = None;
        debug!(discarded, "Resolve backlog stopped");
    }

    pub fn phase(&self) -> BacklogPhase {
        self.state.lock().phase
    }

    /// Number of items waiting behind the in-flight one.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn dispatch(state: &mut BacklogState<T>, item: T) {
        if let Some(dispatch) = &state.dispatch {
            if dispatch.send(item).is_err() {
                debug!("Resolve worker is gone, item discarded");
            }
        }
    }
}

impl<T> Drop for ResolveBacklog<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.phase = BacklogPhase::Stopped;
        state.dispatch = None;
    }
}
