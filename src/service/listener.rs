//! Per-listener event queues
//!
//! State transitions enqueue events while holding the owning monitor and
//! dispatch them strictly after releasing it. Each listener has its own
//! FIFO queue drained by at most one task on the listener's executor at a
//! time, so every listener observes transitions in the order the machine
//! experienced them, a blocking listener never stalls the machine or its
//! sibling listeners, and a listener may re-enter blocking calls on the
//! same machine without deadlock.

use crate::executor::Executor;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

struct QueueState<E> {
    calls: VecDeque<E>,
    scheduled: bool,
}

struct ListenerQueue<L: ?Sized, E> {
    listener: Arc<L>,
    executor: Arc<dyn Executor>,
    state: Mutex<QueueState<E>>,
}

/// The listeners of one state machine, each with an isolated event queue
pub(crate) struct ListenerSet<L: ?Sized, E> {
    dispatch: fn(&L, E),
    entries: Mutex<Vec<Arc<ListenerQueue<L, E>>>>,
}

impl<L: ?Sized + Send + Sync + 'static, E: Clone + Send + 'static> ListenerSet<L, E> {
    pub(crate) fn new(dispatch: fn(&L, E)) -> Self {
        Self {
            dispatch,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>, executor: Arc<dyn Executor>) {
        self.entries.lock().push(Arc::new(ListenerQueue {
            listener,
            executor,
            state: Mutex::new(QueueState {
                calls: VecDeque::new(),
                scheduled: false,
            }),
        }));
    }

    /// Append an event to every listener queue. Call under the monitor so
    /// the enqueue order is the transition order.
    pub(crate) fn enqueue(&self, event: E) {
        for queue in self.entries.lock().iter() {
            queue.state.lock().calls.push_back(event.clone());
        }
    }

    /// Start a drain for every queue with pending events. Call outside the
    /// monitor; listener code runs with no toolkit lock held.
    pub(crate) fn dispatch(&self) {
        let entries = self.entries.lock().clone();
        for queue in entries {
            Self::schedule_drain(queue, self.dispatch);
        }
    }

    fn schedule_drain(queue: Arc<ListenerQueue<L, E>>, dispatch: fn(&L, E)) {
        {
            let mut state = queue.state.lock();
            if state.scheduled || state.calls.is_empty() {
                return;
            }
            state.scheduled = true;
        }
        let executor = Arc::clone(&queue.executor);
        let drain_queue = Arc::clone(&queue);
        let submitted = executor.execute(Box::new(move || {
            loop {
                let event = {
                    let mut state = drain_queue.state.lock();
                    match state.calls.pop_front() {
                        Some(event) => event,
                        None => {
                            state.scheduled = false;
                            return;
                        }
                    }
                };
                let listener = Arc::clone(&drain_queue.listener);
                if catch_unwind(AssertUnwindSafe(|| dispatch(&listener, event))).is_err() {
                    tracing::error!(
                        target: "kinet::service",
                        "listener panicked; remaining events still delivered"
                    );
                }
            }
        }));
        if let Err(rejection) = submitted {
            tracing::warn!(
                target: "kinet::service",
                reason = %rejection.reason,
                "listener executor rejected an event drain"
            );
            queue.state.lock().scheduled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{DirectExecutor, ThreadPool};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    trait Sink: Send + Sync {
        fn accept(&self, event: u32);
    }

    fn forward(sink: &dyn Sink, event: u32) {
        sink.accept(event);
    }

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl Sink for Recorder {
        fn accept(&self, event: u32) {
            self.seen.lock().push(event);
        }
    }

    #[test]
    fn events_arrive_in_enqueue_order() {
        let set: ListenerSet<dyn Sink, u32> = ListenerSet::new(forward);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        set.add(recorder.clone(), Arc::new(DirectExecutor));
        for event in 0..6 {
            set.enqueue(event);
        }
        set.dispatch();
        assert_eq!(*recorder.seen.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn each_listener_gets_every_event() {
        let set: ListenerSet<dyn Sink, u32> = ListenerSet::new(forward);
        let first = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        set.add(first.clone(), Arc::new(DirectExecutor));
        set.add(second.clone(), Arc::new(DirectExecutor));
        set.enqueue(1);
        set.enqueue(2);
        set.dispatch();
        assert_eq!(*first.seen.lock(), vec![1, 2]);
        assert_eq!(*second.seen.lock(), vec![1, 2]);
    }

    #[test]
    fn a_panicking_listener_still_drains_later_events() {
        struct Grumpy {
            count: AtomicUsize,
        }
        impl Sink for Grumpy {
            fn accept(&self, event: u32) {
                self.count.fetch_add(1, Ordering::SeqCst);
                if event == 1 {
                    panic!("scripted");
                }
            }
        }
        let set: ListenerSet<dyn Sink, u32> = ListenerSet::new(forward);
        let grumpy = Arc::new(Grumpy {
            count: AtomicUsize::new(0),
        });
        set.add(grumpy.clone(), Arc::new(DirectExecutor));
        set.enqueue(1);
        set.enqueue(2);
        set.dispatch();
        assert_eq!(grumpy.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pooled_listener_preserves_order() {
        struct Tail {
            seen: Mutex<Vec<u32>>,
            done: crossbeam::channel::Sender<()>,
        }
        impl Sink for Tail {
            fn accept(&self, event: u32) {
                self.seen.lock().push(event);
                if event == 9 {
                    self.done.send(()).ok();
                }
            }
        }
        let pool = Arc::new(ThreadPool::with_size("listener-pool", 3));
        let set: ListenerSet<dyn Sink, u32> = ListenerSet::new(forward);
        let (tx, rx) = crossbeam::channel::unbounded();
        let tail = Arc::new(Tail {
            seen: Mutex::new(Vec::new()),
            done: tx,
        });
        set.add(tail.clone(), pool.clone());
        for event in 0..10 {
            set.enqueue(event);
            set.dispatch();
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*tail.seen.lock(), (0..10).collect::<Vec<_>>());
        pool.shutdown();
    }
}
