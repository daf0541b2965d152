use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;

/// An occurrence on an event stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A decoded message
    Data(Value),
    Error(Arc<Error>),
    /// The queue was closed upstream; no more data follows
    End,
    /// The endpoint released its resources; nothing follows
    Close,
}

/// Named occurrence streams listeners can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    End,
    Close,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Error(_) => EventKind::Error,
            Self::End => EventKind::End,
            Self::Close => EventKind::Close,
        }
    }
}

/// Handle for removing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Dispatches stream occurrences to any number of listeners
///
/// `Close` is delivered at most once; after it every emit is dropped and all
/// listeners are released. Emits are serialized, so no occurrence reaches a
/// listener after `Close` even when emitted from several threads.
#[derive(Default)]
pub struct Emitter {
    // Reentrant so listeners may emit
    emitting: ReentrantMutex<()>,
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to one kind of occurrence
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Listen to every occurrence
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    /// Listen to decoded data only
    pub fn on_data<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(EventKind::Data, move |event| {
            if let StreamEvent::Data(value) = event {
                handler(value)
            }
        })
    }

    /// Remove a listener, returning whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    /// Receive every occurrence as a stream; it ends after `Close`
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.on_any(move |event| {
                let _ = tx.send(event.clone());
            });
        }
        rx
    }

    /// Deliver an occurrence; false when the stream is already closed
    pub fn emit(&self, event: StreamEvent) -> bool {
        let _emitting = self.emitting.lock();
        let closing = matches!(event, StreamEvent::Close);
        if closing {
            if self.closed.swap(true, Ordering::SeqCst) {
                return false;
            }
        } else if self.is_closed() {
            tracing::trace!(kind = ?event.kind(), "occurrence after close dropped");
            return false;
        }

        let kind = event.kind();
        // Listeners run without the lock held so they may (un)register
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|registration| registration.kind.map_or(true, |k| k == kind))
            .map(|registration| Arc::clone(&registration.listener))
            .collect();
        for listener in targets {
            listener(&event);
        }

        if closing {
            self.listeners.lock().clear();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push(Registration { id, kind, listener });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn routes_by_kind_to_multiple_listeners() {
        let emitter = Emitter::new();
        let data = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let data = Arc::clone(&data);
            emitter.on_data(move |_| {
                data.fetch_add(1, Ordering::SeqCst);
            });
        }
        let counter = Arc::clone(&all);
        emitter.on_any(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(StreamEvent::Data(json!({"a": 1})));
        emitter.emit(StreamEvent::End);

        assert_eq!(data.load(Ordering::SeqCst), 2);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nothing_is_delivered_after_close() {
        let emitter = Emitter::new();
        let mut events = emitter.subscribe();

        assert!(emitter.emit(StreamEvent::Close));
        assert!(!emitter.emit(StreamEvent::Close));
        assert!(!emitter.emit(StreamEvent::Data(json!(1))));

        assert!(matches!(events.try_recv(), Ok(StreamEvent::Close)));
        assert!(events.try_recv().is_err());
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn close_is_last_across_threads() {
        let emitter = Arc::new(Emitter::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        emitter.on_any(move |event| sink.lock().push(event.kind()));

        let emitters: Vec<_> = (0..4)
            .map(|_| {
                let emitter = Arc::clone(&emitter);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        emitter.emit(StreamEvent::Data(json!(i)));
                    }
                })
            })
            .collect();
        emitter.emit(StreamEvent::Close);
        for handle in emitters {
            handle.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&EventKind::Close));
        assert_eq!(seen.iter().filter(|kind| **kind == EventKind::Close).count(), 1);
    }

    #[test]
    fn listener_may_emit_while_handling() {
        let emitter = Arc::new(Emitter::new());
        let inner = Arc::clone(&emitter);
        emitter.on(EventKind::End, move |_| {
            inner.emit(StreamEvent::Close);
        });

        assert!(emitter.emit(StreamEvent::End));
        assert!(emitter.is_closed());
    }

    #[test]
    fn off_removes_listener() {
        let emitter = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = emitter.on(EventKind::End, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(StreamEvent::End);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
