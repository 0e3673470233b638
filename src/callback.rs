/// Event callback stabilization
///
/// An `EventCallback` hands out one forwarding closure whose identity never
/// changes, while the function it forwards to can be swapped on every render.
/// Engine subscriptions are wired once to the forwarding closure and keep
/// running the latest handler logic.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Shared event handler
pub type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Wrap a closure as a [`Callback`]
pub fn callback<A, F>(f: F) -> Callback<A>
where
    F: Fn(A) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Stable handle over a replaceable event handler
pub struct EventCallback<A> {
    latest: Arc<RwLock<Option<Callback<A>>>>,
    handle: Callback<A>,
}

impl<A: 'static> EventCallback<A> {
    /// Create the stable handle. Called once, on first render.
    pub fn new(initial: Option<Callback<A>>) -> Self {
        let latest = Arc::new(RwLock::new(initial));
        let slot = Arc::clone(&latest);

        let handle: Callback<A> = Arc::new(move |arg: A| {
            // Release the lock before dispatching so the handler may call `update`.
            let current = slot.read().clone();
            if let Some(f) = current {
                f(arg);
            }
        });

        Self { latest, handle }
    }

    /// Replace the function the handle forwards to
    ///
    /// Takes effect immediately: any event delivered after this returns runs
    /// the new function.
    pub fn update(&self, f: Option<Callback<A>>) {
        *self.latest.write() = f;
    }

    /// The forwarding closure. Every call returns the same identity.
    pub fn handle(&self) -> Callback<A> {
        Arc::clone(&self.handle)
    }

    /// Invoke whatever function is currently installed
    pub fn call(&self, arg: A) {
        (self.handle)(arg)
    }

    /// Whether a handler is currently installed
    pub fn is_set(&self) -> bool {
        self.latest.read().is_some()
    }

    /// Whether `other` is this handle's forwarding closure
    pub fn is_handle(&self, other: &Callback<A>) -> bool {
        same_callback(&self.handle, other)
    }
}

impl<A> fmt::Debug for EventCallback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallback")
            .field("set", &self.latest.read().is_some())
            .finish()
    }
}

/// Identity comparison for callbacks (ignores vtable metadata)
pub fn same_callback<A>(a: &Callback<A>, b: &Callback<A>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_forwards_to_latest_handler() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&a_calls);
        let stable = EventCallback::new(Some(callback(move |_: u32| {
            a.fetch_add(1, Ordering::SeqCst);
        })));

        // Subscription wired once
        let subscribed = stable.handle();
        subscribed(1);

        let b = Arc::clone(&b_calls);
        stable.update(Some(callback(move |_: u32| {
            b.fetch_add(1, Ordering::SeqCst);
        })));
        subscribed(2);

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_is_stable() {
        let stable: EventCallback<()> = EventCallback::new(None);
        let first = stable.handle();

        for _ in 0..10 {
            stable.update(Some(callback(|_: ()| {})));
        }

        let second = stable.handle();
        assert!(same_callback(&first, &second));
        assert!(stable.is_handle(&second));
    }

    #[test]
    fn test_missing_handler_is_noop() {
        let stable: EventCallback<f32> = EventCallback::new(None);
        assert!(!stable.is_set());
        stable.call(0.5);

        stable.update(Some(callback(|_: f32| {})));
        assert!(stable.is_set());

        stable.update(None);
        assert!(!stable.is_set());
        stable.call(0.5);
    }

    #[test]
    fn test_arguments_are_forwarded() {
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let stable = EventCallback::new(Some(callback(move |audio: Vec<f32>| {
            sink.write().push(audio.len());
        })));

        stable.call(vec![0.0; 3]);
        stable.call(vec![0.0; 7]);

        assert_eq!(*seen.read(), vec![3, 7]);
    }

    #[test]
    fn test_handler_may_replace_itself() {
        let stable = Arc::new(EventCallback::<()>::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&stable);
        let counter = Arc::clone(&calls);
        stable.update(Some(callback(move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner.update(None);
        })));

        stable.call(());
        stable.call(());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
