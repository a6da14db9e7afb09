//! Scoped release handles for listeners (media queries, intersection
//! observations, settle notifications).

use std::fmt;

type Release = Box<dyn FnOnce() + Send>;

/// Handle returned by every `subscribe`/`observe` style call.
///
/// The listener stays registered while the handle is alive. Dropping the
/// handle or calling [`Subscription::unsubscribe`] releases it exactly once.
#[must_use = "dropping a Subscription releases the listener immediately"]
pub struct Subscription {
    release: Option<Release>,
}

impl Subscription {
    /// Create a handle that runs `release` when dropped
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle with nothing to release (listener already finished)
    pub fn empty() -> Self {
        Self { release: None }
    }

    /// Whether dropping this handle still has something to release
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Release the listener now
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
