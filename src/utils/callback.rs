//! Somewhat convenient wrappers around optional handler functions.

use std::cell::RefCell;

/// Wrapper around an optional single argument handler function.
pub struct Callback<A>(RefCell<Option<Box<dyn Fn(A)>>>);

impl<A> Default for Callback<A> {
    fn default() -> Self {
        Self(RefCell::new(None))
    }
}

impl<A> Callback<A> {
    /// Sets the inner handler function.
    pub fn set_func<F>(&self, f: F)
    where
        F: Fn(A) + 'static,
    {
        self.0.borrow_mut().replace(Box::new(f));
    }

    /// Indicates whether the handler is set.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Invokes the handler if any.
    ///
    /// Returns `true` if the handler is set and was invoked.
    pub fn call(&self, arg: A) -> bool {
        self.0.borrow().as_ref().map_or(false, |f| {
            f(arg);
            true
        })
    }
}

impl Callback<()> {
    /// Invokes the argless handler if any.
    #[inline]
    pub fn call0(&self) -> bool {
        self.call(())
    }
}
