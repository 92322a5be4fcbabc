//! Miscellaneous utility structs and functions.

mod callback;
mod errors;

use derive_more::From;
use futures::future::AbortHandle;

#[doc(inline)]
pub use self::{
    callback::Callback,
    errors::{Caused, EngineError, HandlerDetachedError},
};

/// Upgrades the provided [`Weak`] reference, mapping it to a [`Result`] with
/// a [`HandlerDetachedError`], and invokes [`Into::into`] on the error if a
/// concrete error type is provided.
///
/// [`Weak`]: std::rc::Weak
macro_rules! upgrade_or_detached {
    ($v:expr) => {{
        $v.upgrade()
            .ok_or_else(|| tracerr::new!($crate::utils::HandlerDetachedError))
    }};
    ($v:expr, $err:ty) => {{
        $v.upgrade().ok_or_else(|| {
            <$err>::from(tracerr::new!($crate::utils::HandlerDetachedError))
        })
    }};
}

/// Wrapper around [`AbortHandle`] which aborts the spawned task on [`Drop`].
#[derive(Debug, From)]
pub struct TaskHandle(AbortHandle);

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}
