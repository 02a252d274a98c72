//! Generic read-through cache for derived views of the static feed,
//! repopulated whenever the owning database broadcasts a refresh.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, RwLock};
use std::thread;

use crate::error::Result;

/// Pass-through transform for caches that serve the source data unchanged.
pub fn identity<T>(value: T) -> Result<T> {
    Ok(value)
}

/// A cached view built by `transform(source())`.
///
/// The first load happens on construction; a background thread rebuilds the
/// view on every refresh signal. When the source or the transform fails the
/// view is replaced with the empty sentinel and the error is logged, so
/// readers never observe half-refreshed data.
pub struct DerivedCache<Out> {
    view: Arc<RwLock<Out>>,
}

impl<Out> DerivedCache<Out>
where
    Out: Clone + Send + Sync + 'static,
{
    pub fn new<In, S, T>(
        source: S,
        transform: T,
        empty: Out,
        refresh_signal: Receiver<()>,
    ) -> Self
    where
        S: Fn() -> Result<In> + Send + 'static,
        T: Fn(In) -> Result<Out> + Send + 'static,
    {
        let view = Arc::new(RwLock::new(empty.clone()));

        reload(&view, &source, &transform, &empty);

        let worker_view = Arc::clone(&view);
        thread::spawn(move || {
            // Ends when the signal sender side is dropped.
            for () in refresh_signal {
                reload(&worker_view, &source, &transform, &empty);
            }
        });

        DerivedCache { view }
    }

    /// The current view, cloned from under the reader lock.
    pub fn get(&self) -> Out {
        match self.view.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn reload<In, Out, S, T>(view: &Arc<RwLock<Out>>, source: &S, transform: &T, empty: &Out)
where
    Out: Clone,
    S: Fn() -> Result<In>,
    T: Fn(In) -> Result<Out>,
{
    let next = match source().and_then(|raw| transform(raw)) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("derived cache refresh failed, serving empty view: {e}");
            empty.clone()
        }
    };

    match view.write() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}
