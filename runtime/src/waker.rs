// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Waker
//!
//! Single-shot wake callback. The first [`Waker::wake`] runs the callback,
//! later calls do nothing until [`Waker::reset`]. A waker converts into a
//! [`std::task::Waker`], so any std future can be polled with it.
//!

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::Wake,
};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct WakerInner {
    callback: Option<Callback>,
    woken: AtomicBool,
}

impl WakerInner {
    fn fire(&self) {
        if self.woken.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = &self.callback {
            callback();
        }
    }
}

impl Wake for WakerInner {
    fn wake(self: Arc<Self>) {
        self.fire();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.fire();
    }
}

/// Wake callback with an idempotent `wake`.
pub struct Waker {
    inner: Arc<WakerInner>,
}

impl Waker {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_callback(Some(Arc::new(callback)))
    }

    /// Waker without a callback.
    pub fn noop() -> Self {
        Self::with_callback(None)
    }

    fn with_callback(callback: Option<Callback>) -> Self {
        Self {
            inner: Arc::new(WakerInner {
                callback,
                woken: AtomicBool::new(false),
            }),
        }
    }

    /// Runs the callback, unless this waker was already woken.
    pub fn wake(&self) {
        self.inner.fire();
    }

    pub fn is_woken(&self) -> bool {
        self.inner.woken.load(Ordering::Acquire)
    }

    /// Arms the waker again.
    pub fn reset(&self) {
        self.inner.woken.store(false, Ordering::Release);
    }

    /// std waker sharing this waker's flag.
    pub fn to_std(&self) -> std::task::Waker {
        std::task::Waker::from(self.inner.clone())
    }
}

/// The clone shares the callback but starts with a fresh flag.
impl Clone for Waker {
    fn clone(&self) -> Self {
        Self::with_callback(self.inner.callback.clone())
    }
}

impl From<Waker> for std::task::Waker {
    fn from(waker: Waker) -> Self {
        std::task::Waker::from(waker.inner)
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker")
            .field("woken", &self.is_woken())
            .finish()
    }
}
