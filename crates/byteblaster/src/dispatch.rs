// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Completed-file dispatch.
//!
//! Subscribers implement [`FileHandler`] (or wrap a closure in
//! [`ClosureHandler`]) and register with the client. On each completion the
//! registry invokes every handler with the same [`CompletedFile`] and only
//! returns once all of them have settled, so a subsequent file is never
//! dispatched while handlers are still working on the previous one.
//!
//! Handler failures are isolated: an `Err` (or a panic) in one handler is
//! logged and never disturbs its siblings or the pipeline. Handlers are
//! deduplicated by `Arc` identity and invoked in subscription order.
//!
//! Delivery is at-least-once within a process lifetime: the assembler's
//! duplicate cache covers wire-level retransmission, not restarts, so
//! handlers should be idempotent.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::protocol::models::CompletedFile;

/// Error type handlers may return; contents are logged, not interpreted.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A completed-file subscriber.
///
/// Called from the client's I/O thread; implementations should return
/// promptly and must treat the file as read-only.
pub trait FileHandler: Send + Sync {
    /// Handle one reassembled file.
    fn on_completed_file(&self, file: &CompletedFile) -> Result<(), HandlerError>;
}

/// Closure adapter for simple subscribers.
///
/// # Example
///
/// ```
/// use byteblaster::{ClosureHandler, CompletedFile, FileHandler};
///
/// let handler = ClosureHandler::new(|file: &CompletedFile| {
///     println!("{} ({} bytes)", file.filename, file.data.len());
///     Ok(())
/// });
/// # let _ = &handler;
/// ```
pub struct ClosureHandler<F>
where
    F: Fn(&CompletedFile) -> Result<(), HandlerError> + Send + Sync,
{
    callback: F,
}

impl<F> ClosureHandler<F>
where
    F: Fn(&CompletedFile) -> Result<(), HandlerError> + Send + Sync,
{
    /// Wrap a closure as a handler.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> FileHandler for ClosureHandler<F>
where
    F: Fn(&CompletedFile) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_completed_file(&self, file: &CompletedFile) -> Result<(), HandlerError> {
        (self.callback)(file)
    }
}

/// Ordered list of unique subscribers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn FileHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same `Arc` twice is a no-op.
    pub fn subscribe(&mut self, handler: Arc<dyn FileHandler>) {
        if !self.handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            self.handlers.push(handler);
            log::debug!("[DISPATCH] Handler subscribed ({} total)", self.handlers.len());
        }
    }

    /// Remove a handler; no-op when absent.
    pub fn unsubscribe(&mut self, handler: &Arc<dyn FileHandler>) {
        let before = self.handlers.len();
        self.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        if self.handlers.len() != before {
            log::debug!(
                "[DISPATCH] Handler unsubscribed ({} total)",
                self.handlers.len()
            );
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver one file to every handler; returns the failure count.
    pub fn dispatch(&self, file: &CompletedFile) -> usize {
        let mut failures = 0;

        for handler in &self.handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_completed_file(file))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    log::warn!("[DISPATCH] Handler failed for {}: {e}", file.filename);
                }
                Err(_) => {
                    failures += 1;
                    log::error!("[DISPATCH] Handler panicked for {}", file.filename);
                }
            }
        }

        failures
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn file() -> CompletedFile {
        CompletedFile {
            filename: "test.txt".to_string(),
            data: b"payload".to_vec(),
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn FileHandler> {
        Arc::new(ClosureHandler::new(move |_file: &CompletedFile| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[test]
    fn test_dispatch_invokes_all_handlers() {
        let mut registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.subscribe(counting_handler(counter.clone()));
        registry.subscribe(counting_handler(counter.clone()));

        assert_eq!(registry.dispatch(&file()), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_same_arc_is_idempotent() {
        let mut registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(counter.clone());

        registry.subscribe(handler.clone());
        registry.subscribe(handler);
        assert_eq!(registry.len(), 1);

        registry.dispatch(&file());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_handler() {
        let mut registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(counter.clone());

        registry.subscribe(handler.clone());
        registry.unsubscribe(&handler);
        assert!(registry.is_empty());

        registry.dispatch(&file());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let mut registry = HandlerRegistry::new();
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));
        registry.unsubscribe(&handler);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(ClosureHandler::new(|_: &CompletedFile| {
            Err("simulated failure".into())
        })));
        registry.subscribe(counting_handler(counter.clone()));

        assert_eq!(registry.dispatch(&file()), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panics_are_contained() {
        let mut registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(ClosureHandler::new(|_: &CompletedFile| {
            panic!("handler bug")
        })));
        registry.subscribe(counting_handler(counter.clone()));

        assert_eq!(registry.dispatch(&file()), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_see_same_file() {
        let mut registry = HandlerRegistry::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            registry.subscribe(Arc::new(ClosureHandler::new(move |f: &CompletedFile| {
                seen.lock().push(f.clone());
                Ok(())
            })));
        }

        registry.dispatch(&file());
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }
}
