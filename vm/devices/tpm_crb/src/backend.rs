// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The asynchronous TPM command executor boundary.
//!
//! The device hands raw command bytes to a [`TpmBackend`] and carries on; the
//! executor delivers the outcome later, from whatever execution context it
//! likes, by posting a [`Completion`] through the [`CompletionSender`] it was
//! given at construction. Completions land in a single-consumer queue that
//! the owning device drains on its poll path, so every state transition is
//! evaluated serially no matter how many threads the executor uses
//! internally.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use thiserror::Error;

/// TPM specification families a backend can implement.
///
/// The CRB interface is defined for TPM 2.0 only; a backend reporting
/// [`TpmVersion::V1_2`] is rejected at device creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TpmVersion {
    V1_2,
    V2_0,
}

/// Token identifying one command submission.
///
/// Handles are never reused within a device's lifetime, which is what lets a
/// completion that arrives after a reset be recognized as stale and dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandHandle(pub(crate) u64);

/// Failure reported by the backend for a submission.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("TPM backend is unavailable")]
    Unavailable,
    #[error("TPM backend rejected the command as malformed")]
    Malformed,
    #[error("TPM backend execution fault")]
    ExecutionFault(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Outcome of one submission, produced exactly once per [`CommandHandle`].
#[derive(Debug)]
pub struct Completion {
    pub handle: CommandHandle,
    pub result: Result<Vec<u8>, BackendError>,
}

/// An asynchronous TPM command executor.
pub trait TpmBackend: Send {
    /// Hands `command` to the executor.
    ///
    /// The outcome arrives later as a [`Completion`] carrying `handle`. At
    /// most one submission is outstanding at a time; the device enforces
    /// this. A synchronous error is treated by the device as an immediate
    /// failure completion.
    fn submit(&mut self, handle: CommandHandle, command: &[u8]) -> Result<(), BackendError>;

    /// Requests cancellation of the outstanding command.
    ///
    /// Best-effort: the executor may still complete the command normally.
    /// The eventual completion, whatever its result, acknowledges the
    /// cancellation.
    fn cancel(&mut self);

    /// The specification family this executor implements.
    fn version(&self) -> TpmVersion;
}

struct Mailbox {
    messages: VecDeque<Completion>,
    waker: Option<Waker>,
}

/// Producer half of the completion queue, held by the backend.
///
/// Cloneable and sendable across threads; posting a completion wakes the
/// device's stored waker so its poll path runs again.
#[derive(Clone)]
pub struct CompletionSender {
    inner: Arc<Mutex<Mailbox>>,
}

impl CompletionSender {
    pub fn complete(&self, completion: Completion) {
        let waker = {
            let mut mailbox = self.inner.lock();
            mailbox.messages.push_back(completion);
            mailbox.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Consumer half of the completion queue, owned by the device.
pub struct CompletionQueue {
    inner: Arc<Mutex<Mailbox>>,
}

impl CompletionQueue {
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Completion> {
        let mut mailbox = self.inner.lock();
        match mailbox.messages.pop_front() {
            Some(completion) => Poll::Ready(completion),
            None => {
                mailbox.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Creates the completion queue connecting a backend to the device that owns
/// it.
pub fn completion_channel() -> (CompletionSender, CompletionQueue) {
    let inner = Arc::new(Mutex::new(Mailbox {
        messages: VecDeque::new(),
        waker: None,
    }));
    (
        CompletionSender {
            inner: inner.clone(),
        },
        CompletionQueue { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    #[test]
    fn completions_drain_in_order() {
        let (sender, mut queue) = completion_channel();
        let mut cx = Context::from_waker(noop_waker_ref());

        assert!(queue.poll_next(&mut cx).is_pending());

        for n in 0..3 {
            sender.complete(Completion {
                handle: CommandHandle(n),
                result: Ok(vec![n as u8]),
            });
        }

        for n in 0..3 {
            let Poll::Ready(completion) = queue.poll_next(&mut cx) else {
                panic!("queue should hold a completion");
            };
            assert_eq!(completion.handle, CommandHandle(n));
        }
        assert!(queue.poll_next(&mut cx).is_pending());
    }

    #[test]
    fn post_wakes_stored_waker() {
        let (sender, mut queue) = completion_channel();

        let woken = Arc::new(AtomicBool::new(false));
        let waker = {
            let woken = woken.clone();
            waker_fn(move || woken.store(true, Ordering::SeqCst))
        };
        let mut cx = Context::from_waker(&waker);

        assert!(queue.poll_next(&mut cx).is_pending());
        sender.complete(Completion {
            handle: CommandHandle(0),
            result: Err(BackendError::Unavailable),
        });
        assert!(woken.load(Ordering::SeqCst));
    }

    fn waker_fn(f: impl Fn() + Send + Sync + 'static) -> Waker {
        use std::task::Wake;

        struct FnWake<F>(F);
        impl<F: Fn() + Send + Sync + 'static> Wake for FnWake<F> {
            fn wake(self: Arc<Self>) {
                self.0();
            }
        }
        Waker::from(Arc::new(FnWake(f)))
    }
}
