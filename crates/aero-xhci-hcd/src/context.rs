//! Software records for in-flight descriptors.

use std::fmt;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Result, XhciError};
use crate::request::UsbRequest;
use crate::transfer_ring::TrbHandle;
use crate::trb::Trb;

/// Deferred result of a submitted descriptor: resolves with the completion event TRB.
pub type TrbFuture = BoxFuture<'static, Result<Trb>>;

enum Completer {
    None,
    Request(UsbRequest),
    Event(oneshot::Sender<Result<Trb>>),
}

/// Binds one in-flight descriptor to whoever is waiting for it.
///
/// A context is owned by its ring's pending FIFO from submission until the matching completion
/// event pops it; from then on it belongs to the completion path. A context that is dropped
/// without being resolved completes its waiter with [`XhciError::Canceled`].
pub struct TrbContext {
    /// Generation of the ring this context was built against.
    pub token: u64,
    pub(crate) trb: Option<TrbHandle>,
    pub(crate) first_trb: Option<TrbHandle>,
    completer: Completer,
}

impl fmt::Debug for TrbContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waiter = match &self.completer {
            Completer::None => "none",
            Completer::Request(_) => "request",
            Completer::Event(_) => "event",
        };
        f.debug_struct("TrbContext")
            .field("token", &self.token)
            .field("trb", &self.trb)
            .field("first_trb", &self.first_trb)
            .field("waiter", &waiter)
            .finish()
    }
}

impl TrbContext {
    /// A context nobody waits on.
    pub fn new(token: u64) -> Self {
        Self::with_completer(token, Completer::None)
    }

    pub fn for_request(token: u64, request: UsbRequest) -> Self {
        Self::with_completer(token, Completer::Request(request))
    }

    fn with_completer(token: u64, completer: Completer) -> Self {
        Self {
            token,
            trb: None,
            first_trb: None,
            completer,
        }
    }

    /// A context paired with a future that resolves when the context does.
    pub fn with_future(token: u64) -> (Self, TrbFuture) {
        let (tx, rx) = oneshot::channel();
        let context = Self::with_completer(token, Completer::Event(tx));
        let future = rx.map(|res| res.unwrap_or(Err(XhciError::Canceled))).boxed();
        (context, future)
    }

    /// Marks `first` as the first descriptor of the TD this context closes.
    pub fn starting_at(mut self, first: TrbHandle) -> Self {
        self.first_trb = Some(first);
        self
    }

    /// The descriptor whose completion resolves this context.
    pub fn trb(&self) -> Option<TrbHandle> {
        self.trb
    }

    /// First descriptor of the transaction this context closes.
    pub fn first_trb(&self) -> Option<TrbHandle> {
        self.first_trb
    }

    pub fn request(&self) -> Option<&UsbRequest> {
        match &self.completer {
            Completer::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn take_request(&mut self) -> Option<UsbRequest> {
        match std::mem::replace(&mut self.completer, Completer::None) {
            Completer::Request(request) => Some(request),
            other => {
                self.completer = other;
                None
            }
        }
    }

    /// Resolves the waiter with a completion event.
    ///
    /// Success and short-packet completions succeed; requests report the bytes actually moved
    /// (requested length minus the event's residual). Any other completion code fails the waiter
    /// with [`XhciError::Completion`].
    pub fn resolve(mut self, event: &Trb) {
        let code = event.completion_code();
        match std::mem::replace(&mut self.completer, Completer::None) {
            Completer::None => {}
            Completer::Request(request) => {
                let status = if code.is_success() {
                    let actual = request.length.saturating_sub(u64::from(event.event_residual()));
                    Ok(actual as usize)
                } else {
                    Err(XhciError::Completion(code))
                };
                request.complete(status);
            }
            Completer::Event(tx) => {
                let result = if code.is_success() {
                    Ok(*event)
                } else {
                    Err(XhciError::Completion(code))
                };
                // The receiver may have been dropped; that is how waiters cancel.
                let _ = tx.send(result);
            }
        }
    }

    pub fn fail(mut self, err: XhciError) {
        self.fail_in_place(err);
    }

    fn fail_in_place(&mut self, err: XhciError) {
        match std::mem::replace(&mut self.completer, Completer::None) {
            Completer::None => {}
            Completer::Request(request) => request.fail(err),
            Completer::Event(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

impl Drop for TrbContext {
    fn drop(&mut self) {
        self.fail_in_place(XhciError::Canceled);
    }
}
