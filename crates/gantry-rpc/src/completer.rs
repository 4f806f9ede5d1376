//! Promise pairing.
//!
//! A remote call transports a `[resolve, reject]` pair; whichever side of
//! the pair fires first settles the call and silently invalidates the
//! other. Both surfaces are views over one [`Completer`] whose state is a
//! single atomic compare-and-swap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use gantry_core::{Callable, Error, Result, RpcValue};

const PENDING: u8 = 0;
const RESOLVED: u8 = 1;
const REJECTED: u8 = 2;

/// Single-settlement completion cell.
pub struct Completer {
    state: AtomicU8,
    tx: Mutex<Option<oneshot::Sender<Result<RpcValue>>>>,
}

impl Completer {
    /// Creates a completer and the receiver its settlement is delivered
    /// on.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Result<RpcValue>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                state: AtomicU8::new(PENDING),
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn settle(&self, target: u8, outcome: Result<RpcValue>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
        true
    }

    /// Resolves with a value; returns false if already settled.
    pub fn resolve(&self, value: RpcValue) -> bool {
        self.settle(RESOLVED, Ok(value))
    }

    /// Rejects with an error; returns false if already settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(REJECTED, Err(error))
    }

    /// True once either surface fired.
    pub fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Builds the `[resolve, reject]` callable pair over this completer.
    ///
    /// The resolve surface takes its first argument as the value; the
    /// reject surface turns its first argument into an error, preserving
    /// a transported kind when present.
    pub fn surfaces(self: &Arc<Self>) -> (Callable, Callable) {
        let resolver = Arc::clone(self);
        let resolve = Callable::named("resolve", move |mut args| {
            let completer = Arc::clone(&resolver);
            Box::pin(async move {
                let value = if args.is_empty() {
                    RpcValue::Null
                } else {
                    args.swap_remove(0)
                };
                completer.resolve(value);
                Ok(RpcValue::Null)
            })
        });
        let rejecter = Arc::clone(self);
        let reject = Callable::named("reject", move |args| {
            let completer = Arc::clone(&rejecter);
            Box::pin(async move {
                completer.reject(error_from_value(args.first()));
                Ok(RpcValue::Null)
            })
        });
        (resolve, reject)
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            RESOLVED => "resolved",
            REJECTED => "rejected",
            _ => "pending",
        };
        write!(f, "Completer({state})")
    }
}

/// Reconstructs a transported error, recovering the original kind from a
/// `"Kind: message"` fault string when possible.
pub fn error_from_value(value: Option<&RpcValue>) -> Error {
    let message = match value {
        Some(RpcValue::Fault(msg)) => msg.clone(),
        Some(RpcValue::String(msg)) => msg.clone(),
        Some(other) => format!("{other:?}"),
        None => "remote call rejected".to_string(),
    };
    if let Some((kind, rest)) = message.split_once(": ") {
        let wire = gantry_core::WireError {
            kind: kind.to_string(),
            message: rest.to_string(),
        };
        let parsed = Error::from_wire(&wire);
        if parsed.kind() == kind {
            return parsed;
        }
    }
    Error::Internal(message)
}

/// Formats an error for transport so the receiving side can recover its
/// kind via [`error_from_value`].
pub fn error_to_fault(error: &Error) -> String {
    format!("{}: {}", error.kind(), error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_settlement_wins() {
        let (completer, rx) = Completer::new();
        assert!(completer.resolve(RpcValue::from("ok")));
        assert!(!completer.reject(Error::Internal("late".into())));
        assert_eq!(rx.await.unwrap().unwrap(), RpcValue::from("ok"));
    }

    #[tokio::test]
    async fn reject_surface_invalidates_resolve_surface() {
        let (completer, rx) = Completer::new();
        let (resolve, reject) = completer.surfaces();
        reject
            .call(vec![RpcValue::Fault("NotFound: service lab/echo".into())])
            .await
            .unwrap();
        resolve.call(vec![RpcValue::from("too late")]).await.unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn fault_kind_round_trip() {
        let err = Error::Forbidden("workspace lab".into());
        let fault = error_to_fault(&err);
        let back = error_from_value(Some(&RpcValue::Fault(fault)));
        assert_eq!(back.kind(), "Forbidden");
    }

    #[test]
    fn unknown_fault_prefix_becomes_internal() {
        let back = error_from_value(Some(&RpcValue::Fault("weird text".into())));
        assert_eq!(back.kind(), "InternalError");
    }
}
