//! Handles for operations that complete when the broker replies
//!
//! Every synchronous channel operation returns a deferred: a handle
//! carrying the continuations to run when the matching `*-ok` frame or an
//! error arrives. Callbacks chain builder style:
//!
//! ```ignore
//! channel
//!     .declare_queue("jobs", flags::DURABLE, Table::new())
//!     .on_success(|name, messages, consumers| { /* declared */ })
//!     .on_error(|message| { /* rejected */ });
//! ```
//!
//! Exactly one terminal chain runs per deferred: success or error, followed
//! by the finalizer. A deferred created for an operation that already
//! failed (for instance a publish on a closed channel) runs its error
//! callback synchronously at registration.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub(crate) enum State<A> {
    Pending,
    /// Carries the success arguments until a callback picks them up, so
    /// an operation that completes synchronously (nowait) still reaches a
    /// callback registered right after the call returns
    Succeeded(Option<A>),
    Failed(String),
}

/// Shared continuation slots of a deferred operation. `A` is the argument
/// tuple the success callback receives.
pub(crate) struct Core<A: 'static> {
    pub(crate) state: State<A>,
    success: Option<Box<dyn FnOnce(A)>>,
    error: Option<Box<dyn FnOnce(&str)>>,
    finalize: Option<Box<dyn FnOnce(&str)>>,
}

impl<A> Core<A> {
    pub(crate) fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Core {
            state: State::Pending,
            success: None,
            error: None,
            finalize: None,
        }))
    }

    pub(crate) fn failed(message: impl Into<String>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Core {
            state: State::Failed(message.into()),
            success: None,
            error: None,
            finalize: None,
        }))
    }
}

/// Complete a deferred successfully and run its callbacks. With no
/// success callback registered yet the arguments are kept for a late
/// registration.
pub(crate) fn report_success<A>(core: &Rc<RefCell<Core<A>>>, arguments: A) {
    let finalize;
    let invoke = {
        let mut inner = core.borrow_mut();
        if !matches!(inner.state, State::Pending) {
            return;
        }
        finalize = inner.finalize.take();
        match inner.success.take() {
            Some(callback) => {
                inner.state = State::Succeeded(None);
                Some((callback, arguments))
            }
            None => {
                inner.state = State::Succeeded(Some(arguments));
                None
            }
        }
    };
    if let Some((callback, arguments)) = invoke {
        callback(arguments);
    }
    if let Some(callback) = finalize {
        callback("");
    }
}

/// Fail a deferred and run its callbacks
pub(crate) fn report_error<A>(core: &Rc<RefCell<Core<A>>>, message: &str) {
    let (error, finalize) = {
        let mut inner = core.borrow_mut();
        if !matches!(inner.state, State::Pending) {
            return;
        }
        inner.state = State::Failed(message.to_owned());
        (inner.error.take(), inner.finalize.take())
    };
    if let Some(callback) = error {
        callback(message);
    }
    if let Some(callback) = finalize {
        callback(message);
    }
}

/// Fail a deferred even when it already succeeded. Long lived deferreds
/// (consumers, confirm mode, return handlers) complete once when set up
/// but still have to surface the channel error that ends them.
pub(crate) fn force_error<A>(core: &Rc<RefCell<Core<A>>>, message: &str) {
    let (error, finalize) = {
        let mut inner = core.borrow_mut();
        if matches!(inner.state, State::Failed(_)) {
            return;
        }
        inner.state = State::Failed(message.to_owned());
        (inner.error.take(), inner.finalize.take())
    };
    if let Some(callback) = error {
        callback(message);
    }
    if let Some(callback) = finalize {
        callback(message);
    }
}

/// Store a success callback. If the operation already succeeded with its
/// arguments still unclaimed (nowait operations), the callback runs
/// immediately.
pub(crate) fn register_success<A>(core: &Rc<RefCell<Core<A>>>, callback: impl FnOnce(A) + 'static) {
    let arguments = {
        let mut inner = core.borrow_mut();
        match &mut inner.state {
            State::Pending => {
                inner.success = Some(Box::new(callback));
                return;
            }
            State::Succeeded(arguments) => match arguments.take() {
                Some(arguments) => arguments,
                None => return,
            },
            State::Failed(_) => return,
        }
    };
    callback(arguments);
}

/// Store an error callback. If the deferred already failed the callback
/// runs immediately, so an operation that fails synchronously still
/// reaches the caller.
pub(crate) fn register_error<A>(core: &Rc<RefCell<Core<A>>>, callback: impl FnOnce(&str) + 'static) {
    let message = {
        let mut inner = core.borrow_mut();
        match &inner.state {
            State::Pending => {
                inner.error = Some(Box::new(callback));
                return;
            }
            State::Failed(message) => message.clone(),
            State::Succeeded(_) => return,
        }
    };
    callback(&message);
}

/// Store a finalizer, which runs exactly once whatever the outcome. On an
/// already completed deferred it runs immediately.
pub(crate) fn register_finalize<A>(
    core: &Rc<RefCell<Core<A>>>,
    callback: impl FnOnce(&str) + 'static,
) {
    let message = {
        let mut inner = core.borrow_mut();
        match &inner.state {
            State::Pending => {
                inner.finalize = Some(Box::new(callback));
                return;
            }
            State::Succeeded(_) => String::new(),
            State::Failed(message) => message.clone(),
        }
    };
    callback(&message);
}

fn debug_state<A>(core: &Rc<RefCell<Core<A>>>) -> &'static str {
    match core.borrow().state {
        State::Pending => "pending",
        State::Succeeded(_) => "succeeded",
        State::Failed(_) => "failed",
    }
}

/// Handle for operations whose confirmation carries no arguments
#[derive(Clone)]
pub struct Deferred {
    core: Rc<RefCell<Core<()>>>,
}

impl Deferred {
    pub(crate) fn pending(core: Rc<RefCell<Core<()>>>) -> Self {
        Deferred { core }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Deferred {
            core: Core::failed(message),
        }
    }

    /// Run a callback when the operation succeeds
    pub fn on_success(self, callback: impl FnOnce() + 'static) -> Self {
        register_success(&self.core, move |()| callback());
        self
    }

    /// Run a callback when the operation fails
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_error(&self.core, callback);
        self
    }

    /// Run a callback when the operation completes either way; the message
    /// is empty on success
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_finalize(&self.core, callback);
        self
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deferred").field(&debug_state(&self.core)).finish()
    }
}

/// Handle for a queue declaration
#[derive(Clone)]
pub struct DeferredQueue {
    core: Rc<RefCell<Core<(String, u32, u32)>>>,
}

impl DeferredQueue {
    pub(crate) fn pending(core: Rc<RefCell<Core<(String, u32, u32)>>>) -> Self {
        DeferredQueue { core }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        DeferredQueue {
            core: Core::failed(message),
        }
    }

    /// Run a callback with the declared queue's name, message count and
    /// consumer count
    pub fn on_success(self, callback: impl FnOnce(&str, u32, u32) + 'static) -> Self {
        register_success(&self.core, move |(name, messages, consumers): (String, u32, u32)| {
            callback(&name, messages, consumers)
        });
        self
    }

    /// Run a callback when the declaration fails
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_error(&self.core, callback);
        self
    }

    /// Run a callback when the operation completes either way
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_finalize(&self.core, callback);
        self
    }
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredQueue").field(&debug_state(&self.core)).finish()
    }
}

/// Handle for queue removal and purging, which report a message count
#[derive(Clone)]
pub struct DeferredDelete {
    core: Rc<RefCell<Core<(u32,)>>>,
}

impl DeferredDelete {
    pub(crate) fn pending(core: Rc<RefCell<Core<(u32,)>>>) -> Self {
        DeferredDelete { core }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        DeferredDelete {
            core: Core::failed(message),
        }
    }

    /// Run a callback with the number of messages deleted or purged
    pub fn on_success(self, callback: impl FnOnce(u32) + 'static) -> Self {
        register_success(&self.core, move |(count,): (u32,)| callback(count));
        self
    }

    /// Run a callback when the operation fails
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_error(&self.core, callback);
        self
    }

    /// Run a callback when the operation completes either way
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_finalize(&self.core, callback);
        self
    }
}

impl fmt::Debug for DeferredDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredDelete").field(&debug_state(&self.core)).finish()
    }
}

/// Handle for cancelling a consumer
#[derive(Clone)]
pub struct DeferredCancel {
    core: Rc<RefCell<Core<(String,)>>>,
}

impl DeferredCancel {
    pub(crate) fn pending(core: Rc<RefCell<Core<(String,)>>>) -> Self {
        DeferredCancel { core }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        DeferredCancel {
            core: Core::failed(message),
        }
    }

    /// Run a callback with the tag of the consumer that stopped
    pub fn on_success(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_success(&self.core, move |(tag,): (String,)| callback(&tag));
        self
    }

    /// Run a callback when the cancel fails
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_error(&self.core, callback);
        self
    }

    /// Run a callback when the operation completes either way
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        register_finalize(&self.core, callback);
        self
    }
}

impl fmt::Debug for DeferredCancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredCancel").field(&debug_state(&self.core)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn success_runs_callbacks_once() {
        let hits = Rc::new(Cell::new(0));
        let finalized = Rc::new(Cell::new(0));
        let core = Core::new();
        {
            let hits = hits.clone();
            let finalized = finalized.clone();
            let _ = Deferred::pending(core.clone())
                .on_success(move || hits.set(hits.get() + 1))
                .on_finalize(move |message| {
                    assert!(message.is_empty());
                    finalized.set(finalized.get() + 1);
                });
        }
        report_success(&core, ());
        report_success(&core, ());
        report_error(&core, "late");
        assert_eq!(hits.get(), 1);
        assert_eq!(finalized.get(), 1);
    }

    #[test]
    fn failed_deferred_fires_error_at_registration() {
        let seen = Rc::new(RefCell::new(String::new()));
        let seen2 = seen.clone();
        let _ = Deferred::failed("channel is no longer usable")
            .on_error(move |message| *seen2.borrow_mut() = message.to_owned());
        assert_eq!(&*seen.borrow(), "channel is no longer usable");
    }

    #[test]
    fn finalize_gets_the_error_message() {
        let seen = Rc::new(RefCell::new(String::new()));
        let seen2 = seen.clone();
        let core = Core::<()>::new();
        register_finalize(&core, move |message| *seen2.borrow_mut() = message.to_owned());
        report_error(&core, "boom");
        assert_eq!(&*seen.borrow(), "boom");
    }
}
