//! Single-shot completion handles and cooperative forking
//!
//! A [`Completion`] is the value-or-error handle that threads through
//! dispatch: producers complete it exactly once, consumers await it, and
//! observers register continuations that run in order when it turns
//! terminal. The terminal transition is monotonic; whichever of
//! `complete`, `fail`, `cancel`, or a deadline lapse arrives first wins,
//! and every later transition is a silent no-op.
//!
//! Logical operations suspend only at explicit `.await` points; [`fork`]
//! launches a future on the shared worker pool and hands back the
//! completion it will resolve. A [`TaskEnv`] carries per-frame context
//! explicitly: forks either inherit a deep copy or start from
//! [`TaskEnv::reset`].

use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Terminal state kind of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Completed with a value
    Succeeded,
    /// Completed with an error
    Failed,
    /// Cancelled before completion
    Cancelled,
}

type Observer = Box<dyn FnOnce(TerminalKind) + Send>;

enum State<T> {
    Pending(Vec<Observer>),
    Done {
        kind: TerminalKind,
        value: Option<T>,
        error: Option<Error>,
        taken: bool,
    },
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Single-shot value-or-error completion handle
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Completion<T> {
    /// Create a pending completion
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a pending completion whose state flips to `Failed(Timeout)`
    /// when `deadline` lapses before any other transition. Requires a tokio
    /// runtime.
    pub fn with_deadline(deadline: Duration) -> Self {
        let completion = Self::new();
        completion.arm_deadline(deadline);
        completion
    }

    /// Arm a deadline on an existing handle
    pub fn arm_deadline(&self, deadline: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if handle.fail(Error::Timeout) {
                tracing::debug!("completion deadline lapsed after {deadline:?}");
            }
        });
    }

    /// Transition `Pending -> Succeeded(value)`. Returns false (and logs)
    /// when the handle was already terminal.
    pub fn complete(&self, value: T) -> bool {
        self.transition(TerminalKind::Succeeded, Some(value), None)
    }

    /// Transition `Pending -> Failed(error)`
    pub fn fail(&self, error: Error) -> bool {
        self.transition(TerminalKind::Failed, None, Some(error))
    }

    /// Transition `Pending -> Cancelled`
    pub fn cancel(&self) -> bool {
        self.transition(TerminalKind::Cancelled, None, None)
    }

    fn transition(&self, kind: TerminalKind, value: Option<T>, error: Option<Error>) -> bool {
        let observers = {
            let mut state = self.inner.state.lock();
            match *state {
                State::Pending(ref mut observers) => {
                    let observers = std::mem::take(observers);
                    *state = State::Done {
                        kind,
                        value,
                        error,
                        taken: false,
                    };
                    observers
                }
                State::Done { kind: existing, .. } => {
                    tracing::debug!(
                        "ignoring {kind:?} transition on completion already {existing:?}"
                    );
                    return false;
                }
            }
        };
        // terminal state is visible before any observer runs
        self.inner.notify.notify_waiters();
        for observer in observers {
            observer(kind);
        }
        true
    }

    /// Register a continuation. Runs immediately on the current worker when
    /// the handle is already terminal; otherwise runs, in registration
    /// order, right after the terminal transition.
    pub fn when_done(&self, observer: impl FnOnce(TerminalKind) + Send + 'static) {
        let mut observer: Option<Observer> = Some(Box::new(observer));
        let terminal = {
            let mut state = self.inner.state.lock();
            match *state {
                State::Pending(ref mut observers) => {
                    observers.extend(observer.take());
                    None
                }
                State::Done { kind, .. } => Some(kind),
            }
        };
        if let (Some(kind), Some(observer)) = (terminal, observer) {
            observer(kind);
        }
    }

    /// True while no terminal transition has happened
    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Pending(_))
    }

    /// Terminal kind, if terminal
    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match *self.inner.state.lock() {
            State::Pending(_) => None,
            State::Done { kind, .. } => Some(kind),
        }
    }

    /// Await the terminal transition without consuming the value
    pub async fn done(&self) -> TerminalKind {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a transition racing this check
            // still wakes us
            notified.as_mut().enable();
            if let Some(kind) = self.terminal_kind() {
                return kind;
            }
            notified.await;
        }
    }

    /// Await the terminal transition and consume the return value,
    /// re-raising the error on failure. A completion has a single value
    /// consumer; a second `wait` on a clone reports the value as consumed.
    pub async fn wait(self) -> Result<T> {
        self.done().await;
        let mut state = self.inner.state.lock();
        match *state {
            State::Done {
                kind,
                ref mut value,
                ref mut error,
                ref mut taken,
            } => {
                if *taken {
                    return Err(Error::generic("completion value already consumed"));
                }
                *taken = true;
                match kind {
                    TerminalKind::Succeeded => value
                        .take()
                        .ok_or_else(|| Error::generic("completion value already consumed")),
                    TerminalKind::Failed => {
                        Err(error.take().unwrap_or_else(|| Error::generic("completion failed")))
                    }
                    TerminalKind::Cancelled => Err(Error::Cancelled),
                }
            }
            State::Pending(_) => unreachable!("done() returned while pending"),
        }
    }

    /// Blocking wait for callers outside the cooperative model. Parks the
    /// OS thread; discouraged inside async code.
    pub fn wait_sync(self) -> Result<T> {
        futures::executor::block_on(self.wait())
    }
}

/// Launch a future on the shared worker pool and return the completion it
/// resolves
pub fn fork<T, F>(future: F) -> Completion<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let completion = Completion::new();
    let handle = completion.clone();
    tokio::spawn(async move {
        match future.await {
            Ok(value) => handle.complete(value),
            Err(error) => handle.fail(error),
        };
    });
    completion
}

/// Fork with explicit context: the closure receives a deep copy of `env`
pub fn fork_with_env<T, F, Fut>(env: &TaskEnv, f: F) -> Completion<T>
where
    T: Send + 'static,
    F: FnOnce(TaskEnv) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fork(f(env.inherit()))
}

/// Explicit per-frame context. Forks receive a deep copy via
/// [`TaskEnv::inherit`] so later writes never leak between frames;
/// [`TaskEnv::reset`] is the execute-new directive.
#[derive(Debug, Clone, Default)]
pub struct TaskEnv {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl TaskEnv {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh, empty context for a fork that must not inherit state
    pub fn reset() -> Self {
        Self::new()
    }

    /// Deep copy for an inheriting fork
    pub fn inherit(&self) -> Self {
        Self {
            values: Arc::new(RwLock::new(self.values.read().clone())),
        }
    }

    /// Set a context value
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Read a context value
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}
