//! Thread-safe deferred results with dynamic callback chains.
//!
//! A [`Deferred`] is a future result with a callback chain attached to it.
//! Producers hand it the result once ([`Deferred::complete`]); consumers
//! append transformations at any time, even after the result arrived. Each
//! link receives the previous link's output, errors travel a parallel
//! error path, and a link that returns another deferred transparently
//! parks the chain until that inner deferred settles.
//!
//! # State machine
//!
//! ```text
//!                ,---------------------.
//!                |   ,-------.         |
//!                v   v       |         |
//!   PENDING --> RUNNING --> DONE     PAUSED
//!                  |                   ^
//!                  `-------------------'
//! ```
//!
//! A deferred starts PENDING (or DONE, via the ready-made constructors).
//! The first completion moves it to RUNNING and the completing thread
//! drains the chain. A link returning an unsettled deferred parks the
//! chain in PAUSED; the thread that settles the inner deferred moves it
//! back to RUNNING and keeps draining. When the chain is empty the
//! deferred lands on DONE, and a late append re-enters RUNNING briefly to
//! run the new links on the appender's thread.
//!
//! Every conditional transition is a compare-and-swap on the atomic state
//! word. The chain and the settled result live behind the intrinsic lock,
//! which also serializes the one non-CAS conditional transition
//! (DONE → RUNNING on a late append) and the settled-result steal of the
//! continuation fast path.
//!
//! # Threads
//!
//! The core never creates threads. Links execute on whichever thread
//! delivers the result: the completing thread, the thread appending to an
//! already-settled deferred, or the thread settling an inner deferred the
//! chain was parked on. Only the joins block.

use core::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::chain::{Chain, Link};
use crate::error::{Error, ErrorKind, Result};
use crate::payload::{Carry, Payload};

/// No result yet and nothing running.
const PENDING: u32 = 0;
/// One thread is draining the chain and owns the in-flight value.
const RUNNING: u32 = 1;
/// Drain parked on a nested deferred.
const PAUSED: u32 = 2;
/// Settled; the result sits in the slot and the chain is empty.
const DONE: u32 = 3;

fn state_name(state: u32) -> &'static str {
    match state {
        PENDING => "PENDING",
        RUNNING => "RUNNING",
        PAUSED => "PAUSED",
        DONE => "DONE",
        _ => "UNKNOWN",
    }
}

/// Timeouts beyond this are accepted but logged; they are almost always a
/// unit mix-up at the call site.
const ONE_YEAR: Duration = Duration::from_millis(31_556_926_000);

/// With fewer nanoseconds than this left there is no point waiting again;
/// one trip through the wait loop costs more than that.
const MIN_WAIT_NANOS: u64 = 100;

/// The monomorphic heart of a deferred. All typed handles to one result
/// share one `Core`.
pub(crate) struct Core {
    /// Lifecycle tag; conditional transitions CAS it, unconditional ones
    /// store it.
    state: AtomicU32,
    /// Chain storage plus the settled-result slot. While a thread drains
    /// (state RUNNING) it owns the in-flight value and the slot is empty.
    inner: Mutex<Inner>,
}

struct Inner {
    chain: Chain,
    result: Option<Payload>,
}

impl Core {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU32::new(PENDING),
            inner: Mutex::new(Inner {
                chain: Chain::new(),
                result: None,
            }),
        })
    }

    fn settled(payload: Payload) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU32::new(DONE),
            inner: Mutex::new(Inner {
                chain: Chain::new(),
                result: Some(payload),
            }),
        })
    }

    fn cas_state(&self, from: u32, to: u32) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Posts the initial result and drains the chain on this thread.
    ///
    /// Panics if the deferred was already completed.
    fn complete(this: &Arc<Self>, payload: Payload) {
        if !this.cas_state(PENDING, RUNNING) {
            panic!(
                "deferred completed twice (state={})",
                state_name(this.state.load(Ordering::Acquire))
            );
        }
        tracing::trace!("deferred {:p}: completing", Arc::as_ptr(this));
        Self::run(this, payload);
    }

    /// Appends a pair, or — when the deferred already settled — runs the
    /// pair right here on the caller's thread before returning.
    fn add_pair(this: &Arc<Self>, on_success: Link, on_error: Link) {
        let payload = {
            let mut inner = this.inner.lock();
            if this.state.load(Ordering::Acquire) == DONE {
                // The one conditional transition done without CAS: this is
                // the only DONE -> RUNNING path and the lock serializes it.
                this.state.store(RUNNING, Ordering::Release);
                inner
                    .result
                    .take()
                    .expect("settled deferred lost its result")
            } else {
                inner.chain.push(on_success, on_error);
                return;
            }
        };
        tracing::trace!("deferred {:p}: late append, re-running", Arc::as_ptr(this));
        let link = if payload.is_failure() {
            on_error
        } else {
            on_success
        };
        let next = link.invoke(payload);
        // The link may have taken a while; anything appended concurrently
        // is drained by the same loop before we go back to DONE.
        Self::run(this, next);
    }

    /// The drain loop: consumes pairs until the chain is empty or a nested
    /// deferred parks it.
    ///
    /// The lock is released while each link runs, so links may append to
    /// this very deferred; the empty-chain check re-acquires the lock
    /// before concluding anything, which is what keeps the append race
    /// sound — drainers never blindly terminate, appenders never enqueue
    /// into a DONE deferred.
    fn run(this: &Arc<Self>, mut payload: Payload) {
        loop {
            payload = match payload {
                Payload::Nested(nested) => match Self::park_on(this, nested) {
                    Some(inlined) => inlined,
                    // Parked; whichever thread settles the nested deferred
                    // picks the drain back up.
                    None => return,
                },
                current => {
                    let mut inner = this.inner.lock();
                    if let Some((on_success, on_error)) = inner.chain.pop() {
                        drop(inner);
                        let link = if current.is_failure() {
                            on_error
                        } else {
                            on_success
                        };
                        link.invoke(current)
                    } else {
                        // Re-checked under the lock: nothing slipped in
                        // behind the last link.
                        inner.chain.reset();
                        inner.result = Some(current);
                        this.state.store(DONE, Ordering::Release);
                        drop(inner);
                        tracing::trace!("deferred {:p}: settled", Arc::as_ptr(this));
                        return;
                    }
                }
            };
        }
    }

    /// A link (or the initial result) produced another deferred.
    ///
    /// Fast path: steal the result of an already-settled one — CAS it
    /// DONE → RUNNING, clone the slot, put DONE back — and keep draining
    /// without allocating a resume link. The steal holds the nested
    /// deferred's lock so it serializes against appends to it.
    ///
    /// Slow path: park this deferred in PAUSED and leave a resume pair on
    /// the nested one. Returns the stolen result, or `None` once parked.
    fn park_on(this: &Arc<Self>, nested: Arc<Self>) -> Option<Payload> {
        if Arc::ptr_eq(this, &nested) {
            panic!("a deferred cannot receive itself as a result");
        }
        {
            let inner = nested.inner.lock();
            if nested.cas_state(DONE, RUNNING) {
                let stolen = inner
                    .result
                    .clone()
                    .expect("settled deferred lost its result");
                nested.state.store(DONE, Ordering::Release);
                tracing::trace!(
                    "deferred {:p}: inlined settled result of {:p}",
                    Arc::as_ptr(this),
                    Arc::as_ptr(&nested)
                );
                return Some(stolen);
            }
        }
        this.state.store(PAUSED, Ordering::Release);
        tracing::debug!(
            "deferred {:p}: paused on nested deferred {:p}",
            Arc::as_ptr(this),
            Arc::as_ptr(&nested)
        );
        Self::add_pair(
            &nested,
            resume_link(Arc::clone(this)),
            resume_link(Arc::clone(this)),
        );
        None
    }

    /// Blocks until settled. `None` waits forever.
    fn wait(this: &Arc<Self>, timeout: Option<Duration>) -> Result<Payload> {
        {
            // The DONE -> RUNNING transitions all happen under `inner`, so
            // checking the state while holding it is race-free.
            let inner = this.inner.lock();
            if this.state.load(Ordering::Acquire) == DONE {
                return Ok(inner
                    .result
                    .clone()
                    .expect("settled deferred lost its result"));
            }
        }

        let signal = Arc::new(Signal::default());
        Self::add_pair(
            this,
            signal_link(Arc::clone(&signal)),
            signal_link(Arc::clone(&signal)),
        );

        let mut slot = signal.slot.lock();
        match timeout {
            None => {
                while slot.is_none() {
                    signal.ready.wait(&mut slot);
                }
            }
            Some(timeout) => {
                if timeout > ONE_YEAR {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "join timeout is longer than one year"
                    );
                }
                let Ok(mut remaining) = u64::try_from(timeout.as_nanos()) else {
                    panic!("join timeout overflows the nanosecond clock: {timeout:?}");
                };
                while slot.is_none() {
                    // A timeout and a spurious wakeup look identical, so
                    // time the sleep and keep book on what remains.
                    let started = Instant::now();
                    let _ = signal
                        .ready
                        .wait_for(&mut slot, Duration::from_nanos(remaining));
                    let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                    remaining = remaining.saturating_sub(elapsed);
                    if remaining < MIN_WAIT_NANOS {
                        if slot.is_none() {
                            return Err(Error::new(ErrorKind::Timeout)
                                .with_context(format!("no result after {timeout:?}")));
                        }
                        break;
                    }
                }
            }
        }
        Ok(slot.take().expect("join signalled without a result"))
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Acquire);
        write!(
            f,
            "Deferred@{:p}(state={}",
            self as *const Self,
            state_name(state)
        )?;
        // A plain lock here could deadlock against a drain logging its own
        // deferred, so render best-effort.
        match self.inner.try_lock() {
            Some(inner) => {
                match &inner.result {
                    Some(payload) => write!(f, ", result={payload:?}")?,
                    None => write!(f, ", result=<none>")?,
                }
                write!(f, ", callbacks={:?})", inner.chain)
            }
            None => write!(f, ", <chain busy>)"),
        }
    }
}

/// Wakes a parked deferred once the deferred it waits on settles.
///
/// Both halves of the appended pair behave identically: adopt the
/// argument, resume the drain, pass the argument on unchanged. When the
/// argument is itself a deferred the drain loop re-enters the continuation
/// protocol and parks again.
fn resume_link(outer: Arc<Core>) -> Link {
    Link::new("continuation", move |payload| {
        if !outer.cas_state(PAUSED, RUNNING) {
            panic!(
                "deferred resumed while not paused (state={})",
                state_name(outer.state.load(Ordering::Acquire))
            );
        }
        let pass = payload.clone();
        Core::run(&outer, payload);
        pass
    })
}

/// Completes `target` with whatever flows through, value or error, and
/// passes it on unchanged.
fn chain_link(target: Arc<Core>) -> Link {
    Link::new("chain", move |payload| {
        Core::complete(&target, payload.clone());
        payload
    })
}

/// Cell a joining thread sleeps on. Exactly one joiner waits per cell;
/// each join registers its own.
#[derive(Default)]
struct Signal {
    slot: Mutex<Option<Payload>>,
    ready: Condvar,
}

fn signal_link(signal: Arc<Signal>) -> Link {
    Link::new("join-signal", move |payload| {
        let pass = payload.clone();
        *signal.slot.lock() = Some(payload);
        signal.ready.notify_one();
        pass
    })
}

fn type_mismatch<T>(got: &Payload) -> Payload {
    Payload::Failure(Error::new(ErrorKind::TypeMismatch).with_context(format!(
        "expected a {}, got {:?}",
        std::any::type_name::<T>(),
        got
    )))
}

/// Typed adapter for a success-path link.
fn success_link<T, R, S, F>(f: F) -> Link
where
    T: Carry,
    R: Carry,
    S: IntoStep<R>,
    F: FnOnce(T) -> S + Send + 'static,
{
    Link::new("callback", move |payload| match payload.downcast::<T>() {
        Ok(value) => f(value).into_step().into_payload(),
        Err(other) => type_mismatch::<T>(&other),
    })
}

/// Typed adapter for an error-path link.
fn error_link<R, S, G>(g: G) -> Link
where
    R: Carry,
    S: IntoStep<R>,
    G: FnOnce(Error) -> S + Send + 'static,
{
    Link::new("errback", move |payload| match payload {
        Payload::Failure(error) => g(error).into_step().into_payload(),
        other => unreachable!("error link invoked with a success value: {other:?}"),
    })
}

/// What a callback hands back to the chain.
///
/// Callbacks normally return plain values, `Result`s or other deferreds
/// and let [`IntoStep`] lift them. `Step` is the explicit form, needed
/// when one closure mixes outcomes (a closure has a single return type)
/// and for [`Deferred::complete_with`].
#[derive(Debug)]
pub enum Step<T> {
    /// Continue on the success path with this value.
    Value(T),
    /// Divert to the error path.
    Error(Error),
    /// Park the chain until this deferred settles, then continue with its
    /// result.
    Deferred(Deferred<T>),
}

impl<T: Carry> Step<T> {
    pub(crate) fn into_payload(self) -> Payload {
        match self {
            Self::Value(value) => Payload::value(value),
            Self::Error(error) => Payload::Failure(error),
            Self::Deferred(deferred) => Payload::Nested(deferred.core),
        }
    }
}

/// Conversion applied to every callback return value.
///
/// Implemented for plain values (stay on the success path), for
/// [`Result`] (an `Err` diverts to the error path), for [`Deferred`]
/// (park until it settles) and for [`Step`] itself. When a callback
/// returns a type that fits more than one reading — say a `Result` that
/// could itself be the carried value — pin the deferred's type parameter
/// at the call site.
pub trait IntoStep<T: Carry> {
    /// Lifts `self` into the step the chain takes next.
    fn into_step(self) -> Step<T>;
}

impl<T: Carry> IntoStep<T> for T {
    fn into_step(self) -> Step<T> {
        Step::Value(self)
    }
}

impl<T: Carry> IntoStep<T> for Step<T> {
    fn into_step(self) -> Step<T> {
        self
    }
}

impl<T: Carry> IntoStep<T> for Deferred<T> {
    fn into_step(self) -> Step<T> {
        Step::Deferred(self)
    }
}

impl<T: Carry> IntoStep<T> for Result<T> {
    fn into_step(self) -> Step<T> {
        match self {
            Ok(value) => Step::Value(value),
            Err(error) => Step::Error(error),
        }
    }
}

/// A deferred result with an attached, dynamic transformation chain.
///
/// Handles are cheap clones sharing one underlying result. Registration
/// methods return a retyped view of the *same* deferred, so a pipeline
/// reads top to bottom:
///
/// ```
/// use deferral::Deferred;
///
/// let d: Deferred<i32> = Deferred::new();
/// let doubled = d.on_success(|x: i32| x * 2);
/// d.complete(21);
/// assert_eq!(doubled.join().unwrap(), 42);
/// ```
///
/// Because every view shares the erased core, a handle whose type
/// parameter no longer matches the value actually flowing at its position
/// observes a `TypeMismatch` error rather than the value. Keep using the
/// view returned by the last registration, the way the example does.
pub struct Deferred<T> {
    core: Arc<Core>,
    _result: PhantomData<fn(T) -> T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _result: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

impl<T: Carry> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Carry> Deferred<T> {
    /// Creates a deferred with no result yet.
    #[must_use]
    pub fn new() -> Self {
        Self::from_core(Core::pending())
    }

    /// Creates an already-settled deferred carrying `value`.
    ///
    /// Links appended to it run immediately on the appending thread.
    #[must_use]
    pub fn of_value(value: T) -> Self {
        Self::from_core(Core::settled(Payload::value(value)))
    }

    /// Creates an already-settled deferred carrying `error`.
    ///
    /// Error links appended to it run immediately on the appending thread.
    #[must_use]
    pub fn of_error(error: Error) -> Self {
        Self::from_core(Core::settled(Payload::Failure(error)))
    }

    fn from_core(core: Arc<Core>) -> Self {
        Self {
            core,
            _result: PhantomData,
        }
    }

    fn retyped<R>(&self) -> Deferred<R> {
        Deferred {
            core: Arc::clone(&self.core),
            _result: PhantomData,
        }
    }

    /// Posts the initial success value and drains the chain on this
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics if the deferred was already completed.
    pub fn complete(&self, value: T) {
        Core::complete(&self.core, Payload::value(value));
    }

    /// Posts an initial error; the chain drains down the error path.
    ///
    /// # Panics
    ///
    /// Panics if the deferred was already completed.
    pub fn complete_error(&self, error: Error) {
        Core::complete(&self.core, Payload::Failure(error));
    }

    /// Posts any [`Step`] as the initial result. Completing with
    /// [`Step::Deferred`] parks this deferred before any link runs, until
    /// the given one settles.
    ///
    /// # Panics
    ///
    /// Panics if the deferred was already completed, or when handed
    /// itself.
    pub fn complete_with(&self, step: Step<T>) {
        Core::complete(&self.core, step.into_payload());
    }

    /// Registers a callback and an errback as one pair.
    ///
    /// Exactly one of the two runs when the chain reaches the pair,
    /// picked by the kind of the value flowing at that point; the other is
    /// dropped. If the deferred already settled the applicable one runs
    /// immediately on this thread.
    pub fn add_callbacks<R, F, SF, G, SG>(&self, on_success: F, on_error: G) -> Deferred<R>
    where
        R: Carry,
        F: FnOnce(T) -> SF + Send + 'static,
        SF: IntoStep<R>,
        G: FnOnce(Error) -> SG + Send + 'static,
        SG: IntoStep<R>,
    {
        Core::add_pair(&self.core, success_link(on_success), error_link(on_error));
        self.retyped()
    }

    /// Registers a success-path callback; errors pass through untouched.
    pub fn on_success<R, F, S>(&self, f: F) -> Deferred<R>
    where
        R: Carry,
        F: FnOnce(T) -> S + Send + 'static,
        S: IntoStep<R>,
    {
        Core::add_pair(&self.core, success_link(f), Link::Identity);
        self.retyped()
    }

    /// Registers an error-path callback; success values pass through
    /// untouched. Returning a plain value recovers the chain back onto
    /// the success path.
    pub fn on_error<F, S>(&self, f: F) -> Self
    where
        F: FnOnce(Error) -> S + Send + 'static,
        S: IntoStep<T>,
    {
        Core::add_pair(&self.core, Link::Identity, error_link(f));
        self.retyped()
    }

    /// Registers one callback on both paths. It receives `Ok(value)` or
    /// `Err(error)` depending on which path the chain is on.
    pub fn on_both<R, F, S>(&self, f: F) -> Deferred<R>
    where
        R: Carry,
        F: FnOnce(Result<T>) -> S + Send + 'static,
        S: IntoStep<R>,
    {
        // One FnOnce serves both sides of the pair; only one side ever
        // runs, the other is dropped with its captured half.
        let shared = Arc::new(Mutex::new(Some(f)));
        let for_error = Arc::clone(&shared);
        let cb = Link::new("callback", move |payload: Payload| {
            let f = shared.lock().take().expect("pair already consumed");
            match payload.downcast::<T>() {
                Ok(value) => f(Ok(value)).into_step().into_payload(),
                Err(other) => type_mismatch::<T>(&other),
            }
        });
        let eb = Link::new("errback", move |payload: Payload| match payload {
            Payload::Failure(error) => {
                let f = for_error.lock().take().expect("pair already consumed");
                f(Err(error)).into_step().into_payload()
            }
            other => unreachable!("error link invoked with a success value: {other:?}"),
        });
        Core::add_pair(&self.core, cb, eb);
        self.retyped()
    }

    /// Mirrors this deferred into `other`: whatever value or error flows
    /// through this point of the chain also completes `other`, and passes
    /// on unchanged. Useful to fan one result out to several chains.
    ///
    /// # Panics
    ///
    /// Panics when chained to itself, and later, at completion time, if
    /// `other` was completed by someone else in the meantime.
    pub fn chain(&self, other: &Self) -> Self {
        assert!(
            !Arc::ptr_eq(&self.core, &other.core),
            "a deferred cannot be chained to itself"
        );
        Core::add_pair(
            &self.core,
            chain_link(Arc::clone(&other.core)),
            chain_link(Arc::clone(&other.core)),
        );
        self.clone()
    }

    /// Blocks until the deferred settles; returns the terminal value or
    /// the carried error.
    ///
    /// Returns immediately if already settled. The wait cannot be
    /// interrupted (Rust threads have no interruption); use
    /// [`Deferred::join_timeout`] to bound it.
    pub fn join(&self) -> Result<T> {
        Self::take_value(Core::wait(&self.core, None)?)
    }

    /// Blocks until the deferred settles or `timeout` elapses, in which
    /// case an [`ErrorKind::Timeout`] error is returned. The deferred
    /// itself keeps progressing; only the wait gives up.
    ///
    /// Timeouts longer than a year are accepted with a logged warning.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` overflows the nanosecond clock.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T> {
        Self::take_value(Core::wait(&self.core, Some(timeout))?)
    }

    fn take_value(payload: Payload) -> Result<T> {
        match payload {
            Payload::Failure(error) => Err(error),
            payload => payload.downcast::<T>().map_err(|other| {
                Error::new(ErrorKind::TypeMismatch).with_context(format!(
                    "expected a {}, got {:?}",
                    std::any::type_name::<T>(),
                    other
                ))
            }),
        }
    }
}
