use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{self, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError, TryLockError, Weak};
use std::thread::{self, ThreadId};
use tracing::{error, warn};

use crate::session::{SessionCore, Termination};

pub const INTERRUPT_EXIT_CODE: i32 = 130;

struct Registration {
    key: u64,
    owner: ThreadId,
    core: Weak<Mutex<SessionCore>>,
}

static REGISTRY: Mutex<Vec<Registration>> = Mutex::new(Vec::new());
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
static PANIC_HOOK: Once = Once::new();
static INTERRUPT_HOOK: Once = Once::new();
static EXIT_HOOK: Once = Once::new();

pub(crate) const UNFINALIZED_EXIT: &str = "process exited without finalizing";

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub(crate) fn register(core: &Arc<Mutex<SessionCore>>, handle_interrupts: bool) -> u64 {
    install_panic_hook();
    install_exit_hook();
    if handle_interrupts {
        install_interrupt_handler();
    }
    let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    registry.retain(|r| r.core.strong_count() > 0);
    registry.push(Registration {
        key,
        owner: thread::current().id(),
        core: Arc::downgrade(core),
    });
    key
}

pub(crate) fn unregister(key: u64) {
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    registry.retain(|r| r.key != key);
}

pub(crate) fn current_panic_description() -> Option<String> {
    LAST_PANIC.with(|p| p.borrow().clone())
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let description = describe_panic(info.payload(), info.location());
            LAST_PANIC.with(|p| *p.borrow_mut() = Some(description.clone()));
            finalize_owned(thread::current().id(), &description);
            // Keep the usual panic report on stderr.
            previous(info);
        }));
    });
}

fn install_interrupt_handler() {
    INTERRUPT_HOOK.call_once(|| {
        let installed = ctrlc::set_handler(|| {
            finalize_registered(|_| true, &Termination::Interrupted, true);
            std::process::exit(INTERRUPT_EXIT_CODE);
        });
        if let Err(err) = installed {
            warn!(error = %err, "could not install interrupt handler; Ctrl-C will not be recorded");
        }
    });
}

fn live_sessions(filter: impl Fn(&Registration) -> bool) -> Vec<Arc<Mutex<SessionCore>>> {
    let registry = match REGISTRY.try_lock() {
        Ok(registry) => registry,
        Err(TryLockError::Poisoned(p)) => p.into_inner(),
        Err(TryLockError::WouldBlock) => return Vec::new(),
    };
    registry
        .iter()
        .filter(|r| filter(r))
        .filter_map(|r| r.core.upgrade())
        .collect()
}

// `std::process::exit` skips destructors but still runs atexit handlers.
fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: `finalize_at_exit` is a plain `extern "C"` function with no
        // captured state.
        if unsafe { libc::atexit(finalize_at_exit) } != 0 {
            warn!("could not install exit handler; exits without finalizing will not be recorded");
        }
    });
}

extern "C" fn finalize_at_exit() {
    let termination = Termination::Fault(UNFINALIZED_EXIT.to_string());
    finalize_registered(|_| true, &termination, false);
}

// A session locked by the panicking thread is left to its `Drop`.
fn finalize_owned(owner: ThreadId, description: &str) {
    let termination = Termination::Fault(description.to_string());
    finalize_registered(|r| r.owner == owner, &termination, false);
}

fn finalize_registered(
    filter: impl Fn(&Registration) -> bool,
    termination: &Termination,
    wait: bool,
) {
    for core in live_sessions(filter) {
        let mut guard = if wait {
            core.lock().unwrap_or_else(PoisonError::into_inner)
        } else {
            match core.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            }
        };
        if let Err(err) = guard.finalize(termination.clone()) {
            error!(error = %err, "failed to record final status");
        }
    }
}

#[cfg(test)]
pub(crate) fn finalize_by_key(key: u64, termination: Termination) {
    finalize_registered(|r| r.key == key, &termination, true);
}

fn describe_panic(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    };
    let mut description = match location {
        Some(loc) => format!("panicked at {}: {}", loc, message),
        None => format!("panicked: {}", message),
    };
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        description.push('\n');
        description.push_str(&backtrace.to_string());
    }
    description
}
