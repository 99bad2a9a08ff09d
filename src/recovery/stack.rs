//! Panic-time stack capture.
//!
//! The stack is already unwound by the time `catch_unwind` regains control,
//! so the frames leading to the panic have to be snapshotted from inside the
//! panic hook, on the panicking thread. The recovery future arms a
//! thread-local marker around each poll of the wrapped handler; the hook
//! snapshots an unresolved backtrace only for armed threads and hands every
//! other panic in the process to the previously installed hook.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic;
use std::sync::Once;

use backtrace::Backtrace;

/// Maximum number of frames kept from a captured stack.
pub const MAX_STACK_FRAMES: usize = 32;

/// One resolved frame of a captured panic stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\t{}:{}", self.function, self.file, self.line)
    }
}

thread_local! {
    /// Depth of armed recovery sections on this thread.
    static ARMED: Cell<usize> = const { Cell::new(0) };
    /// Backtrace stored by the hook for the recovery point to take.
    static CAPTURED: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install the capturing panic hook, once per process.
pub(crate) fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.with(|armed| armed.get() > 0) {
                // Resolution is deferred to the recovery point; the hook
                // must stay cheap and must not allocate symbol tables here.
                CAPTURED.with(|slot| {
                    *slot.borrow_mut() = Some(Backtrace::new_unresolved());
                });
            } else {
                previous(info);
            }
        }));
    });
}

/// Marks the current thread as inside a recovery section until dropped.
pub(crate) struct ArmedGuard {
    _private: (),
}

pub(crate) fn arm() -> ArmedGuard {
    ARMED.with(|armed| armed.set(armed.get() + 1));
    ArmedGuard { _private: () }
}

impl Drop for ArmedGuard {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(armed.get() - 1));
    }
}

/// Take and resolve the stack stored by the hook for the current thread.
///
/// Frames belonging to the capture and unwind machinery above the panic
/// site are skipped; at most [`MAX_STACK_FRAMES`] frames are returned,
/// innermost first.
pub(crate) fn take_captured() -> Vec<StackFrame> {
    let Some(mut backtrace) = CAPTURED.with(|slot| slot.borrow_mut().take()) else {
        return Vec::new();
    };
    backtrace.resolve();

    let mut frames = Vec::new();
    let mut above_panic_site = true;
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let function = symbol
                .name()
                .map(|name| name.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            if above_panic_site {
                if is_capture_machinery(&function) {
                    continue;
                }
                above_panic_site = false;
            }
            let file = symbol
                .filename()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            let line = symbol.lineno().unwrap_or(0);
            frames.push(StackFrame { function, file, line });
            if frames.len() == MAX_STACK_FRAMES {
                return frames;
            }
        }
    }
    frames
}

const CAPTURE_MACHINERY: &[&str] = &[
    "backtrace::",
    "std::panicking::",
    "core::panicking::",
    "std::panic::panic_any",
    "rust_begin_unwind",
    "stack::install_hook",
];

fn is_capture_machinery(function: &str) -> bool {
    CAPTURE_MACHINERY.iter().any(|marker| function.contains(marker))
}
