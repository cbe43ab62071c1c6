//! Global, listen-only key-press observation through a Quartz event tap.
//!
//! Each [`EventTap`] owns a dedicated thread running a `CFRunLoop` that the
//! tap is attached to. Callbacks run on that thread and must return quickly:
//! a slow callback stalls input delivery for the whole session, and the OS
//! disables taps that take too long. A disabled tap is re-enabled in place.
//!
//! Creating a tap requires the accessibility permission.

use std::ffi::{c_ulong, c_void};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use core_foundation::base::TCFType;
use core_foundation::runloop::{CFRunLoop, CFRunLoopRunResult};
use core_foundation::string::CFString;
use core_graphics::event::{
    CGEvent, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventType, CallbackResult, EventField,
};
use foreign_types::ForeignType;
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the run loop mode the tap runs in.
const RUN_LOOP_MODE: &str = "kCFRunLoopDefaultMode";

/// Longest the tap thread waits in its run loop before rechecking state.
const RUN_SLICE: Duration = Duration::from_millis(500);

/// UTF-16 units read from a key press.
const MAX_KEY_TEXT: usize = 4;

/// `CGEventFlags` bits.
pub mod flags {
    /// Caps Lock is on.
    pub const ALPHA_SHIFT: u64 = 0x0001_0000;
    /// Shift is held.
    pub const SHIFT: u64 = 0x0002_0000;
    /// Control is held.
    pub const CONTROL: u64 = 0x0004_0000;
    /// Option is held.
    pub const ALTERNATE: u64 = 0x0008_0000;
    /// Command is held.
    pub const COMMAND: u64 = 0x0010_0000;
    /// The key is on the numeric pad.
    pub const NUMERIC_PAD: u64 = 0x0020_0000;
    /// Fn is held.
    pub const SECONDARY_FN: u64 = 0x0080_0000;
}

/// A key press as reported by the tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKeyEvent {
    /// Virtual key code.
    pub key_code: u16,
    /// Raw `CGEventFlags`.
    pub flags: u64,
    /// Text the press produced, if any.
    pub text: Option<String>,
}

impl RawKeyEvent {
    /// Whether all bits of `flag` are set.
    #[must_use]
    pub fn has(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }
}

/// Errors from installing an event tap.
#[derive(Debug, Error)]
pub enum TapError {
    /// The OS refused to create the tap.
    #[error("failed to create event tap; check the Accessibility permission")]
    CreateFailed,

    /// The tap's run loop source could not be created.
    #[error("failed to attach event tap to its run loop")]
    SourceFailed,

    /// The tap thread could not be started.
    #[error("failed to start event tap thread: {0}")]
    Thread(#[from] std::io::Error),

    /// The tap thread ended before reporting back.
    #[error("event tap thread exited during setup")]
    SetupAborted,
}

type Handler = Box<dyn Fn(RawKeyEvent) + Send + Sync>;

/// Flags shared between the owner, the tap thread and the callback.
#[derive(Debug, Default)]
struct TapState {
    stopping: AtomicBool,
    disabled: AtomicBool,
}

/// An installed key-press observer. Dropping it removes the tap.
pub struct EventTap {
    state: Arc<TapState>,
    run_loop: CFRunLoop,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for EventTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTap")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl EventTap {
    /// Install a tap that calls `handler` for every key press.
    ///
    /// # Errors
    ///
    /// Returns [`TapError::CreateFailed`] if the OS refuses the tap.
    pub fn install<F>(handler: F) -> Result<Self, TapError>
    where
        F: Fn(RawKeyEvent) + Send + Sync + 'static,
    {
        let state = Arc::new(TapState::default());
        let handler: Handler = Box::new(handler);
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("panappticon-event-tap".to_string())
            .spawn(move || run_tap(handler, &thread_state, &ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(run_loop)) => Ok(Self {
                state,
                run_loop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(TapError::SetupAborted)
            }
        }
    }

    /// Remove the tap and wait for its thread to finish.
    pub fn remove(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.state.stopping.store(true, Ordering::SeqCst);
        self.run_loop.stop();
        if thread.join().is_err() {
            warn!("Event tap thread panicked");
        }
        debug!("Event tap removed");
    }
}

impl Drop for EventTap {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Body of the tap thread: create, attach, run until stopped, tear down.
fn run_tap(
    handler: Handler,
    state: &Arc<TapState>,
    ready: &mpsc::Sender<Result<CFRunLoop, TapError>>,
) {
    let callback_state = Arc::clone(state);
    let created = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        vec![CGEventType::KeyDown],
        move |_proxy, event_type, event: &CGEvent| {
            match event_type {
                CGEventType::TapDisabledByTimeout | CGEventType::TapDisabledByUserInput => {
                    callback_state.disabled.store(true, Ordering::SeqCst);
                }
                CGEventType::KeyDown => {
                    let raw = read_key_event(event);
                    // A panic must not unwind into the caller's C frames.
                    if panic::catch_unwind(AssertUnwindSafe(|| handler(raw))).is_err() {
                        warn!("Key handler panicked");
                    }
                }
                _ => {}
            }
            CallbackResult::Keep
        },
    );
    let Ok(tap) = created else {
        let _ = ready.send(Err(TapError::CreateFailed));
        return;
    };
    let Ok(source) = tap.mach_port().create_runloop_source(0) else {
        let _ = ready.send(Err(TapError::SourceFailed));
        return;
    };

    let mode = CFString::from_static_string(RUN_LOOP_MODE);
    let run_loop = CFRunLoop::get_current();
    run_loop.add_source(&source, mode.as_concrete_TypeRef());
    tap.enable();
    debug!("Event tap installed");

    if ready.send(Ok(run_loop.clone())).is_ok() {
        while !state.stopping.load(Ordering::SeqCst) {
            let result = CFRunLoop::run_in_mode(mode.as_concrete_TypeRef(), RUN_SLICE, true);
            if state.disabled.swap(false, Ordering::SeqCst) {
                warn!("Event tap was disabled by the system, re-enabling");
                tap.enable();
            }
            if matches!(result, CFRunLoopRunResult::Finished) {
                warn!("Event tap run loop lost its source");
                break;
            }
        }
    }

    run_loop.remove_source(&source, mode.as_concrete_TypeRef());
}

fn read_key_event(event: &CGEvent) -> RawKeyEvent {
    let key_code = u16::try_from(event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE))
        .unwrap_or(u16::MAX);
    RawKeyEvent {
        key_code,
        flags: event.get_flags().bits(),
        text: key_text(event),
    }
}

/// The text a key press produced. Quartz has no safe accessor for it.
#[allow(unsafe_code)]
fn key_text(event: &CGEvent) -> Option<String> {
    #[link(name = "CoreGraphics", kind = "framework")]
    extern "C" {
        fn CGEventKeyboardGetUnicodeString(
            event: *mut c_void,
            max_length: c_ulong,
            actual_length: *mut c_ulong,
            buffer: *mut u16,
        );
    }

    let mut buffer = [0u16; MAX_KEY_TEXT];
    let mut length: c_ulong = 0;
    let capacity = c_ulong::try_from(buffer.len()).unwrap_or(0);
    // SAFETY: `event` is a live keyboard event borrowed for this call, and
    // Quartz writes at most `capacity` units into `buffer`.
    unsafe {
        CGEventKeyboardGetUnicodeString(
            event.as_ptr().cast(),
            capacity,
            &mut length,
            buffer.as_mut_ptr(),
        );
    }
    let length = usize::try_from(length).unwrap_or(0).min(buffer.len());
    (length > 0).then(|| String::from_utf16_lossy(&buffer[..length]))
}
