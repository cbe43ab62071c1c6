//! Frontmost application lookup through `NSWorkspace`.
//!
//! AppKit updates `frontmostApplication` from notifications delivered on the
//! main run loop. A process whose main thread does not run that loop sees a
//! stale value, so the agent hands its main thread to [`run_main_loop_until`].

use std::thread;
use std::time::Duration;

use core_foundation::base::TCFType;
use core_foundation::runloop::{CFRunLoop, CFRunLoopRunResult};
use core_foundation::string::CFString;
use objc2::rc::Retained;
use objc2_app_kit::NSWorkspace;
use objc2_foundation::NSString;

/// Name of the run loop mode AppKit delivers notifications in.
const RUN_LOOP_MODE: &str = "kCFRunLoopDefaultMode";

/// The frontmost application as `(localized name, bundle identifier)`.
///
/// Either part is empty when AppKit does not report it. Returns `None` when
/// there is no frontmost application at all.
#[must_use]
pub fn frontmost_application() -> Option<(String, String)> {
    let workspace = NSWorkspace::sharedWorkspace();
    let app = workspace.frontmostApplication()?;

    let name: Option<Retained<NSString>> = app.localizedName();
    let bundle_id: Option<Retained<NSString>> = app.bundleIdentifier();

    Some((text(name), text(bundle_id)))
}

fn text(value: Option<Retained<NSString>>) -> String {
    value.map(|s| s.to_string()).unwrap_or_default()
}

/// Run the current thread's run loop in slices of `slice` until `done`
/// returns true. Call from the main thread.
pub fn run_main_loop_until(slice: Duration, done: impl Fn() -> bool) {
    let mode = CFString::from_static_string(RUN_LOOP_MODE);
    while !done() {
        let result = CFRunLoop::run_in_mode(mode.as_concrete_TypeRef(), slice, false);
        // A loop without sources returns at once.
        if matches!(result, CFRunLoopRunResult::Finished) {
            thread::sleep(slice);
        }
    }
}
