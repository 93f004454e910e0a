//! Diagnostic logging.
//!
//! With the `debug-log` feature enabled, messages go to the browser console.
//! Without it, `debug_log!` builds its format arguments and drops them unrendered.

use core::fmt;

/// Writes a diagnostic line. Prefer the `debug_log!` macro.
#[cfg(feature = "debug-log")]
pub fn emit(args: fmt::Arguments<'_>) {
    let message = alloc::format!("[rill] {}", args);
    web_sys::console::log_1(&wasm_bindgen::JsValue::from_str(&message));
}

/// Writes a diagnostic line. Prefer the `debug_log!` macro.
#[cfg(not(feature = "debug-log"))]
#[inline(always)]
pub fn emit(_args: fmt::Arguments<'_>) {}

/// Logs a formatted diagnostic message when the `debug-log` feature is enabled.
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::log::emit(::core::format_args!($($arg)*))
    };
}
