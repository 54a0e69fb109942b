//! Tracked console output.
//!
//! The crate exports `print!`, `println!`, `eprint!` and `eprintln!`
//! macros with the same syntax as the standard ones. Importing them
//! (`use logcost::{print, println};`) shadows the prelude macros, so
//! existing call sites are tracked under the `PRINT` severity without
//! being rewritten. Output is always written, whether or not the tracker
//! is installed.

use crate::accumulator::Severity;
use crate::estimate::Message;
use crate::stack::Frame;

/// Records console output at the given location. Does nothing until
/// [`crate::install`] has run.
#[doc(hidden)]
pub fn track_output(module: &'static str, file: &'static str, line: u32, text: &str) {
    if let Some(tracker) = crate::installed_tracker() {
        tracker.track(
            Severity::Print,
            Message::Text(text),
            Some(Frame::new(Some(module), Some(file), line)),
        );
    }
}

/// Tracked drop-in for [`std::print!`].
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let text = ::std::format!($($arg)*);
        $crate::console::track_output(::std::module_path!(), ::std::file!(), ::std::line!(), &text);
        ::std::print!("{}", text);
    }};
}

/// Tracked drop-in for [`std::println!`].
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        let mut text = ::std::format!($($arg)*);
        text.push('\n');
        $crate::console::track_output(::std::module_path!(), ::std::file!(), ::std::line!(), &text);
        ::std::print!("{}", text);
    }};
}

/// Tracked drop-in for [`std::eprint!`].
#[macro_export]
macro_rules! eprint {
    ($($arg:tt)*) => {{
        let text = ::std::format!($($arg)*);
        $crate::console::track_output(::std::module_path!(), ::std::file!(), ::std::line!(), &text);
        ::std::eprint!("{}", text);
    }};
}

/// Tracked drop-in for [`std::eprintln!`].
#[macro_export]
macro_rules! eprintln {
    () => {
        $crate::eprint!("\n")
    };
    ($($arg:tt)*) => {{
        let mut text = ::std::format!($($arg)*);
        text.push('\n');
        $crate::console::track_output(::std::module_path!(), ::std::file!(), ::std::line!(), &text);
        ::std::eprint!("{}", text);
    }};
}
