//! Call-site attribution.
//!
//! A log statement is attributed to the innermost stack frame that does
//! not belong to the logging machinery. The frames come from a
//! [`StackWalker`]; in production that is [`BacktraceWalker`], which walks
//! the native stack of the calling thread and symbolizes lazily so the walk
//! can stop as soon as a caller is found.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{event, Level};

/// Module prefixes that never own a log statement.
pub const DEFAULT_SKIP_MODULES: &[&str] = &[
    "logcost",
    "tracing",
    "tracing_core",
    "tracing_subscriber",
    "tracing_log",
    "log",
    "backtrace",
    "std",
    "core",
    "alloc",
];

/// Source paths of the standard library as they show up in debug info.
pub const DEFAULT_SKIP_PATHS: &[&str] = &["/rustc/"];

pub const DEFAULT_MAX_SKIP_PREFIXES: usize = 128;

/// A single stack frame as seen by the attribution logic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Frame {
    /// Module path of the code running in this frame, e.g. `app::orders`.
    pub module: Option<String>,
    pub file: Option<PathBuf>,
    pub line: u32,
}

impl Frame {
    pub fn new(module: Option<&str>, file: Option<&str>, line: u32) -> Self {
        Self {
            module: module.map(str::to_string),
            file: file.map(PathBuf::from),
            line,
        }
    }
}

/// Capability that yields the frames of the current call stack.
pub trait StackWalker: Send + Sync {
    /// Visits frames from the innermost outward until `visit` returns
    /// `false` or the stack is exhausted.
    fn walk(&self, visit: &mut dyn FnMut(Frame) -> bool);
}

/// Walks the native stack with the `backtrace` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceWalker;

impl StackWalker for BacktraceWalker {
    fn walk(&self, visit: &mut dyn FnMut(Frame) -> bool) {
        backtrace::trace(|raw| {
            // An instruction pointer can resolve to several symbols when
            // functions were inlined; they come innermost first.
            let mut symbols = Vec::with_capacity(1);
            backtrace::resolve_frame(raw, |symbol| {
                symbols.push(Frame {
                    module: symbol.name().map(|name| symbol_module(&format!("{:#}", name))),
                    file: symbol.filename().map(Path::to_path_buf),
                    line: symbol.lineno().unwrap_or(0),
                });
            });
            if symbols.is_empty() {
                return visit(Frame::default());
            }
            symbols.into_iter().all(|frame| visit(frame))
        });
    }
}

/// Turns a demangled symbol like `<app::Foo as core::fmt::Display>::fmt`
/// into a path that starts with the owning module.
fn symbol_module(symbol: &str) -> String {
    let mut rest = symbol;
    loop {
        let trimmed = rest.trim_start_matches(['<', '&', '*', '(']);
        let trimmed = ["mut ", "const ", "dyn "]
            .iter()
            .find_map(|qualifier| trimmed.strip_prefix(qualifier))
            .unwrap_or(trimmed);
        if trimmed.len() == rest.len() {
            return impl_owner(rest).to_string();
        }
        rest = trimmed;
    }
}

/// For `Self as Trait>::method`, an impl on a type of the standard library
/// or the logging stack belongs to the trait's module.
fn impl_owner(path: &str) -> &str {
    let mut depth = 0usize;
    for (i, c) in path.char_indices() {
        match c {
            '<' => depth += 1,
            '>' if depth == 0 => return path,
            '>' => depth -= 1,
            ' ' if depth == 0 && path[i..].starts_with(" as ") => {
                let self_crate = path[..i].split([':', '<']).next().unwrap_or_default();
                return if DEFAULT_SKIP_MODULES.contains(&self_crate) {
                    &path[i + " as ".len()..]
                } else {
                    path
                };
            }
            _ => {}
        }
    }
    path
}

/// Rules deciding which frames belong to logging internals.
#[derive(Clone, Debug)]
pub struct SkipRules {
    module_prefixes: HashSet<String>,
    path_patterns: HashSet<String>,
    builtin_modules: usize,
    max_module_prefixes: usize,
}

impl Default for SkipRules {
    fn default() -> Self {
        Self::with_defaults(DEFAULT_MAX_SKIP_PREFIXES)
    }
}

impl SkipRules {
    /// Rules with no registered prefix or path.
    pub fn empty(max_module_prefixes: usize) -> Self {
        Self {
            module_prefixes: HashSet::new(),
            path_patterns: HashSet::new(),
            builtin_modules: 0,
            max_module_prefixes,
        }
    }

    /// Rules pre-populated with the logging stack and this crate.
    /// The built-in prefixes do not count against the capacity.
    pub fn with_defaults(max_module_prefixes: usize) -> Self {
        let mut rules = Self::empty(max_module_prefixes);
        rules
            .module_prefixes
            .extend(DEFAULT_SKIP_MODULES.iter().map(|m| m.to_string()));
        rules.builtin_modules = rules.module_prefixes.len();
        rules
            .path_patterns
            .extend(DEFAULT_SKIP_PATHS.iter().map(|p| p.to_string()));
        rules
    }

    /// Registers a module prefix. Returns `false` when the prefix was
    /// rejected because the set is full.
    pub fn add_module(&mut self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches("::");
        if prefix.is_empty() || self.module_prefixes.contains(prefix) {
            return true;
        }
        if self.module_prefixes.len() - self.builtin_modules >= self.max_module_prefixes {
            event!(
                Level::WARN,
                prefix,
                limit = self.max_module_prefixes,
                "skip-module limit reached, ignoring prefix"
            );
            return false;
        }
        self.module_prefixes.insert(prefix.to_string());
        true
    }

    /// Registers a path suffix or substring.
    pub fn add_path(&mut self, pattern: &str) {
        if !pattern.is_empty() {
            self.path_patterns.insert(pattern.to_string());
        }
    }

    pub fn module_count(&self) -> usize {
        self.module_prefixes.len()
    }

    pub fn skips_module(&self, module: &str) -> bool {
        self.module_prefixes.iter().any(|prefix| {
            module
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
        })
    }

    pub fn skips_path(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.path_patterns
            .iter()
            .any(|pattern| path.ends_with(pattern.as_str()) || path.contains(pattern.as_str()))
    }

    /// Frames without a source file cannot be attributed and are skipped.
    pub fn skips(&self, frame: &Frame) -> bool {
        let Some(file) = frame.file.as_deref() else {
            return true;
        };
        frame.module.as_deref().is_some_and(|m| self.skips_module(m)) || self.skips_path(file)
    }
}

/// Outcome of a caller lookup.
#[derive(Debug, Default, PartialEq)]
pub struct Resolution {
    pub caller: Option<Frame>,
    /// The walk found named frames but not a single source location, as
    /// in binaries built without line tables.
    pub missing_line_tables: bool,
}

/// Finds the first frame not covered by `rules`, looking at `callsite`
/// first and walking the stack only if it was skipped. At most
/// `max_depth` frames are inspected.
pub fn resolve_caller(
    callsite: Option<Frame>,
    walker: &dyn StackWalker,
    rules: &SkipRules,
    max_depth: usize,
) -> Resolution {
    let mut depth = 0;
    let mut found = None;

    let mut inspect = |frame: Frame| -> bool {
        if depth >= max_depth {
            return false;
        }
        depth += 1;
        if rules.skips(&frame) {
            return true;
        }
        found = Some(frame);
        false
    };

    let keep_walking = match callsite {
        Some(frame) => inspect(frame),
        None => true,
    };
    let mut located = false;
    let mut unlocated = false;
    if keep_walking {
        walker.walk(&mut |frame: Frame| {
            if frame.file.is_some() {
                located = true;
            } else if frame.module.is_some() {
                unlocated = true;
            }
            inspect(frame)
        });
    }
    Resolution {
        missing_line_tables: found.is_none() && unlocated && !located,
        caller: found,
    }
}

/// Walker replaying a fixed list of frames, innermost first.
#[cfg(test)]
pub(crate) struct ScriptedWalker {
    pub frames: Vec<Frame>,
}

#[cfg(test)]
impl StackWalker for ScriptedWalker {
    fn walk(&self, visit: &mut dyn FnMut(Frame) -> bool) {
        for frame in &self.frames {
            if !visit(frame.clone()) {
                break;
            }
        }
    }
}
