//! Message size estimation.
//!
//! The byte estimate is the UTF-8 length of the formatted message. When a
//! template cannot be rendered with the supplied arguments the raw template
//! is measured instead.

use std::fmt::{self, Write};
use std::panic::{self, AssertUnwindSafe};

use crate::tracker::TrackError;

/// The payload of an intercepted call.
#[derive(Clone, Copy)]
pub enum Message<'a> {
    /// A `{}` style template with positional arguments.
    Template {
        template: &'a str,
        args: &'a [&'a dyn fmt::Display],
    },
    /// Text that has already been formatted by the caller.
    Text(&'a str),
    /// A message rendered by the logging facade, with the text it was
    /// rendered from.
    Rendered { template: &'a str, rendered: &'a str },
}

impl<'a> Message<'a> {
    /// The unformatted message as supplied by the caller.
    pub fn template(&self) -> &'a str {
        match *self {
            Message::Template { template, .. } | Message::Rendered { template, .. } => template,
            Message::Text(text) => text,
        }
    }

    /// Size in bytes of the message as it would be written.
    pub fn estimated_size(&self) -> usize {
        match *self {
            Message::Template { template, args } if !args.is_empty() => {
                render_guarded(template, args).map_or(template.len(), |rendered| rendered.len())
            }
            Message::Rendered { rendered, .. } => rendered.len(),
            _ => self.template().len(),
        }
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Template { template, args } => f
                .debug_struct("Template")
                .field("template", template)
                .field("args", &args.len())
                .finish(),
            Message::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Message::Rendered { template, rendered } => f
                .debug_struct("Rendered")
                .field("template", template)
                .field("rendered", rendered)
                .finish(),
        }
    }
}

/// Renders a template, treating a panicking `Display` impl like any other
/// formatting failure.
fn render_guarded(template: &str, args: &[&dyn fmt::Display]) -> Result<String, TrackError> {
    panic::catch_unwind(AssertUnwindSafe(|| render(template, args)))
        .unwrap_or(Err(TrackError::FormatPanicked))
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Align {
    Left,
    Center,
    Right,
}

/// The part of a placeholder after `:`, limited to what applies to a
/// `Display` value: `[[fill]align][+][0][width][.precision]`.
#[derive(Debug, PartialEq)]
struct FormatSpec {
    fill: char,
    align: Option<Align>,
    plus: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            plus: false,
            zero: false,
            width: 0,
            precision: None,
        }
    }
}

fn parse_align(c: char) -> Option<Align> {
    match c {
        '<' => Some(Align::Left),
        '^' => Some(Align::Center),
        '>' => Some(Align::Right),
        _ => None,
    }
}

fn take_number(rest: &str) -> (Option<usize>, &str) {
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    (rest[..end].parse().ok(), &rest[end..])
}

impl FormatSpec {
    /// Returns `None` for anything else, e.g. `?`, `x` or `width$`.
    fn parse(spec: &str) -> Option<Self> {
        let mut parsed = FormatSpec::default();
        let mut chars = spec.chars();
        let mut rest = spec;

        match (chars.next(), chars.next()) {
            (Some(fill), Some(second)) if parse_align(second).is_some() => {
                parsed.fill = fill;
                parsed.align = parse_align(second);
                rest = &spec[fill.len_utf8() + 1..];
            }
            (Some(first), _) if parse_align(first).is_some() => {
                parsed.align = parse_align(first);
                rest = &spec[1..];
            }
            _ => {}
        }
        if let Some(after) = rest.strip_prefix('+') {
            parsed.plus = true;
            rest = after;
        }
        if let Some(after) = rest.strip_prefix('0') {
            parsed.zero = true;
            rest = after;
        }
        let (width, after) = take_number(rest);
        parsed.width = width.unwrap_or(0);
        rest = after;
        if let Some(after) = rest.strip_prefix('.') {
            let (precision, after) = take_number(after);
            parsed.precision = Some(precision?);
            rest = after;
        }
        rest.is_empty().then_some(parsed)
    }

    fn write(&self, out: &mut String, arg: &dyn fmt::Display) -> fmt::Result {
        let width = self.width;
        let Some(align) = self.align else {
            // Without an explicit alignment the value picks its own, as
            // numbers and strings differ.
            return match (self.plus, self.zero, self.precision) {
                (false, false, None) => write!(out, "{:w$}", arg, w = width),
                (false, false, Some(p)) => write!(out, "{:w$.p$}", arg, w = width, p = p),
                (true, false, None) => write!(out, "{:+w$}", arg, w = width),
                (true, false, Some(p)) => write!(out, "{:+w$.p$}", arg, w = width, p = p),
                (false, true, None) => write!(out, "{:0w$}", arg, w = width),
                (false, true, Some(p)) => write!(out, "{:0w$.p$}", arg, w = width, p = p),
                (true, true, None) => write!(out, "{:+0w$}", arg, w = width),
                (true, true, Some(p)) => write!(out, "{:+0w$.p$}", arg, w = width, p = p),
            };
        };

        let body = match (self.plus, self.precision) {
            (false, None) => format!("{}", arg),
            (false, Some(p)) => format!("{:.p$}", arg, p = p),
            (true, None) => format!("{:+}", arg),
            (true, Some(p)) => format!("{:+.p$}", arg, p = p),
        };
        let padding = width.saturating_sub(body.chars().count());
        let (before, after) = match align {
            Align::Left => (0, padding),
            Align::Center => (padding / 2, padding - padding / 2),
            Align::Right => (padding, 0),
        };
        out.extend(std::iter::repeat(self.fill).take(before));
        out.push_str(&body);
        out.extend(std::iter::repeat(self.fill).take(after));
        Ok(())
    }
}

/// Substitutes `{}`, `{N}`, `{:spec}` and `{N:spec}` placeholders with the
/// `Display` form of the positional arguments. Fill, alignment, sign,
/// zero padding, width and precision follow `format!`. `{{` and `}}` are
/// literal braces. Every argument must be consumed by at least one
/// placeholder.
pub fn render(template: &str, args: &[&dyn fmt::Display]) -> Result<String, TrackError> {
    let mut out = String::with_capacity(template.len() + args.len() * 8);
    let mut used = vec![false; args.len()];
    let mut next = 0;
    let mut chars = template.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|&(_, c)| c) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().map(|&(_, c)| c) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let end = template[start..]
                    .find('}')
                    .map(|offset| start + offset)
                    .ok_or(TrackError::MalformedTemplate { position: start })?;
                let placeholder = &template[start + 1..end];
                let (position, spec) = placeholder
                    .split_once(':')
                    .unwrap_or((placeholder, ""));
                let index = if position.is_empty() {
                    next += 1;
                    next - 1
                } else {
                    position
                        .parse::<usize>()
                        .map_err(|_| TrackError::MalformedTemplate { position: start })?
                };
                let spec = FormatSpec::parse(spec)
                    .ok_or(TrackError::UnsupportedFormat { position: start })?;
                let arg = args.get(index).ok_or(TrackError::MissingArgument {
                    index,
                    supplied: args.len(),
                })?;
                spec.write(&mut out, *arg)?;
                used[index] = true;
                while chars.peek().is_some_and(|&(i, _)| i <= end) {
                    chars.next();
                }
            }
            '}' => return Err(TrackError::MalformedTemplate { position: start }),
            c => out.push(c),
        }
    }

    if let Some(unused) = used.iter().position(|used| !used) {
        return Err(TrackError::UnusedArgument { index: unused });
    }
    Ok(out)
}
