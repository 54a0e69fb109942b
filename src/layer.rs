//! Interception of `tracing` events.
//!
//! [`CostLayer`] feeds every event that passes the subscriber's filters to a
//! [`LogCostTracker`] before the output layer sees it. [`AttributedFormat`]
//! lets a `fmt` layer print the caller the tracker resolved, so the written
//! log line and the stats agree on the location.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::accumulator::Severity;
use crate::estimate::Message;
use crate::stack::Frame;
use crate::tracker::{CallSite, LogCostTracker};

thread_local! {
    static TRACKING: Cell<bool> = const { Cell::new(false) };
    static LAST_CALLER: RefCell<Option<CallSite>> = const { RefCell::new(None) };
}

/// Marks the current thread as inside the tracker. Events emitted while
/// the mark is set (e.g. by a `Debug` impl that logs) are not tracked.
struct Reentrancy;

impl Reentrancy {
    fn enter() -> Option<Self> {
        let entered = TRACKING.try_with(|flag| !flag.replace(true)).unwrap_or(false);
        entered.then(|| Reentrancy)
    }
}

impl Drop for Reentrancy {
    fn drop(&mut self) {
        let _ = TRACKING.try_with(|flag| flag.set(false));
    }
}

fn set_last_caller(site: Option<CallSite>) {
    let _ = LAST_CALLER.try_with(|slot| *slot.borrow_mut() = site);
}

/// Takes the caller resolved for the event currently being dispatched on
/// this thread.
pub fn take_last_caller() -> Option<CallSite> {
    LAST_CALLER
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
}

fn is_own_event(metadata: &Metadata<'_>) -> bool {
    let own = |path: &str| path == "logcost" || path.starts_with("logcost::");
    metadata.module_path().map_or_else(|| own(metadata.target()), own)
}

/// Collects the message and the remaining fields of an event the way the
/// default `fmt` output renders them.
#[derive(Default)]
struct EventText {
    message: String,
    fields: String,
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Layer that records every event it sees into a [`LogCostTracker`].
#[derive(Clone)]
pub struct CostLayer {
    tracker: Arc<LogCostTracker>,
}

impl CostLayer {
    pub fn new(tracker: Arc<LogCostTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<LogCostTracker> {
        &self.tracker
    }

    fn observe(&self, event: &Event<'_>) -> Option<CallSite> {
        let metadata = event.metadata();
        let mut text = EventText::default();
        event.record(&mut text);

        let rendered = format!("{}{}", text.message, text.fields);
        let callsite = Frame::new(
            metadata.module_path(),
            metadata.file(),
            metadata.line().unwrap_or(0),
        );
        self.tracker.track(
            Severity::from(metadata.level()),
            Message::Rendered {
                template: &text.message,
                rendered: &rendered,
            },
            Some(callsite),
        )
    }
}

impl<S> Layer<S> for CostLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        set_last_caller(None);
        if is_own_event(event.metadata()) {
            return;
        }
        let Some(_guard) = Reentrancy::enter() else {
            return;
        };
        // Field values are user code; a panicking `Debug` impl must not
        // escape through the tracker.
        let site = panic::catch_unwind(AssertUnwindSafe(|| self.observe(event)))
            .ok()
            .flatten();
        set_last_caller(site);
    }
}

/// Event format printing the tracker's attribution for each line:
/// `<timestamp> <LEVEL> <file>:<line>: <target>: <fields>`.
///
/// Falls back to the event's own location when no tracker ran for it.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttributedFormat;

impl<S, N> FormatEvent<S, N> for AttributedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{} {:>5} ",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            metadata.level()
        )?;

        match take_last_caller() {
            Some(site) => write!(writer, "{}:{}: ", site.file, site.line)?,
            None => {
                if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
                    write!(writer, "{}:{}: ", file, line)?;
                }
            }
        }

        write!(writer, "{}: ", metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// An event seen by [`CaptureLayer`].
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct CapturedEvent {
    pub level: tracing::Level,
    pub fields: Vec<(String, String)>,
}

#[cfg(test)]
impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
impl Visit for CapturedEvent {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields
            .push((field.name().to_string(), format!("{:?}", value)));
    }
}

/// Layer keeping every event it sees, for asserting on emitted logs.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CaptureLayer {
    pub events: Arc<parking_lot::Mutex<Vec<CapturedEvent>>>,
}

#[cfg(test)]
impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = CapturedEvent {
            level: *event.metadata().level(),
            fields: Vec::new(),
        };
        event.record(&mut captured);
        self.events.lock().push(captured);
    }
}
