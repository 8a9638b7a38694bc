// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implements a [`tracing_subscriber::Layer`] that forwards events to the
//! host's log.

use crate::host::Host;
use crate::host::LogLevel;
use std::fmt::Debug;
use std::fmt::Write;
use std::sync::Arc;
use tracing::Event;
use tracing::Subscriber;
use tracing::field::Field;
use tracing::field::Visit;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Sends every event to [`Host::log`] as one line: the message followed by
/// the remaining fields as `name=value`.
///
/// ```ignore
/// tracing_subscriber::registry()
///     .with(HostLogLayer::new(host.clone()))
///     .init();
/// ```
pub struct HostLogLayer {
    host: Arc<dyn Host>,
}

impl HostLogLayer {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.host
            .log(LogLevel::from(*event.metadata().level()), &line.finish())
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(mut self) -> String {
        if self.message.is_empty() {
            // Field-only event; drop the leading separator.
            self.fields.drain(..self.fields.len().min(1));
            return self.fields;
        }
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = write!(self.fields, " {}={:#x}", field.name(), value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let _ = write!(self.fields, " {}={}", field.name(), value);
        let mut source = value.source();
        while let Some(err) = source {
            let _ = write!(self.fields, ": {err}");
            source = err.source();
        }
    }
}
