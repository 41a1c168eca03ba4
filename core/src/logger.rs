use std::fmt::Write;
use std::sync::{Arc, OnceLock};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Receives log lines from the core, e.g. to forward them to the host app's log
pub trait CoreLogger: Send + Sync {
    fn log(&self, level: String, message: String);
}

// Set once by init_logger
static GLOBAL_LOGGER: OnceLock<Arc<dyn CoreLogger>> = OnceLock::new();

/// Forwards tracing events to a [`CoreLogger`]
pub struct CallbackLayer {
    logger: Arc<dyn CoreLogger>,
}

impl CallbackLayer {
    pub fn new(logger: Arc<dyn CoreLogger>) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = event.metadata().level().to_string();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.logger.log(level, visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Route the core's tracing output to `callback`.
///
/// Only the first call installs anything; `level` is an `EnvFilter`
/// directive such as "info".
pub fn init_logger(callback: Box<dyn CoreLogger>, level: &str) {
    if GLOBAL_LOGGER.set(Arc::from(callback)).is_err() {
        return;
    }
    let Some(logger) = GLOBAL_LOGGER.get() else {
        return;
    };

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(CallbackLayer::new(Arc::clone(logger)))
        .with(filter);

    let _ = tracing::subscriber::set_global_default(subscriber);
}
