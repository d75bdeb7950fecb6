//! Category to handler dispatch

use policywatch_core::{Result, ViolationCategory, WatchedEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::delivery::{ConsoleSink, InsightsClient, InsightsConfig, Sink};
use crate::handler::{HandleOutcome, ViolationHandler};

/// What the dispatcher did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler processed the event
    Handled(ViolationCategory, HandleOutcome),
    /// No category or no handler for it; the event is dropped
    Unrouted,
}

/// Routes classified events to the handler for their category
#[derive(Debug, Default)]
pub struct Dispatcher {
    handlers: HashMap<ViolationCategory, ViolationHandler>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// One handler per category, each with a sink from `make_sink`
    pub fn with_sinks<F>(requests_per_minute: u32, mut make_sink: F) -> Result<Self>
    where
        F: FnMut(ViolationCategory) -> Result<Arc<dyn Sink>>,
    {
        let mut dispatcher = Self::new();
        for category in ViolationCategory::ALL {
            dispatcher.register(ViolationHandler::new(category, make_sink(category)?, requests_per_minute));
        }
        Ok(dispatcher)
    }

    /// Every category delivers to the Insights API through its own client
    pub fn insights(config: &InsightsConfig, requests_per_minute: u32) -> Result<Self> {
        Self::with_sinks(requests_per_minute, |_| {
            Ok(Arc::new(InsightsClient::new(config)?) as Arc<dyn Sink>)
        })
    }

    /// Every category renders to stdout
    pub fn console(requests_per_minute: u32) -> Self {
        let mut dispatcher = Self::new();
        for category in ViolationCategory::ALL {
            dispatcher.register(ViolationHandler::new(category, Arc::new(ConsoleSink), requests_per_minute));
        }
        dispatcher
    }

    /// Register a handler, replacing any existing one for its category
    pub fn register(&mut self, handler: ViolationHandler) {
        self.handlers.insert(handler.category(), handler);
    }

    pub fn handler(&self, category: ViolationCategory) -> Option<&ViolationHandler> {
        self.handlers.get(&category)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The category stamped at classification time, else recovered from the name prefix
    pub fn category_of(event: &WatchedEvent) -> Option<ViolationCategory> {
        event
            .category
            .or_else(|| ViolationCategory::from_name(&event.name))
    }

    /// Hand the event to its category handler.
    ///
    /// Events with no category or no registered handler are not errors.
    pub async fn dispatch(&self, event: &WatchedEvent) -> Result<DispatchOutcome> {
        let Some(category) = Self::category_of(event) else {
            debug!(name = %event.name, "No violation category for event, dropping");
            return Ok(DispatchOutcome::Unrouted);
        };
        let Some(handler) = self.handlers.get(&category) else {
            debug!(name = %event.name, category = %category, "No handler registered, dropping");
            return Ok(DispatchOutcome::Unrouted);
        };

        match handler.handle(event).await {
            Ok(outcome) => {
                record_delivery(category, outcome.as_str());
                Ok(DispatchOutcome::Handled(category, outcome))
            }
            Err(e) => {
                record_delivery(category, "error");
                Err(e)
            }
        }
    }
}

fn record_delivery(category: ViolationCategory, outcome: &'static str) {
    metrics::counter!(
        "policywatch_deliveries_total",
        "category" => category.prefix(),
        "outcome" => outcome
    )
    .increment(1);
}
