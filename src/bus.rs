use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::attachment::AttachmentPipeline;
use crate::dispatch::DispatchTable;
use crate::platform::{InboundEvent, Outbound};
use crate::router::{CommandRouter, Reply};

/// Shared application state: everything an event needs after it leaves
/// its adapter. Immutable once built.
pub struct Bus {
    router: CommandRouter,
    dispatch: DispatchTable,
    pipeline: AttachmentPipeline,
    permits: Arc<Semaphore>,
}

impl Bus {
    pub fn new(
        router: CommandRouter,
        dispatch: DispatchTable,
        pipeline: AttachmentPipeline,
        max_in_flight: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            dispatch,
            pipeline,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    pub fn sink(self: &Arc<Self>) -> EventSink {
        EventSink {
            bus: Arc::clone(self),
        }
    }

    /// Route one event and deliver its reply. Returns whether anything was
    /// sent back.
    ///
    /// An event whose origin has no sender fails before any handler runs.
    pub async fn process(&self, event: InboundEvent) -> Result<bool> {
        let outbound = self.dispatch.resolve(&event.origin)?;
        let reply = match self.router.dispatch(&event).await {
            Some(reply) if !reply.is_empty() => reply,
            _ => return Ok(false),
        };
        self.deliver(outbound.as_ref(), &event, reply).await?;
        Ok(true)
    }

    async fn deliver(
        &self,
        outbound: &dyn Outbound,
        event: &InboundEvent,
        reply: Reply,
    ) -> Result<()> {

        let (text, attachment) = if reply.rich.is_empty() {
            (reply.text, None)
        } else {
            let attachment = match self.pipeline.materialize(&reply.rich).await {
                Ok(attachment) => attachment,
                Err(e) => {
                    warn!(event = %event.id, "Failed to fetch {}: {:#}", reply.rich.image_url, e);
                    None
                }
            };
            let text = if reply.rich.text.is_empty() {
                reply.text
            } else {
                reply.rich.text.clone()
            };
            (text, attachment)
        };

        // The attachment's temp file lives until the end of this scope,
        // whichever way the send goes.
        outbound
            .send(&event.target(), &text, attachment.as_ref())
            .await
            .with_context(|| format!("Failed to send reply via {}", event.origin))?;
        debug!(
            event = %event.id,
            channel = %event.channel,
            elapsed_ms = (Utc::now() - event.received_at).num_milliseconds(),
            "Reply delivered"
        );
        Ok(())
    }
}

/// Handle adapters use to hand events to the bus.
#[derive(Clone)]
pub struct EventSink {
    bus: Arc<Bus>,
}

impl EventSink {
    /// Queue `event` on its own task.
    ///
    /// Waits for a free slot when too many events are in flight, which
    /// slows the submitting adapter down instead of piling up tasks.
    pub async fn submit(&self, event: InboundEvent) {
        let permit = match Arc::clone(&self.bus.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(event = %event.id, "Event pool closed, dropping event");
                return;
            }
        };

        let bus = Arc::clone(&self.bus);
        let event_id = event.id;
        let origin = event.origin.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            bus.process(event).await
        });

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(event = %event_id, account = %origin, "Event failed: {:#}", e)
                }
                Err(e) => {
                    error!(event = %event_id, account = %origin, "Event task panicked: {}", e)
                }
            }
        });
    }
}
