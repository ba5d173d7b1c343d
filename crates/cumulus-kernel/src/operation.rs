//! Traced operations.
//!
//! An [`Operation`] is a unit of filesystem work that runs inside its own
//! [`OperationFrame`]. [`Operation::run`] handles the frame lifecycle; an
//! implementation only supplies [`Operation::execute`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::Instrument;

use cumulus_types::{Actor, CoreResult};

use crate::trace::{FrameStatus, OperationFrame, TraceService};

/// Who is running an operation, and under which frame.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub actor: Actor,
    pub trace: TraceService,
    frame: Option<Arc<OperationFrame>>,
}

impl OpContext {
    pub fn new(actor: Actor, trace: TraceService) -> Self {
        Self {
            actor,
            trace,
            frame: None,
        }
    }

    /// A context whose operations nest under an existing frame, such as
    /// one a request handler opened.
    pub fn within(actor: Actor, trace: TraceService, frame: Arc<OperationFrame>) -> Self {
        Self {
            actor,
            trace,
            frame: Some(frame),
        }
    }

    /// The current frame, if running inside an operation.
    pub fn frame(&self) -> Option<&Arc<OperationFrame>> {
        self.frame.as_ref()
    }

    fn with_frame(&self, frame: Arc<OperationFrame>) -> Self {
        Self {
            actor: self.actor.clone(),
            trace: self.trace.clone(),
            frame: Some(frame),
        }
    }

    /// Record a checkpoint on the current frame.
    pub fn checkpoint(&self, name: &str) {
        if let Some(frame) = &self.frame {
            frame.checkpoint(name);
        }
    }

    /// Set an attribute on the current frame.
    pub fn field(&self, key: &str, value: impl Into<Value>) {
        if let Some(frame) = &self.frame {
            frame.attr(key, value);
        }
    }
}

#[async_trait]
pub trait Operation: Send + Sync {
    type Output: Send;

    /// Frame label.
    fn label(&self) -> &'static str;

    /// The operation body. `cx` carries this operation's own frame.
    async fn execute(&self, cx: &OpContext) -> CoreResult<Self::Output>;

    /// Run inside a new frame.
    ///
    /// The frame goes working → done, or ready when a child frame is still
    /// working. Children that never started are marked stuck. Errors are
    /// recorded on the frame and returned unchanged; a failed frame is
    /// swept and finished the same way, so failed roots leave the registry.
    async fn run(&self, cx: &OpContext) -> CoreResult<Self::Output> {
        let frame = cx.trace.add_frame(self.label(), cx.frame());
        let cx = cx.with_frame(Arc::clone(&frame));
        let span = tracing::debug_span!("operation", op = self.label(), frame = %frame.id());

        async {
            frame.set_status(FrameStatus::Working);
            frame.checkpoint("execute");
            match self.execute(&cx).await {
                Ok(out) => {
                    frame.checkpoint("post_run");
                    let any_async = frame.post_run();
                    frame.checkpoint("finished");
                    frame.set_status(if any_async {
                        FrameStatus::Ready
                    } else {
                        FrameStatus::Done
                    });
                    Ok(out)
                }
                Err(err) => {
                    if err.is_api_error() {
                        frame.attr("api-error", err.to_string());
                    } else {
                        frame.error(&err);
                    }
                    let any_async = frame.post_run();
                    frame.set_status(if any_async {
                        FrameStatus::Ready
                    } else {
                        FrameStatus::Done
                    });
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
