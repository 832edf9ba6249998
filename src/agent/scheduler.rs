//! Periodic tasks for agents.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::runtime::AgentRuntime;
use crate::context::Context;
use crate::core::protocol::{HandlerFuture, IntervalHandler};
use crate::error::{Error, Result};

/// A callback run every `period` while the agent is running.
#[derive(Clone)]
pub struct IntervalTask {
    pub period: Duration,
    handler: IntervalHandler,
}

impl IntervalTask {
    pub fn new<F, Fut>(period: Duration, handler: F) -> Result<Self>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if period.is_zero() {
            return Err(Error::Config("interval period must be positive".to_string()));
        }
        let handler = Arc::new(handler);
        Ok(Self {
            period,
            handler: Arc::new(move |ctx: Context| -> HandlerFuture {
                let handler = Arc::clone(&handler);
                Box::pin(async move { handler(ctx).await })
            }),
        })
    }
}

impl std::fmt::Debug for IntervalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalTask")
            .field("period", &self.period)
            .finish()
    }
}

/// Run `task` on its own tokio task. The first tick fires immediately; a
/// tick that overruns pushes the next one back instead of bursting.
pub(crate) fn spawn_interval(runtime: Arc<AgentRuntime>, task: IntervalTask) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(task.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let ctx = Context::new(Arc::clone(&runtime), Uuid::new_v4());
            match tokio::spawn((task.handler)(ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(agent = %runtime.name, "Interval handler failed: {:#}", e);
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(agent = %runtime.name, "Interval handler panicked");
                }
                Err(_) => break,
            }
        }
    })
}
