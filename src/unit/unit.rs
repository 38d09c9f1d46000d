use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;

use super::error::{UnitError, UnitResult};
use super::message::{ElementStatus, WorkContext};
use crate::queue::QueueItem;

/// A pluggable piece of graph-property processing.
///
/// The runner asks the status-specific matcher first (`matches` for updates,
/// `matches_deleted` / `matches_hidden` / `matches_unhidden` for the other statuses) and
/// calls `execute` only when it accepts. Matchers must be pure; `execute` may be called again
/// for the same element and must tolerate that.
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the runner starts pulling work.
    async fn prepare(&self) -> UnitResult<()> {
        Ok(())
    }

    fn matches(&self, ctx: &WorkContext) -> bool;

    fn matches_deleted(&self, _ctx: &WorkContext) -> bool {
        false
    }

    fn matches_hidden(&self, _ctx: &WorkContext) -> bool {
        false
    }

    fn matches_unhidden(&self, _ctx: &WorkContext) -> bool {
        false
    }

    /// Do the work. Returned items are pushed to their queues by the runner.
    async fn execute(&self, ctx: &WorkContext) -> UnitResult<Vec<QueueItem>>;
}

/// Route a context to the matcher for its status.
pub(crate) fn accepts(unit: &dyn ProcessingUnit, ctx: &WorkContext) -> bool {
    match ctx.status {
        ElementStatus::Update => unit.matches(ctx),
        ElementStatus::Deletion => unit.matches_deleted(ctx),
        ElementStatus::Hidden => unit.matches_hidden(ctx),
        ElementStatus::Unhidden => unit.matches_unhidden(ctx),
    }
}

type Matcher = Box<dyn Fn(&WorkContext) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(WorkContext) -> BoxFuture<'static, UnitResult<Vec<QueueItem>>> + Send + Sync>;

/// A unit built from closures.
///
/// ```rust,no_run
/// use property_runner::{FnUnit, PropertyMessage, QueueItem};
///
/// let unit = FnUnit::new(
///     "text-extractor",
///     |ctx| ctx.property_name_is("raw"),
///     |ctx| async move {
///         let derived = ctx.derive().property("", "text").to_item("graph-property")?;
///         Ok::<_, property_runner::UnitError>(vec![derived])
///     },
/// );
/// ```
pub struct FnUnit {
    name: String,
    statuses: Vec<ElementStatus>,
    matcher: Matcher,
    handler: Handler,
}

impl FnUnit {
    pub fn new<M, H, Fut>(name: impl Into<String>, matcher: M, handler: H) -> Self
    where
        M: Fn(&WorkContext) -> bool + Send + Sync + 'static,
        H: Fn(WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UnitResult<Vec<QueueItem>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            statuses: vec![ElementStatus::Update],
            matcher: Box::new(matcher),
            handler: Box::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    /// Statuses the matcher applies to. Updates only by default.
    pub fn on_statuses(mut self, statuses: &[ElementStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    fn handles(&self, status: ElementStatus, ctx: &WorkContext) -> bool {
        self.statuses.contains(&status) && (self.matcher)(ctx)
    }
}

#[async_trait]
impl ProcessingUnit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, ctx: &WorkContext) -> bool {
        self.handles(ElementStatus::Update, ctx)
    }

    fn matches_deleted(&self, ctx: &WorkContext) -> bool {
        self.handles(ElementStatus::Deletion, ctx)
    }

    fn matches_hidden(&self, ctx: &WorkContext) -> bool {
        self.handles(ElementStatus::Hidden, ctx)
    }

    fn matches_unhidden(&self, ctx: &WorkContext) -> bool {
        self.handles(ElementStatus::Unhidden, ctx)
    }

    async fn execute(&self, ctx: &WorkContext) -> Result<Vec<QueueItem>, UnitError> {
        (self.handler)(ctx.clone()).await
    }
}

impl std::fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUnit")
            .field("name", &self.name)
            .field("statuses", &self.statuses)
            .finish()
    }
}
