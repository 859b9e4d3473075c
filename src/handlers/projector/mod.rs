//! Projector: keeps a derived target entity in sync with a source entity.
//!
//! For each source change the projector loads the target, asks the
//! [`Projection`] policy what to write, and writes it through the entity
//! store. The load-decide-write sequence is retried as a whole on write
//! contention, so concurrent projectors for the same target converge.
//! Replaying a change is safe as long as the policy is deterministic.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::bus::{BusError, BusEvent, EventHandler, EventPattern};
use crate::cdc::ChangeRecord;
use crate::entity::{
    CreateInput, EntityError, EntityStore, EntityType, Item, PrimaryKey, ReadOptions, Result,
    UpdateInput,
};
use crate::utils::retry::{retry, RetryPolicy};

/// Policy mapping source changes onto a target entity type.
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    /// The entity type this projection writes.
    fn target(&self) -> &EntityType;

    /// Key of the target for `source`, or `None` to ignore the change.
    fn target_key(&self, source: &ChangeRecord) -> Result<Option<PrimaryKey>>;

    /// Update for an existing target, or `None` when it is already current.
    ///
    /// A returned input without an expected version is written against the
    /// version of `current`.
    fn on_update(&self, source: &ChangeRecord, current: &Item) -> Result<Option<UpdateInput>>;

    /// Input for a missing target, or `None` to leave it absent.
    fn on_create(&self, source: &ChangeRecord) -> Result<Option<CreateInput>>;
}

/// What one projection pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOutcome {
    Created(Item),
    Updated(Item),
    /// The policy chose not to write.
    Unchanged,
    /// The change does not map to a target.
    Skipped,
}

impl ProjectionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
        }
    }
}

/// Applies a [`Projection`] through an [`EntityStore`].
pub struct Projector {
    store: Arc<EntityStore>,
    projection: Arc<dyn Projection>,
    retry: RetryPolicy,
}

impl Projector {
    pub fn new(store: Arc<EntityStore>, projection: Arc<dyn Projection>) -> Self {
        Self {
            store,
            projection,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        self.projection.name()
    }

    /// Project one source change.
    pub async fn project(&self, source: &ChangeRecord) -> Result<ProjectionOutcome> {
        let outcome = retry(&self.retry, || self.project_once(source)).await?;
        debug!(
            projection = %self.projection.name(),
            sequence_number = ?source.sequence_number,
            outcome = outcome.label(),
            "Projected change"
        );
        Ok(outcome)
    }

    /// Project the change carried by a bus event.
    pub async fn handle_event(&self, event: &BusEvent) -> Result<ProjectionOutcome> {
        let source = ChangeRecord::from_detail(&event.detail)
            .map_err(|e| EntityError::Decoding(e.to_string()))?;
        self.project(&source).await
    }

    async fn project_once(&self, source: &ChangeRecord) -> Result<ProjectionOutcome> {
        let target = self.projection.target();
        let key = match self.projection.target_key(source)? {
            Some(key) => key,
            None => return Ok(ProjectionOutcome::Skipped),
        };

        match self
            .store
            .read_key(target, &key, ReadOptions::consistent())
            .await
        {
            Ok(current) => {
                let current = current.data;
                match self.projection.on_update(source, &current)? {
                    Some(mut input) => {
                        if input.expected_version.is_none() {
                            input.expected_version = current.version;
                        }
                        let updated = self.store.update(target, input).await?;
                        Ok(ProjectionOutcome::Updated(updated.data))
                    }
                    None => Ok(ProjectionOutcome::Unchanged),
                }
            }
            Err(e) if e.is_not_found() => match self.projection.on_create(source)? {
                Some(input) => {
                    let created = self.store.create(target, input).await?;
                    Ok(ProjectionOutcome::Created(created.data))
                }
                None => Ok(ProjectionOutcome::Unchanged),
            },
            Err(e) => Err(e),
        }
    }
}

/// Bus handler running a projector for events matching a pattern.
pub struct ProjectorHandler {
    projector: Arc<Projector>,
    pattern: EventPattern,
}

impl ProjectorHandler {
    pub fn new(projector: Arc<Projector>, pattern: EventPattern) -> Self {
        info!(
            projection = %projector.name(),
            pattern = ?pattern,
            "Projector handler created"
        );
        Self { projector, pattern }
    }
}

impl EventHandler for ProjectorHandler {
    fn handle(&self, event: Arc<BusEvent>) -> BoxFuture<'static, std::result::Result<(), BusError>> {
        let projector = self.projector.clone();
        let matches = self.pattern.matches(&event);

        Box::pin(async move {
            if !matches {
                return Ok(());
            }
            projector
                .handle_event(&event)
                .await
                .map(|_| ())
                .map_err(|e| BusError::HandlerFailed {
                    name: projector.name().to_string(),
                    message: e.to_string(),
                })
        })
    }
}

#[cfg(test)]
mod tests;
