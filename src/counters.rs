use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::models::{Id, ReactionType};
use crate::repo::{CounterField, PostRepo, StoreEvent};

/// Applies store change events to the denormalized post counters.
///
/// This is the asynchronous half of the counter protocol: reaction and
/// top-level-comment writes commit without touching the post document, and
/// this worker catches up with guarded ±1 adjustments. Increments are
/// commutative, so out-of-order application still settles on the exact
/// count.
pub struct CounterWorker {
    repo: Arc<dyn PostRepo>,
    rx: UnboundedReceiver<StoreEvent>,
}

pub fn counter_channel() -> (UnboundedSender<StoreEvent>, UnboundedReceiver<StoreEvent>) {
    mpsc::unbounded_channel()
}

impl CounterWorker {
    pub fn new(repo: Arc<dyn PostRepo>, rx: UnboundedReceiver<StoreEvent>) -> Self {
        Self { repo, rx }
    }

    /// Server mode: consume events until the store side hangs up.
    pub async fn run(mut self) {
        while let Some(ev) = self.rx.recv().await {
            self.apply(ev).await;
        }
    }

    /// Process everything currently queued, then return. Deterministic
    /// settling point for tests.
    pub async fn drain(&mut self) {
        while let Ok(ev) = self.rx.try_recv() {
            self.apply(ev).await;
        }
    }

    async fn apply(&self, ev: StoreEvent) {
        let (post_id, deltas): (Id, Vec<(CounterField, i64)>) = match ev {
            StoreEvent::ReactionCreated { post_id, kind } => {
                (post_id, vec![(field_for(kind), 1)])
            }
            StoreEvent::ReactionSwitched { post_id, from, to } => {
                // both adjustments land in one atomic unit on the post
                (post_id, vec![(field_for(from), -1), (field_for(to), 1)])
            }
            StoreEvent::ReactionDeleted { post_id, kind } => {
                (post_id, vec![(field_for(kind), -1)])
            }
            StoreEvent::CommentCreated { post_id, top_level: true } => {
                (post_id, vec![(CounterField::Comments, 1)])
            }
            StoreEvent::CommentDeleted { post_id, top_level: true } => {
                (post_id, vec![(CounterField::Comments, -1)])
            }
            // replies never touch the post's comment counter
            StoreEvent::CommentCreated { top_level: false, .. }
            | StoreEvent::CommentDeleted { top_level: false, .. } => return,
        };
        // a missing post is already a silent no-op inside adjust_counters;
        // anything surfacing here is a store-level failure
        if let Err(e) = self.repo.adjust_counters(&post_id, &deltas).await {
            log::warn!("counter adjustment dropped for post {post_id}: {e}");
        }
    }
}

fn field_for(kind: ReactionType) -> CounterField {
    match kind {
        ReactionType::Like => CounterField::Likes,
        ReactionType::Dislike => CounterField::Dislikes,
    }
}
