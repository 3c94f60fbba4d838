//! Post status state machine and the per-destination aggregate.
use crate::model::{LinkStatus, PostStatus};

impl PostStatus {
    /// Whether a publish attempt may start from this state.
    pub fn is_publishable(&self) -> bool {
        matches!(
            self,
            PostStatus::Draft | PostStatus::Scheduled | PostStatus::Publishing
        )
    }

    /// Transitions this crate performs. SCHEDULED -> DRAFT is the unschedule action.
    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        use PostStatus::*;
        match (self, next) {
            (Draft, Scheduled) | (Scheduled, Scheduled) | (Scheduled, Draft) => true,
            (Draft, Publishing) | (Scheduled, Publishing) => true,
            (Publishing, Published) | (Publishing, PartiallyPublished) | (Publishing, Failed) => true,
            _ => false,
        }
    }
}

/// Aggregate status for a finished attempt. `None` when nothing was attempted.
pub fn aggregate<I>(outcomes: I) -> Option<PostStatus>
where
    I: IntoIterator<Item = LinkStatus>,
{
    let mut published = 0usize;
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome {
            LinkStatus::Published => published += 1,
            LinkStatus::Failed => failed += 1,
        }
    }

    match (published, failed) {
        (0, 0) => None,
        (_, 0) => Some(PostStatus::Published),
        (0, _) => Some(PostStatus::Failed),
        _ => Some(PostStatus::PartiallyPublished),
    }
}
