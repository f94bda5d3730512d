//! Invalidation plan generation.
//!
//! Folds a batch of inbound notifications into one plan: duplicate deliveries
//! collapse by event id, and per `(kind, id)` only the action with the latest
//! receive epoch survives.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use coherence_wire::ChangeAction;

use crate::domain::keys::ResourceKind;

use super::events::{Epoch, InboundEvent};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Detail entries to mark stale.
    pub stale_details: BTreeSet<(ResourceKind, String)>,
    /// Details to delete outright and purge from reference tables.
    pub removals: BTreeSet<(ResourceKind, String)>,
    /// Kinds whose list queries go stale.
    pub stale_lists: BTreeSet<ResourceKind>,
    /// Kinds whose every query goes stale (notifications without changes).
    pub stale_kinds: BTreeSet<ResourceKind>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ stale_details: {}, removals: {}, stale_lists: {}, stale_kinds: {} }}",
            self.stale_details.len(),
            self.removals.len(),
            self.stale_lists.len(),
            self.stale_kinds.len(),
        )
    }
}

impl InvalidationPlan {
    pub fn from_events(events: Vec<InboundEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen = HashSet::new();
        let mut latest: HashMap<(ResourceKind, String), (Epoch, ChangeAction)> = HashMap::new();

        for event in events.into_iter().filter(|e| seen.insert(e.id)) {
            let kind = ResourceKind::from(event.notification.resource_kind.as_str());
            if event.notification.changes.is_empty() {
                plan.stale_kinds.insert(kind);
                continue;
            }
            plan.stale_lists.insert(kind.clone());
            for change in event.notification.changes {
                latest
                    .entry((kind.clone(), change.id))
                    .and_modify(|(epoch, action)| {
                        if event.epoch >= *epoch {
                            *epoch = event.epoch;
                            *action = change.action;
                        }
                    })
                    .or_insert((event.epoch, change.action));
            }
        }

        for (target, (_, action)) in latest {
            match action {
                ChangeAction::Removed => {
                    plan.removals.insert(target);
                }
                ChangeAction::Created | ChangeAction::Updated => {
                    plan.stale_details.insert(target);
                }
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.stale_details.is_empty()
            && self.removals.is_empty()
            && self.stale_lists.is_empty()
            && self.stale_kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use coherence_wire::{Change, ChangeNotification};
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;

    fn event(epoch: Epoch, notification: ChangeNotification) -> InboundEvent {
        InboundEvent {
            id: Uuid::new_v4(),
            epoch,
            notification,
            received_at: datetime!(2026-05-01 09:00 UTC),
        }
    }

    fn target(kind: &str, id: &str) -> (ResourceKind, String) {
        (ResourceKind::from(kind), id.to_string())
    }

    #[test]
    fn duplicate_deliveries_collapse() {
        let removed = event(
            0,
            ChangeNotification::single("task", "T9", ChangeAction::Removed),
        );
        let plan = InvalidationPlan::from_events(vec![removed.clone(), removed]);

        assert_eq!(plan.removals.len(), 1);
        assert!(plan.removals.contains(&target("task", "T9")));
        assert!(plan.stale_lists.contains(&ResourceKind::from("task")));
    }

    #[test]
    fn latest_epoch_wins_per_resource() {
        let plan = InvalidationPlan::from_events(vec![
            event(2, ChangeNotification::single("task", "T1", ChangeAction::Updated)),
            event(1, ChangeNotification::single("task", "T1", ChangeAction::Removed)),
            event(3, ChangeNotification::single("task", "T2", ChangeAction::Removed)),
            event(4, ChangeNotification::single("task", "T2", ChangeAction::Created)),
        ]);

        assert!(plan.stale_details.contains(&target("task", "T1")));
        assert!(plan.stale_details.contains(&target("task", "T2")));
        assert!(plan.removals.is_empty());
    }

    #[test]
    fn kinds_are_kept_apart() {
        let plan = InvalidationPlan::from_events(vec![event(
            0,
            ChangeNotification::new(
                "project",
                vec![
                    Change {
                        id: "P1".into(),
                        action: ChangeAction::Updated,
                    },
                    Change {
                        id: "P2".into(),
                        action: ChangeAction::Removed,
                    },
                ],
            ),
        )]);

        assert_eq!(
            plan.stale_details.iter().collect::<Vec<_>>(),
            vec![&target("project", "P1")]
        );
        assert_eq!(
            plan.removals.iter().collect::<Vec<_>>(),
            vec![&target("project", "P2")]
        );
    }

    #[test]
    fn empty_change_list_stales_whole_kind() {
        let plan = InvalidationPlan::from_events(vec![event(
            0,
            ChangeNotification::new("status_catalog", Vec::new()),
        )]);
        assert!(plan.stale_kinds.contains(&ResourceKind::from("status_catalog")));
        assert!(!plan.is_empty());
    }

    #[test]
    fn no_events_no_plan() {
        assert!(InvalidationPlan::from_events(Vec::new()).is_empty());
    }
}
