//! Slot planner — decides which replica slots need work.
//!
//! Live tasks (desired state not past `Running`) are grouped by slot. A slot
//! in `1..=replicas` is up to date when one of its live tasks runs the target
//! task spec and has not terminated; it needs a `Create` when nothing lives
//! there and a `Replace` otherwise. Live tasks outside that range, and
//! duplicates beside an up-to-date task, are surplus.
//!
//! Only the task spec is compared: service name, labels, replica count and
//! update policy never make a task dirty.

use std::collections::BTreeMap;

use shoal_state::{ServiceSpec, Slot, Task};

/// What a slot needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotActionKind {
    /// No live task occupies the slot.
    Create,
    /// The slot's live tasks are stale or dead.
    Replace,
}

/// One slot requiring a new task.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAction {
    pub slot: Slot,
    pub kind: SlotActionKind,
    /// Live tasks to retire in the same transaction that creates the replacement.
    pub occupants: Vec<Task>,
}

/// Output of [`plan`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotPlan {
    /// Slots needing a new task, ascending by slot.
    pub actions: Vec<SlotAction>,
    /// Live tasks no slot should keep.
    pub surplus: Vec<Task>,
}

impl SlotPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.surplus.is_empty()
    }

    /// Slots the run will dispatch; the failure ratio's denominator.
    pub fn targeted(&self) -> usize {
        self.actions.len()
    }
}

/// Whether `task` already realises `target` and is still healthy.
pub fn is_current(task: &Task, target: &ServiceSpec) -> bool {
    task.spec == target.task && !task.status.state.is_terminal()
}

/// Classify every slot of `target` against the service's `tasks`.
pub fn plan(target: &ServiceSpec, tasks: &[Task]) -> SlotPlan {
    let mut by_slot: BTreeMap<Slot, Vec<Task>> = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.is_live()) {
        by_slot.entry(task.slot).or_default().push(task.clone());
    }

    let mut result = SlotPlan::default();
    for slot in 1..=target.replicas {
        let Some(mut occupants) = by_slot.remove(&slot) else {
            result.actions.push(SlotAction {
                slot,
                kind: SlotActionKind::Create,
                occupants: Vec::new(),
            });
            continue;
        };

        match occupants.iter().position(|t| is_current(t, target)) {
            Some(keep) => {
                occupants.remove(keep);
                result.surplus.extend(occupants);
            }
            None => result.actions.push(SlotAction {
                slot,
                kind: SlotActionKind::Replace,
                occupants,
            }),
        }
    }

    // Whatever is left sits outside 1..=replicas.
    result.surplus.extend(by_slot.into_values().flatten());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_state::{ContainerSpec, TaskSpec, TaskState, UpdateConfig};

    fn spec(image: &str, replicas: u64) -> ServiceSpec {
        ServiceSpec {
            name: "web".to_string(),
            labels: Default::default(),
            task: task_spec(image),
            replicas,
            update: UpdateConfig::default(),
        }
    }

    fn task_spec(image: &str) -> TaskSpec {
        TaskSpec {
            container: ContainerSpec {
                image: image.to_string(),
                ..Default::default()
            },
            force_update: 0,
        }
    }

    fn running(slot: Slot, image: &str) -> Task {
        let mut task = Task::new("svc-1", slot, task_spec(image));
        task.status.state = TaskState::Running;
        task
    }

    #[test]
    fn empty_service_creates_every_slot_in_order() {
        let result = plan(&spec("image1", 3), &[]);
        let slots: Vec<_> = result.actions.iter().map(|a| a.slot).collect();
        assert_eq!(slots, vec![1, 2, 3]);
        assert!(result.actions.iter().all(|a| a.kind == SlotActionKind::Create));
        assert!(result.surplus.is_empty());
    }

    #[test]
    fn converged_service_plans_nothing() {
        let tasks: Vec<_> = (1..=4).map(|s| running(s, "image1")).collect();
        let target = spec("image1", 4);

        let first = plan(&target, &tasks);
        assert!(first.is_empty());
        // Re-evaluating the same input stays empty.
        assert_eq!(plan(&target, &tasks), first);
    }

    #[test]
    fn changed_image_replaces_every_slot_ascending() {
        let tasks: Vec<_> = [4, 2, 3, 1].into_iter().map(|s| running(s, "image1")).collect();
        let result = plan(&spec("image2", 4), &tasks);

        let slots: Vec<_> = result.actions.iter().map(|a| a.slot).collect();
        assert_eq!(slots, vec![1, 2, 3, 4]);
        for action in &result.actions {
            assert_eq!(action.kind, SlotActionKind::Replace);
            assert_eq!(action.occupants.len(), 1);
            assert_eq!(action.occupants[0].slot, action.slot);
        }
        assert_eq!(result.targeted(), 4);
    }

    #[test]
    fn identity_fields_do_not_make_tasks_dirty() {
        let tasks: Vec<_> = (1..=2).map(|s| running(s, "image1")).collect();
        let mut target = spec("image1", 2);
        target.name = "renamed".to_string();
        target.labels.insert("team".to_string(), "infra".to_string());
        target.update.parallelism = 5;

        assert!(plan(&target, &tasks).is_empty());
    }

    #[test]
    fn force_update_marks_all_slots_dirty() {
        let tasks: Vec<_> = (1..=2).map(|s| running(s, "image1")).collect();
        let mut target = spec("image1", 2);
        target.task.force_update = 1;

        assert_eq!(plan(&target, &tasks).targeted(), 2);
    }

    #[test]
    fn failed_task_with_target_spec_is_replaced() {
        let mut failed = running(1, "image1");
        failed.status.state = TaskState::Failed;
        let result = plan(&spec("image1", 1), &[failed]);

        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].kind, SlotActionKind::Replace);
    }

    #[test]
    fn pending_task_with_target_spec_counts_as_current() {
        let mut pending = running(1, "image1");
        pending.status.state = TaskState::Pending;
        assert!(plan(&spec("image1", 1), &[pending]).is_empty());
    }

    #[test]
    fn retired_tasks_are_ignored() {
        let mut old = running(1, "image1");
        old.desired_state = TaskState::Remove;
        let result = plan(&spec("image1", 1), &[old]);

        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].kind, SlotActionKind::Create);
    }

    #[test]
    fn scale_down_marks_high_slots_surplus() {
        let tasks: Vec<_> = (1..=5).map(|s| running(s, "image1")).collect();
        let result = plan(&spec("image1", 3), &tasks);

        assert!(result.actions.is_empty());
        let surplus: Vec<_> = result.surplus.iter().map(|t| t.slot).collect();
        assert_eq!(surplus, vec![4, 5]);
    }

    #[test]
    fn duplicate_beside_current_task_is_surplus() {
        let keep = running(1, "image1");
        let dup = running(1, "image0");
        let result = plan(&spec("image1", 1), &[dup.clone(), keep]);

        assert!(result.actions.is_empty());
        assert_eq!(result.surplus, vec![dup]);
    }

    #[test]
    fn scale_up_mixes_create_and_replace() {
        let tasks = vec![running(1, "image1")];
        let result = plan(&spec("image2", 3), &tasks);

        let kinds: Vec<_> = result.actions.iter().map(|a| (a.slot, a.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (1, SlotActionKind::Replace),
                (2, SlotActionKind::Create),
                (3, SlotActionKind::Create),
            ]
        );
    }
}
