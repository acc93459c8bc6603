//! Cooperative single-threaded work-item scheduler.
//!
//! The queue keeps one fast-path slot plus an overflow deque. `push_work`
//! is LIFO (a freshly scheduled child runs before anything already queued);
//! `enqueue_work` is FIFO (external resumptions are serviced in arrival
//! order).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::errors::{ErrorDetails, Fault, WorkflowError};
use crate::ids::InstanceId;
use crate::runtime::instance::ActivityInstanceState;
use crate::runtime::work_item::WorkItem;

/// What the executor wants the run loop to do after a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestedAction {
    Continue,
    /// The work item went asynchronous; stop without reporting idle
    YieldSilently,
    /// The instance was aborted
    Abort,
    /// No handler took the fault
    NotifyUnhandledException { fault: Fault, source: InstanceId },
}

/// Why the run loop returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerOutcome {
    /// Nothing left to run; the instance waits for external input
    Idle,
    /// Stopped because a pause was requested
    Paused,
    /// A work item is waiting on the host
    Pending,
    /// Every root finished
    Completed(ActivityInstanceState),
    Aborted(ErrorDetails),
    UnhandledException { fault: Fault, source: InstanceId },
}

/// Decision taken by the executor when the queue drains.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleDecision {
    /// More work was scheduled
    Resume,
    Stop(SchedulerOutcome),
}

pub trait SchedulerCallbacks {
    fn scheduler(&mut self) -> &mut Scheduler;
    fn execute_work_item(&mut self, item: WorkItem) -> RequestedAction;
    fn on_scheduler_idle(&mut self) -> IdleDecision;
    fn on_scheduler_paused(&mut self) -> SchedulerOutcome;
    fn on_unhandled_exception(&mut self, fault: Fault, source: InstanceId) -> SchedulerOutcome;
    fn on_abort(&mut self) -> SchedulerOutcome;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scheduler {
    first_work_item: Option<WorkItem>,
    work_item_queue: VecDeque<WorkItem>,
    #[serde(skip)]
    is_running: bool,
    #[serde(skip)]
    is_pausing: bool,
    #[serde(skip)]
    dispatching: bool,
}

impl Scheduler {
    /// Schedule ahead of everything already queued.
    pub fn push_work(&mut self, item: WorkItem) {
        if let Some(previous) = self.first_work_item.take() {
            self.work_item_queue.push_front(previous);
        }
        self.first_work_item = Some(item);
    }

    /// Schedule behind everything already queued.
    pub fn enqueue_work(&mut self, item: WorkItem) {
        if self.first_work_item.is_none() && self.work_item_queue.is_empty() {
            self.first_work_item = Some(item);
        } else {
            self.work_item_queue.push_back(item);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<WorkItem> {
        self.first_work_item.take().or_else(|| self.work_item_queue.pop_front())
    }

    pub fn pause(&mut self) {
        if self.is_running {
            self.is_pausing = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn is_pausing(&self) -> bool {
        self.is_pausing
    }

    /// Whether a work item is currently mid-execution.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching
    }

    pub fn is_idle(&self) -> bool {
        self.first_work_item.is_none() && self.work_item_queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        usize::from(self.first_work_item.is_some()) + self.work_item_queue.len()
    }

    /// Pending items in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.first_work_item.iter().chain(self.work_item_queue.iter())
    }

    pub fn clear_all_work_items(&mut self) -> Vec<WorkItem> {
        let mut drained: Vec<WorkItem> = self.first_work_item.take().into_iter().collect();
        drained.extend(self.work_item_queue.drain(..));
        drained
    }

    pub(crate) fn mark_running(&mut self) -> Result<(), WorkflowError> {
        if self.is_running {
            return Err(WorkflowError::invalid_operation("scheduler is already running"));
        }
        self.is_running = true;
        Ok(())
    }

    fn mark_stopped(&mut self) {
        self.is_running = false;
        self.is_pausing = false;
    }
}

/// Dispatch work items until the executor stops the loop.
pub(crate) fn run<C: SchedulerCallbacks + ?Sized>(callbacks: &mut C) -> Result<SchedulerOutcome, WorkflowError> {
    callbacks.scheduler().mark_running()?;
    let outcome = loop {
        if callbacks.scheduler().is_pausing() {
            callbacks.scheduler().mark_stopped();
            break callbacks.on_scheduler_paused();
        }
        let Some(item) = callbacks.scheduler().pop() else {
            match callbacks.on_scheduler_idle() {
                IdleDecision::Resume => continue,
                IdleDecision::Stop(outcome) => break outcome,
            }
        };

        let scheduler = callbacks.scheduler();
        debug_assert!(!scheduler.dispatching, "work items never overlap");
        scheduler.dispatching = true;
        let action = callbacks.execute_work_item(item);
        callbacks.scheduler().dispatching = false;

        match action {
            RequestedAction::Continue => {}
            RequestedAction::YieldSilently => break SchedulerOutcome::Pending,
            RequestedAction::Abort => break callbacks.on_abort(),
            RequestedAction::NotifyUnhandledException { fault, source } => {
                break callbacks.on_unhandled_exception(fault, source);
            }
        }
    };
    callbacks.scheduler().mark_stopped();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::work_item::WorkItemKind;

    fn item(n: u64) -> WorkItem {
        WorkItem::empty(InstanceId(n))
    }

    fn order(s: &mut Scheduler) -> Vec<u64> {
        std::iter::from_fn(|| s.pop()).map(|w| w.instance.0).collect()
    }

    #[test]
    fn push_is_lifo_and_enqueue_is_fifo() {
        let mut s = Scheduler::default();
        s.enqueue_work(item(1));
        s.enqueue_work(item(2));
        s.push_work(item(3));
        s.push_work(item(4));
        s.enqueue_work(item(5));
        assert_eq!(order(&mut s), vec![4, 3, 1, 2, 5]);
    }

    #[test]
    fn enqueue_after_pop_goes_behind_remaining_items() {
        let mut s = Scheduler::default();
        s.enqueue_work(item(1));
        s.enqueue_work(item(2));
        assert_eq!(s.pop().unwrap().instance, InstanceId(1));
        s.enqueue_work(item(3));
        assert_eq!(order(&mut s), vec![2, 3]);
    }

    struct Recorder {
        scheduler: Scheduler,
        executed: Vec<u64>,
        idle_calls: usize,
        overlap: bool,
    }

    impl SchedulerCallbacks for Recorder {
        fn scheduler(&mut self) -> &mut Scheduler {
            &mut self.scheduler
        }

        fn execute_work_item(&mut self, item: WorkItem) -> RequestedAction {
            self.overlap |= !self.scheduler.is_dispatching();
            self.executed.push(item.instance.0);
            match item.instance.0 {
                1 => {
                    self.scheduler.push_work(item_with(10));
                    RequestedAction::Continue
                }
                99 => RequestedAction::YieldSilently,
                _ => RequestedAction::Continue,
            }
        }

        fn on_scheduler_idle(&mut self) -> IdleDecision {
            self.idle_calls += 1;
            IdleDecision::Stop(SchedulerOutcome::Idle)
        }

        fn on_scheduler_paused(&mut self) -> SchedulerOutcome {
            SchedulerOutcome::Paused
        }

        fn on_unhandled_exception(&mut self, fault: Fault, source: InstanceId) -> SchedulerOutcome {
            SchedulerOutcome::UnhandledException { fault, source }
        }

        fn on_abort(&mut self) -> SchedulerOutcome {
            SchedulerOutcome::Aborted(ErrorDetails::infrastructure("test", "abort"))
        }
    }

    fn item_with(n: u64) -> WorkItem {
        WorkItem::new(InstanceId(n), WorkItemKind::ExecuteActivity)
    }

    #[test]
    fn run_loop_dispatches_until_idle() {
        let mut r = Recorder {
            scheduler: Scheduler::default(),
            executed: vec![],
            idle_calls: 0,
            overlap: false,
        };
        r.scheduler.enqueue_work(item(1));
        r.scheduler.enqueue_work(item(2));
        assert_eq!(run(&mut r).unwrap(), SchedulerOutcome::Idle);
        assert_eq!(r.executed, vec![1, 10, 2]);
        assert_eq!(r.idle_calls, 1);
        assert!(!r.overlap, "dispatch flag must be set while an item executes");
        assert!(!r.scheduler.is_running());
    }

    #[test]
    fn yield_stops_without_idle_notification() {
        let mut r = Recorder {
            scheduler: Scheduler::default(),
            executed: vec![],
            idle_calls: 0,
            overlap: false,
        };
        r.scheduler.enqueue_work(item(99));
        r.scheduler.enqueue_work(item(2));
        assert_eq!(run(&mut r).unwrap(), SchedulerOutcome::Pending);
        assert_eq!(r.executed, vec![99]);
        assert_eq!(r.idle_calls, 0);
        assert_eq!(r.scheduler.pending_count(), 1);
    }

    #[test]
    fn clear_drains_everything() {
        let mut s = Scheduler::default();
        s.push_work(item(1));
        s.enqueue_work(item(2));
        assert_eq!(s.clear_all_work_items().len(), 2);
        assert!(s.is_idle());
    }
}
