//! Per-storage serialization of destructive operations.
//!
//! Moving, renaming or deleting a torrent's files must not race outstanding
//! reads and writes for the same storage. Raising the fence makes newly
//! submitted jobs queue up behind it; the fence job itself runs once every
//! previously submitted job has completed, and completing it releases the
//! queued jobs back into the dispatcher.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::job::{Job, IN_PROGRESS};

/// What the dispatcher should do with the jobs involved in raising a fence.
pub(crate) enum RaiseOutcome {
    /// The storage was idle: schedule the fence job itself, at the front of
    /// the queue. The synthetic flush job is not needed.
    PostFence(Job),
    /// Jobs are still in flight: schedule the returned flush job so dirty
    /// blocks drain, and park the fence job until the storage goes idle.
    PostFlush(Job),
    /// A fence was already up; the new fence job is parked behind it and
    /// nothing is scheduled now.
    Blocked,
}

/// Jobs released by a completion, to be fed back into the dispatcher.
pub(crate) enum Released {
    None,
    /// The storage went idle with a fence waiting: schedule it at the front
    /// of the queue, ahead of normal jobs.
    Fence(Box<Job>),
    /// The last fence came down: append the previously blocked jobs in their
    /// submission order.
    Unblocked(Vec<Job>),
}

#[derive(Default)]
struct FenceState {
    /// Jobs for this storage that are queued or running. Blocked and parked
    /// jobs are not counted.
    outstanding: usize,
    fence_up: bool,
    /// Fence jobs waiting their turn. Front is next to run.
    pending_fences: VecDeque<Job>,
    /// Normal jobs submitted while the fence was up.
    blocked: VecDeque<Job>,
}

pub(crate) struct JobFence {
    state: Mutex<FenceState>,
}

impl JobFence {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FenceState::default()),
        }
    }

    /// Raises the fence for `job`. `flush` is the synthetic flush-storage
    /// companion, used only when in-flight jobs must drain first.
    pub(crate) fn raise(&self, mut job: Job, mut flush: Job) -> RaiseOutcome {
        let mut state = self.state.lock();

        if state.fence_up {
            state.pending_fences.push_back(job);
            return RaiseOutcome::Blocked;
        }
        state.fence_up = true;

        if state.outstanding == 0 {
            state.outstanding = 1;
            job.flags |= IN_PROGRESS;
            RaiseOutcome::PostFence(job)
        } else {
            state.pending_fences.push_back(job);
            state.outstanding += 1;
            flush.flags |= IN_PROGRESS;
            RaiseOutcome::PostFlush(flush)
        }
    }

    /// Called for every normal job submission. Returns the job back if it may
    /// be queued now, or keeps it blocked behind the fence.
    pub(crate) fn is_blocked(
        &self,
        mut job: Job,
        ignore_fence: bool,
    ) -> Result<Job, ()> {
        let mut state = self.state.lock();
        if state.fence_up && !ignore_fence {
            state.blocked.push_back(job);
            return Err(());
        }
        state.outstanding += 1;
        job.flags |= IN_PROGRESS;
        Ok(job)
    }

    /// Accounts a completed job and hands back whatever it unblocks.
    pub(crate) fn job_complete(&self, was_fence: bool) -> Released {
        let mut state = self.state.lock();
        debug_assert!(state.outstanding > 0);
        state.outstanding -= 1;

        if was_fence {
            debug_assert!(state.fence_up);
            debug_assert_eq!(state.outstanding, 0);
            if let Some(mut next) = state.pending_fences.pop_front() {
                // another fence was stacked behind this one, it runs before
                // any blocked normal job
                state.outstanding = 1;
                next.flags |= IN_PROGRESS;
                return Released::Fence(Box::new(next));
            }
            state.fence_up = false;
            let mut released: Vec<Job> = state.blocked.drain(..).collect();
            state.outstanding += released.len();
            for job in &mut released {
                job.flags |= IN_PROGRESS;
            }
            if released.is_empty() {
                return Released::None;
            }
            return Released::Unblocked(released);
        }

        if state.fence_up && state.outstanding == 0 {
            // the flush and every straggler have drained, the parked fence
            // can run now
            if let Some(mut next) = state.pending_fences.pop_front() {
                state.outstanding = 1;
                next.flags |= IN_PROGRESS;
                return Released::Fence(Box::new(next));
            }
        }
        Released::None
    }

    pub(crate) fn has_fence(&self) -> bool {
        self.state.lock().fence_up
    }

    pub(crate) fn num_outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub(crate) fn num_blocked(&self) -> usize {
        self.state.lock().blocked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::job::Action;

    fn job(action: Action) -> Job {
        Job::new(action, None)
    }

    #[test]
    fn test_fence_on_idle_storage_posts_immediately() {
        let fence = JobFence::new();
        match fence.raise(job(Action::DeleteFiles), job(Action::FlushStorage)) {
            RaiseOutcome::PostFence(j) => assert!(j.in_progress()),
            _ => panic!("expected PostFence"),
        }
        assert!(fence.has_fence());
        assert_eq!(fence.num_outstanding(), 1);

        // fence completes on an otherwise idle storage, nothing queued
        assert!(matches!(fence.job_complete(true), Released::None));
        assert!(!fence.has_fence());
        assert_eq!(fence.num_outstanding(), 0);
    }

    #[test]
    fn test_fence_waits_for_outstanding_jobs() {
        let fence = JobFence::new();
        let read = fence.is_blocked(job(Action::Read), false).unwrap();
        assert!(read.in_progress());

        match fence.raise(job(Action::MoveStorage { target: "x".into() }), job(Action::FlushStorage)) {
            RaiseOutcome::PostFlush(f) => {
                assert_eq!(f.action.name(), "flush_storage")
            }
            _ => panic!("expected PostFlush"),
        }
        // outstanding: the read and the flush
        assert_eq!(fence.num_outstanding(), 2);

        // a job arriving now is held back
        assert!(fence.is_blocked(job(Action::Read), false).is_err());
        assert_eq!(fence.num_blocked(), 1);
        // unless the caller asked to bypass the fence
        assert!(fence.is_blocked(job(Action::Read), true).is_ok());

        // the bypassing read, the original read and the flush complete; the
        // parked fence is released by the last of them
        assert!(matches!(fence.job_complete(false), Released::None));
        assert!(matches!(fence.job_complete(false), Released::None));
        match fence.job_complete(false) {
            Released::Fence(f) => assert_eq!(f.action.name(), "move_storage"),
            _ => panic!("expected the parked fence"),
        }

        // completing the fence releases the blocked read
        match fence.job_complete(true) {
            Released::Unblocked(jobs) => assert_eq!(jobs.len(), 1),
            _ => panic!("expected unblocked jobs"),
        }
        assert!(!fence.has_fence());
        assert_eq!(fence.num_outstanding(), 1);
    }

    #[test]
    fn test_stacked_fences_run_in_order() {
        let fence = JobFence::new();
        match fence.raise(job(Action::ReleaseFiles), job(Action::FlushStorage)) {
            RaiseOutcome::PostFence(_) => {}
            _ => panic!("expected PostFence"),
        }
        // second fence while the first is up
        assert!(matches!(
            fence.raise(job(Action::DeleteFiles), job(Action::FlushStorage)),
            RaiseOutcome::Blocked
        ));
        assert!(fence.is_blocked(job(Action::Read), false).is_err());

        // first fence completes: the stacked fence runs before the blocked read
        match fence.job_complete(true) {
            Released::Fence(f) => assert_eq!(f.action.name(), "delete_files"),
            _ => panic!("expected stacked fence"),
        }
        match fence.job_complete(true) {
            Released::Unblocked(jobs) => {
                assert_eq!(jobs.len(), 1);
                assert_eq!(jobs[0].action.name(), "read");
            }
            _ => panic!("expected unblocked jobs"),
        }
    }
}
