//! Fence fds and the fence-wait worker thread (C11).
//!
//! Grounded on `original_source/common/display/kmsfencehandler.cpp`:
//! `WaitFence` polls a fence fd with a deadline, `EnsureReadyForNextFrame`
//! blocks the caller on the previous frame's retire fence before reusing its
//! buffers, and `HandleRoutine` is the dedicated worker thread that waits on
//! queued fences so the caller never blocks its own frame loop on one.
//! Every fence here is owned from construction (`rustix::fd::OwnedFd`), which
//! is this crate's fix for `DESIGN.md` Open Question 4 (the original's
//! fence-fd double-close/leak risk).

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::OwnedFd;

use crate::error::FenceError;

/// An owned synchronization fence fd (acquire, release, or retire fence).
#[derive(Debug)]
pub struct Fence(OwnedFd);

impl Fence {
    /// Wraps an already-owned fd as a fence.
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    /// Duplicates the underlying fd, producing an independent fence on the
    /// same underlying sync object. Used when a layer carrying a fence needs
    /// to be cloned (plane assignment routinely clones layers across
    /// candidate plans): a dup'd sync fd is a legitimate second waiter on the
    /// same signal, not a logically distinct fence.
    pub fn try_clone(&self) -> std::io::Result<Fence> {
        rustix::io::dup(&self.0).map(Fence).map_err(Into::into)
    }

    /// Polls the fence fd until it signals readable or `deadline` elapses.
    ///
    /// Mirrors `WaitFence`'s poll-with-deadline loop; unlike the original,
    /// ownership of the fd is never released on any path, so a timeout
    /// leaves the caller free to retry or drop the fence without leaking it.
    pub fn wait(&self, deadline: Duration) -> Result<(), FenceError> {
        let started = Instant::now();
        let mut remaining = deadline;
        loop {
            let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
            let timeout_ms: i32 = remaining.as_millis().try_into().unwrap_or(i32::MAX);
            let ready = poll(&mut fds, timeout_ms).map_err(|e| FenceError::Poll(e.into()))?;
            if ready > 0 && fds[0].revents().contains(PollFlags::IN) {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(FenceError::Timeout(deadline));
            }
            remaining = deadline - elapsed;
        }
    }
}

/// A fence wait request submitted to the worker thread, paired with a
/// one-shot channel the caller can block on (or poll, or drop).
struct Job {
    fence: Fence,
    deadline: Duration,
    reply: mpsc::Sender<Result<(), FenceError>>,
}

/// Dedicated background thread that waits on queued fences so a frame
/// producer never blocks its own loop on one directly.
///
/// Grounded on `KMSFenceEventHandler::HandleRoutine`'s dedicated wait thread.
#[derive(Debug)]
pub struct FenceThread {
    sender: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl FenceThread {
    /// Spawns the worker thread.
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("hwcompose-fence".into())
            .spawn(move || {
                for job in receiver {
                    let result = job.fence.wait(job.deadline);
                    if let Err(e) = &result {
                        tracing::warn!(error = %e, "fence_thread: wait failed");
                    }
                    let _ = job.reply.send(result);
                }
            })
            .expect("failed to spawn fence thread");
        Self { sender, handle: Some(handle) }
    }

    /// Queues `fence` to be waited on with `deadline`, returning a receiver
    /// the caller can block on when it actually needs the result (e.g.
    /// before reusing the buffer the fence guards), the way
    /// `EnsureReadyForNextFrame` defers the actual block until the next
    /// frame needs the buffer back.
    pub fn submit(&self, fence: Fence, deadline: Duration) -> mpsc::Receiver<Result<(), FenceError>> {
        let (reply, rx) = mpsc::channel();
        // The thread owns the receiving end of `self.sender`; a send only
        // fails if that thread panicked, in which case there is nothing
        // meaningful left to wait for.
        let _ = self.sender.send(Job { fence, deadline, reply });
        rx
    }
}

impl Drop for FenceThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(std::mem::replace(&mut self.sender, mpsc::channel().0));
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signalled_fence() -> Fence {
        let (read, write) = rustix::pipe::pipe().unwrap();
        rustix::io::write(&write, b"x").unwrap();
        Fence::new(read)
    }

    fn never_signals_fence() -> (Fence, OwnedFd) {
        let (read, write) = rustix::pipe::pipe().unwrap();
        (Fence::new(read), write)
    }

    #[test]
    fn wait_returns_immediately_when_already_signalled() {
        let fence = signalled_fence();
        assert!(fence.wait(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn wait_times_out_on_a_fence_that_never_signals() {
        let (fence, _keep_write_end_alive) = never_signals_fence();
        let err = fence.wait(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, FenceError::Timeout(_)));
    }

    #[test]
    fn fence_thread_delivers_results_through_the_reply_channel() {
        let thread = FenceThread::spawn();
        let fence = signalled_fence();
        let rx = thread.submit(fence, Duration::from_secs(1));
        assert!(rx.recv().unwrap().is_ok());
    }
}
