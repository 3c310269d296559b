//! Bounded set of spawned tasks.
//!
//! A [`JoinSet`] with a cap on how many tasks run at once. Callers wait for
//! a free slot before spawning, which lets them look at the outputs that
//! freed the slot and decide whether to spawn at all.

use std::future::Future;

use tokio::task::JoinSet;

pub struct ParallelTaskSet<T> {
    max_parallelism: usize,
    set: JoinSet<T>,
}

impl<T: Send + 'static> ParallelTaskSet<T> {
    /// A set running at most `max_parallelism` tasks (at least one).
    pub fn new_with_parallelism(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
            set: JoinSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait until a task may be spawned, returning outputs of every task
    /// that has finished so far, even when a slot was already free.
    pub async fn wait_for_slot(&mut self) -> Vec<T> {
        let mut finished = Vec::new();
        while let Some(output) = self.try_join_next() {
            finished.push(output);
        }
        while self.set.len() >= self.max_parallelism {
            match self.join_next().await {
                Some(output) => finished.push(output),
                None => break,
            }
        }
        finished
    }

    /// Spawn a task. Call [`wait_for_slot`](Self::wait_for_slot) first to
    /// stay within the parallelism cap.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        debug_assert!(self.set.len() < self.max_parallelism);
        self.set.spawn(future);
    }

    /// Wait for the next task to complete and return its output.
    ///
    /// A panic inside a task is resumed on the caller.
    pub async fn join_next(&mut self) -> Option<T> {
        let joined = self.set.join_next().await?;
        Some(unwrap_joined(joined))
    }

    /// Output of an already finished task, without waiting.
    pub fn try_join_next(&mut self) -> Option<T> {
        let joined = self.set.try_join_next()?;
        Some(unwrap_joined(joined))
    }

    /// Wait for every remaining task, in completion order.
    pub async fn join_all(mut self) -> Vec<T> {
        let mut outputs = Vec::with_capacity(self.set.len());
        while let Some(output) = self.join_next().await {
            outputs.push(output);
        }
        outputs
    }
}

fn unwrap_joined<T>(joined: Result<T, tokio::task::JoinError>) -> T {
    match joined {
        Ok(output) => output,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => unreachable!("tasks are never aborted: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_parallelism() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut set = ParallelTaskSet::new_with_parallelism(3);
        let mut done = Vec::new();

        for i in 0..10 {
            done.extend(set.wait_for_slot().await);
            let running = running.clone();
            let peak = peak.clone();
            set.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                i
            });
        }
        done.extend(set.join_all().await);

        done.sort();
        assert_eq!(done, (0..10).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn finished_tasks_are_drained_before_the_set_fills() {
        let mut set = ParallelTaskSet::new_with_parallelism(3);
        set.spawn(async { 1 });
        set.spawn(async { 2 });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut done = set.wait_for_slot().await;
        done.sort();
        assert_eq!(done, vec![1, 2]);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn zero_parallelism_still_runs() {
        let mut set = ParallelTaskSet::new_with_parallelism(0);
        assert!(set.wait_for_slot().await.is_empty());
        set.spawn(async { 7 });
        assert_eq!(set.join_all().await, vec![7]);
    }
}
