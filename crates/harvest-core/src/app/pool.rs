//! Bounded pool policy, independent of how work is launched.
//!
//! State is `(running, cursor, limit)`. The caller reports "slot freed" events and
//! launches whatever indices the scheduler hands back.

/// Pure scheduler for at most `limit` concurrent units over `total` items
/// (`None` = unbounded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolScheduler {
    limit: usize,
    total: Option<usize>,
    cursor: usize,
    running: usize,
}

impl PoolScheduler {
    /// A zero limit is raised to one.
    pub fn new(limit: usize, total: Option<usize>) -> Self {
        Self {
            limit: limit.max(1),
            total,
            cursor: 0,
            running: 0,
        }
    }

    /// Fill free slots. Returns the item indices to launch now.
    pub fn start(&mut self) -> Vec<usize> {
        let mut launch = Vec::new();
        while self.running < self.limit && !self.exhausted() {
            launch.push(self.cursor);
            self.cursor += 1;
            self.running += 1;
        }
        launch
    }

    /// One unit finished. Returns what to launch in its place.
    pub fn slot_freed(&mut self) -> Vec<usize> {
        self.running = self.running.saturating_sub(1);
        self.start()
    }

    /// Stop handing out new items; running ones still drain.
    pub fn close(&mut self) {
        self.total = Some(self.cursor);
    }

    pub fn is_finished(&self) -> bool {
        self.running == 0 && self.exhausted()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn launched(&self) -> usize {
        self.cursor
    }

    fn exhausted(&self) -> bool {
        self.total.is_some_and(|total| self.cursor >= total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(5, 12, 5)]
    #[case(5, 3, 3)]
    #[case(1, 4, 1)]
    #[case(4, 0, 0)]
    fn start_fills_min_of_limit_and_work(
        #[case] limit: usize,
        #[case] total: usize,
        #[case] expected: usize,
    ) {
        let mut pool = PoolScheduler::new(limit, Some(total));
        assert_eq!(pool.start().len(), expected);
        assert_eq!(pool.running(), expected);
        assert_eq!(pool.is_finished(), total == 0);
    }

    #[test]
    fn each_exit_launches_the_next_item_in_order() {
        let mut pool = PoolScheduler::new(2, Some(5));
        assert_eq!(pool.start(), vec![0, 1]);
        assert_eq!(pool.slot_freed(), vec![2]);
        assert_eq!(pool.slot_freed(), vec![3]);
        assert_eq!(pool.slot_freed(), vec![4]);
        assert_eq!(pool.slot_freed(), Vec::<usize>::new());
        assert!(!pool.is_finished());
        assert_eq!(pool.slot_freed(), Vec::<usize>::new());
        assert!(pool.is_finished());
        assert_eq!(pool.launched(), 5);
    }

    #[test]
    fn every_item_is_launched_exactly_once() {
        let mut pool = PoolScheduler::new(3, Some(20));
        let mut launched = pool.start();
        let mut peak = pool.running();
        while !pool.is_finished() {
            launched.extend(pool.slot_freed());
            peak = peak.max(pool.running());
        }
        assert_eq!(launched, (0..20).collect::<Vec<_>>());
        assert!(peak <= 3);
    }

    #[test]
    fn unbounded_pool_runs_until_closed() {
        let mut pool = PoolScheduler::new(2, None);
        assert_eq!(pool.start(), vec![0, 1]);
        assert_eq!(pool.slot_freed(), vec![2]);
        pool.close();
        assert!(pool.slot_freed().is_empty());
        assert!(pool.slot_freed().is_empty());
        assert!(pool.is_finished());
    }

    #[test]
    fn zero_limit_still_makes_progress() {
        let mut pool = PoolScheduler::new(0, Some(2));
        assert_eq!(pool.start(), vec![0]);
    }
}
