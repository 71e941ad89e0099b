//! Progress estimation and reporting cadence

/// Highest progress reported before the job is actually completed
pub const MAX_RUNNING_PROGRESS: i32 = 95;

/// Estimate progress from lines seen so far.
///
/// Total lines are extrapolated from the average line size; the result is
/// capped at `MAX_RUNNING_PROGRESS` and never drops below `previous`.
pub fn estimate_progress(file_size: i64, bytes_processed: i64, lines_seen: i64, previous: i32) -> i32 {
    if file_size <= 0 || bytes_processed <= 0 || lines_seen <= 0 {
        return previous;
    }
    let avg_line_size = (bytes_processed as f64 / lines_seen as f64).max(1.0);
    let estimated_total = (file_size as f64 / avg_line_size).ceil().max(1.0);
    let estimate = ((lines_seen as f64 * 100.0) / estimated_total).floor() as i32;

    estimate.clamp(0, MAX_RUNNING_PROGRESS).max(previous)
}

/// What to do after a dispatched line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    None,
    /// Poll cancellation and persist progress
    Progress,
    /// Flush buffers and persist a checkpoint (implies `Progress`)
    Checkpoint,
}

/// Line-count based cadence for progress writes and checkpoints
#[derive(Debug, Clone)]
pub struct Cadence {
    progress_every: u64,
    checkpoint_every: u64,
}

impl Cadence {
    pub fn new(progress_every: u64, checkpoint_every: u64) -> Self {
        Self {
            progress_every: progress_every.max(1),
            checkpoint_every: checkpoint_every.max(1),
        }
    }

    /// Tick for the `lines`-th line of the current invocation
    pub fn tick(&self, lines: u64) -> Tick {
        if lines == 0 {
            Tick::None
        } else if lines % self.checkpoint_every == 0 {
            Tick::Checkpoint
        } else if lines % self.progress_every == 0 {
            Tick::Progress
        } else {
            Tick::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tracks_bytes_share() {
        assert_eq!(estimate_progress(1000, 250, 10, 0), 25);
        assert_eq!(estimate_progress(1000, 500, 10, 0), 50);
    }

    #[test]
    fn test_estimate_is_capped_below_completion() {
        assert_eq!(estimate_progress(1000, 1000, 10, 0), MAX_RUNNING_PROGRESS);
        assert_eq!(estimate_progress(1000, 5000, 10, 0), MAX_RUNNING_PROGRESS);
    }

    #[test]
    fn test_estimate_never_regresses() {
        assert_eq!(estimate_progress(1000, 100, 10, 40), 40);
        assert_eq!(estimate_progress(0, 100, 10, 12), 12);
        assert_eq!(estimate_progress(1000, 0, 0, 7), 7);
    }

    #[test]
    fn test_cadence_prefers_checkpoint() {
        let cadence = Cadence::new(5, 20);
        assert_eq!(cadence.tick(0), Tick::None);
        assert_eq!(cadence.tick(3), Tick::None);
        assert_eq!(cadence.tick(5), Tick::Progress);
        assert_eq!(cadence.tick(20), Tick::Checkpoint);
        assert_eq!(cadence.tick(40), Tick::Checkpoint);
    }
}
