//! Replay protection using a sliding window.

/// Size of the sliding window in packet ids.
pub const REPLAY_WINDOW_SIZE: u32 = 64;

/// Tracks received packet ids and rejects duplicates or ids that are too old.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    bitmap: u64,
    max_id: u32,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id has not been seen and is inside the window.
    pub fn check(&self, id: u32) -> bool {
        if id > self.max_id {
            return true;
        }
        let delta = self.max_id - id;
        if delta >= REPLAY_WINDOW_SIZE {
            return false;
        }
        self.bitmap & (1 << delta) == 0
    }

    /// Records an id as seen.
    pub fn update(&mut self, id: u32) {
        if id > self.max_id {
            let shift = id - self.max_id;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.max_id = id;
            self.bitmap |= 1;
        } else {
            let delta = self.max_id - id;
            if delta < REPLAY_WINDOW_SIZE {
                self.bitmap |= 1 << delta;
            }
        }
    }

    /// Checks and records in one step; false on replay.
    pub fn check_and_update(&mut self, id: u32) -> bool {
        if !self.check(id) {
            return false;
        }
        self.update(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_and_duplicate() {
        let mut window = ReplayWindow::new();
        for id in 1..100 {
            assert!(window.check_and_update(id), "id {} should be accepted", id);
        }
        assert!(!window.check_and_update(99));
    }

    #[test]
    fn test_out_of_order_inside_window() {
        let mut window = ReplayWindow::new();
        for id in [10u32, 5, 8, 1] {
            assert!(window.check_and_update(id));
        }
        for id in [10u32, 5, 8, 1] {
            assert!(!window.check_and_update(id));
        }
    }

    #[test]
    fn test_too_old() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(1000));
        assert!(!window.check_and_update(1000 - REPLAY_WINDOW_SIZE));
        assert!(window.check_and_update(1000 - REPLAY_WINDOW_SIZE + 1));
    }
}
