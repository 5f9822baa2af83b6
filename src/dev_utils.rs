// src/dev_utils.rs

use std::time::Instant;

/// Times a reload step. The duration is logged at debug level on drop, so
/// early returns and error paths are measured too.
#[derive(Debug)]
pub struct BlockTimer {
    step: String,
    started: Instant,
}

impl BlockTimer {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

impl Drop for BlockTimer {
    fn drop(&mut self) {
        log::debug!("{} took {} ms", self.step, self.elapsed_ms());
    }
}
