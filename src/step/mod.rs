// step/mod.rs — kernels bound to work states.
//
// A work step wraps one kernel entry point on a worker. `SimpleStep` is the
// generic building block: it loads source by resource name, builds it in
// two phases (program, then kernel) and enqueues the kernel with bound
// arguments. Concrete steps such as `PreFastStep` compose a `SimpleStep`
// with the states they read and write.

mod prefast;
mod simple;

pub use prefast::PreFastStep;
pub use simple::{SimpleStep, StepState};

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::worker::Worker;

pub trait WorkStep<'w> {
    fn worker(&self) -> &'w Worker;

    /// Enqueue the step. Returns before the kernel has run.
    fn run(&self) -> Result<()>;

    /// Mean wall time of `repeat` runs, measured between two `finish`
    /// calls so queued work before and after is excluded.
    fn measure(&self, repeat: u32) -> Result<Duration> {
        if repeat == 0 {
            return Err(Error::invalid("measure needs at least one repetition"));
        }
        let worker = self.worker();
        worker.finish()?;
        let start = Instant::now();
        for _ in 0..repeat {
            self.run()?;
        }
        worker.finish()?;
        Ok(start.elapsed() / repeat)
    }
}
