// step/prefast.rs — FAST pre-test over a grayscale image.
//
// Reads an 8-bit `ImageState` and writes candidate corner positions into a
// `ListState<i32>` of (x, y) pairs. Each run resets the list's counter
// first; after the run the counter holds the number of candidates found,
// which may exceed the list's capacity. Only `valid_count` pairs are
// stored.

use log::warn;

use super::{SimpleStep, WorkStep};
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::platform::{KernelArg, NdRange};
use crate::source::SourceLoader;
use crate::state::{ImageState, ListState, WorkState};
use crate::worker::Worker;

pub struct PreFastStep<'s, 'w> {
    step: SimpleStep<'w>,
    image: &'s ImageState<'w>,
    points: &'s ListState<'w, i32>,
    threshold: i32,
}

impl<'s, 'w> PreFastStep<'s, 'w> {
    pub const RESOURCE: &'static str = "pre_fast_gray.wgsl";
    pub const ENTRY: &'static str = "pre_fast_gray";
    /// Pixels skipped at every image edge.
    pub const BORDER: u32 = 8;

    const ARG_THRESHOLD: usize = 3;

    pub fn new(
        image: &'s ImageState<'w>,
        points: &'s ListState<'w, i32>,
        threshold: i32,
        loader: &dyn SourceLoader,
    ) -> Result<Self> {
        let worker = image.worker();
        if !std::ptr::eq(worker, points.worker()) {
            return Err(Error::invalid("image and point list belong to different workers"));
        }
        if points.each() != 2 {
            return Err(Error::shape("2 values per point", format!("{} per point", points.each())));
        }
        if image.format() != PixelFormat::GRAY8 {
            return Err(Error::shape(PixelFormat::GRAY8, image.format()));
        }
        let margin = 2 * Self::BORDER;
        if image.nx() <= margin || image.ny() <= margin {
            return Err(Error::invalid(format!(
                "image {}×{} has no interior inside a {} pixel border",
                image.nx(),
                image.ny(),
                Self::BORDER
            )));
        }

        let mut step = SimpleStep::build(worker, Self::RESOURCE, Self::ENTRY, loader)?;
        if let Err(e) = step.build_kernel() {
            if let Err(re) = step.close() {
                warn!("releasing {} after a failed kernel build: {re}", Self::ENTRY);
            }
            return Err(e);
        }
        step.set_arg(0, KernelArg::Mem(image.mem()));
        step.set_arg(1, KernelArg::Mem(points.mem()));
        step.set_arg(2, KernelArg::Mem(points.counter().mem()));
        step.set_arg(Self::ARG_THRESHOLD, KernelArg::Int(threshold));
        step.set_arg(4, KernelArg::Uint(points.size()));
        step.set_arg(5, KernelArg::Uint(Self::BORDER));
        step.set_range(NdRange::d2(
            (image.nx() - margin) as usize,
            (image.ny() - margin) as usize,
        ));

        Ok(PreFastStep { step, image, points, threshold })
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: i32) {
        self.threshold = threshold;
        self.step.set_arg(Self::ARG_THRESHOLD, KernelArg::Int(threshold));
    }

    pub fn image(&self) -> &'s ImageState<'w> {
        self.image
    }

    pub fn points(&self) -> &'s ListState<'w, i32> {
        self.points
    }

    /// Stored candidates as (x, y). Blocking.
    pub fn corners(&self) -> Result<Vec<(i32, i32)>> {
        let flat = self.points.get_items()?;
        Ok(flat.chunks_exact(2).map(|p| (p[0], p[1])).collect())
    }

    pub fn close(self) -> Result<()> {
        self.step.close()
    }
}

impl<'s, 'w> WorkStep<'w> for PreFastStep<'s, 'w> {
    fn worker(&self) -> &'w Worker {
        self.step.worker()
    }

    fn run(&self) -> Result<()> {
        self.points.set_count(0)?;
        self.step.run()
    }
}

impl crate::Closable for PreFastStep<'_, '_> {
    fn close(self) -> Result<()> {
        PreFastStep::close(self)
    }
}
