// step/simple.rs — a single kernel entry point with bound arguments.
//
// STATE MACHINE
//
//   Uncompiled ──compile──▶ ProgramBuilt ──build_kernel──▶ KernelBuilt
//
// `compile` loads the source and creates the program for the worker's
// device. `build_kernel` builds the program with the step's options and
// materialises the entry point; if that fails the step stays in
// ProgramBuilt and can be closed normally. Only KernelBuilt can `run`.
//
// Release order is kernel, then program.

use std::fmt;

use log::{debug, warn};

use super::WorkStep;
use crate::error::{Error, Result};
use crate::platform::{KernelArg, KernelId, NdRange, ProgramId};
use crate::source::SourceLoader;
use crate::worker::{Tracked, Worker};

/// Public view of a step's lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Uncompiled,
    ProgramBuilt,
    KernelBuilt,
}

impl StepState {
    fn describe(self) -> &'static str {
        match self {
            StepState::Uncompiled => "the step is uncompiled",
            StepState::ProgramBuilt => "only the program is built",
            StepState::KernelBuilt => "the kernel is built",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Stage {
    Uncompiled,
    ProgramBuilt(Tracked<ProgramId>),
    KernelBuilt(Tracked<ProgramId>, Tracked<KernelId>),
}

pub struct SimpleStep<'w> {
    worker: &'w Worker,
    resource: String,
    kernel: String,
    options: String,
    stage: Stage,
    args: Vec<Option<KernelArg>>,
    range: Option<NdRange>,
}

impl<'w> SimpleStep<'w> {
    /// An uncompiled step for entry point `kernel` in source `resource`.
    pub fn new(worker: &'w Worker, resource: impl Into<String>, kernel: impl Into<String>) -> Self {
        SimpleStep {
            worker,
            resource: resource.into(),
            kernel: kernel.into(),
            options: String::new(),
            stage: Stage::Uncompiled,
            args: Vec::new(),
            range: None,
        }
    }

    /// `new` followed by `compile`.
    pub fn build(
        worker: &'w Worker,
        resource: impl Into<String>,
        kernel: impl Into<String>,
        loader: &dyn SourceLoader,
    ) -> Result<Self> {
        let mut step = Self::new(worker, resource, kernel);
        step.compile(loader)?;
        Ok(step)
    }

    /// Build options passed to the platform when the kernel is built.
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel
    }

    pub fn state(&self) -> StepState {
        match self.stage {
            Stage::Uncompiled => StepState::Uncompiled,
            Stage::ProgramBuilt(_) => StepState::ProgramBuilt,
            Stage::KernelBuilt(..) => StepState::KernelBuilt,
        }
    }

    pub fn program(&self) -> Option<ProgramId> {
        match self.stage {
            Stage::Uncompiled => None,
            Stage::ProgramBuilt(p) | Stage::KernelBuilt(p, _) => Some(p.handle),
        }
    }

    pub fn kernel(&self) -> Option<KernelId> {
        match self.stage {
            Stage::KernelBuilt(_, k) => Some(k.handle),
            _ => None,
        }
    }

    fn wrong_state(&self, op: &'static str) -> Error {
        Error::InvalidState { op, state: self.state().describe() }
    }

    /// Load the source and create the program.
    pub fn compile(&mut self, loader: &dyn SourceLoader) -> Result<()> {
        if !matches!(self.stage, Stage::Uncompiled) {
            return Err(self.wrong_state("compile"));
        }
        let source = loader.load(&self.resource)?;
        let program = self.worker.create_program(&source)?;
        debug!("{}: compiled `{}`", self.worker.name(), self.resource);
        self.stage = Stage::ProgramBuilt(program);
        Ok(())
    }

    /// Build the program with the step's options and create the kernel.
    pub fn build_kernel(&mut self) -> Result<()> {
        let Stage::ProgramBuilt(program) = self.stage else {
            return Err(self.wrong_state("build_kernel"));
        };
        self.worker.build_program(program.handle, &self.options)?;
        let kernel = self.worker.create_kernel(program.handle, &self.kernel)?;
        debug!("{}: built kernel `{}`", self.worker.name(), self.kernel);
        self.stage = Stage::KernelBuilt(program, kernel);
        Ok(())
    }

    /// Bind argument `index`. Arguments may be bound in any order; all of
    /// them must be bound before `run`.
    pub fn set_arg(&mut self, index: usize, arg: KernelArg) {
        if self.args.len() <= index {
            self.args.resize(index + 1, None);
        }
        self.args[index] = Some(arg);
    }

    pub fn set_range(&mut self, range: NdRange) {
        self.range = Some(range);
    }

    pub fn range(&self) -> Option<NdRange> {
        self.range
    }

    /// Release the kernel, then the program.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Uncompiled) {
            Stage::Uncompiled => Ok(()),
            Stage::ProgramBuilt(program) => self.worker.release_program(program),
            Stage::KernelBuilt(program, kernel) => {
                let k = self.worker.release_kernel(kernel);
                let p = self.worker.release_program(program);
                k.and(p)
            }
        }
    }
}

impl<'w> WorkStep<'w> for SimpleStep<'w> {
    fn worker(&self) -> &'w Worker {
        self.worker
    }

    fn run(&self) -> Result<()> {
        let Stage::KernelBuilt(_, kernel) = self.stage else {
            return Err(self.wrong_state("run"));
        };
        let args = self
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                a.ok_or_else(|| {
                    Error::invalid(format!("argument {i} of `{}` is not bound", self.kernel))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let range = self
            .range
            .ok_or_else(|| Error::invalid(format!("`{}` has no problem size", self.kernel)))?;
        self.worker.enqueue_kernel(kernel.handle, &args, range)
    }
}

impl crate::Closable for SimpleStep<'_> {
    fn close(self) -> Result<()> {
        SimpleStep::close(self)
    }
}

impl Drop for SimpleStep<'_> {
    fn drop(&mut self) {
        if !matches!(self.stage, Stage::Uncompiled) {
            warn!("step `{}` dropped without close, releasing", self.kernel);
            if let Err(e) = self.release() {
                warn!("step `{}` release on drop failed: {e}", self.kernel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::host::{HostPlatform, Invocation};
    use crate::platform::Platform;
    use crate::source::EmbeddedSources;
    use crate::state::CountState;
    use std::sync::Arc;

    const SRC: &str = "@compute @workgroup_size(1) fn bump() {}";

    fn worker() -> Worker {
        let p = Arc::new(
            HostPlatform::builder()
                .kernel("bump", |inv: &mut Invocation<'_>| {
                    let by = inv.int(1)?;
                    inv.fetch_add_i32(0, 0, by)?;
                    Ok(())
                })
                .build(),
        );
        let d = p.devices().unwrap().remove(0);
        Worker::new(p, d).unwrap()
    }

    fn loader() -> EmbeddedSources {
        EmbeddedSources::new().with("bump.wgsl", SRC)
    }

    #[test]
    fn test_state_machine() {
        let w = worker();
        let mut step = SimpleStep::new(&w, "bump.wgsl", "bump");
        assert_eq!(step.state(), StepState::Uncompiled);
        assert!(matches!(step.build_kernel(), Err(Error::InvalidState { .. })));
        assert!(matches!(step.run(), Err(Error::InvalidState { op: "run", .. })));

        step.compile(&loader()).unwrap();
        assert_eq!(step.state(), StepState::ProgramBuilt);
        assert!(matches!(step.compile(&loader()), Err(Error::InvalidState { .. })));

        step.build_kernel().unwrap();
        assert_eq!(step.state(), StepState::KernelBuilt);
        assert!(step.kernel().is_some());
        step.close().unwrap();
    }

    #[test]
    fn test_run_needs_all_arguments() {
        let w = worker();
        let count = CountState::new(&w, 1).unwrap();
        let mut step = SimpleStep::build(&w, "bump.wgsl", "bump", &loader()).unwrap();
        step.build_kernel().unwrap();

        step.set_arg(1, KernelArg::Int(3));
        step.set_range(NdRange::d1(2));
        assert!(matches!(step.run(), Err(Error::InvalidArgument(_))));

        step.set_arg(0, KernelArg::Mem(count.mem()));
        step.run().unwrap();
        assert_eq!(count.get_count().unwrap(), 3);

        step.close().unwrap();
        count.close().unwrap();
    }

    #[test]
    fn test_bad_kernel_name_stays_program_built() {
        let w = worker();
        let mut step = SimpleStep::build(&w, "bump.wgsl", "missing", &loader()).unwrap();
        assert!(matches!(step.build_kernel(), Err(Error::KernelNotFound { .. })));
        assert_eq!(step.state(), StepState::ProgramBuilt);
        step.close().unwrap();
        assert_eq!(w.live_resources().len(), 2);
    }

    #[test]
    fn test_missing_resource() {
        let w = worker();
        let err = SimpleStep::build(&w, "absent.wgsl", "bump", &loader()).err().unwrap();
        assert!(matches!(err, Error::ResourceNotFound { .. }));
    }

    #[test]
    fn test_measure() {
        let w = worker();
        let count = CountState::new(&w, 1).unwrap();
        let mut step = SimpleStep::build(&w, "bump.wgsl", "bump", &loader()).unwrap();
        step.build_kernel().unwrap();
        step.set_arg(0, KernelArg::Mem(count.mem()));
        step.set_arg(1, KernelArg::Int(1));
        step.set_range(NdRange::d1(1));

        step.measure(5).unwrap();
        assert_eq!(count.get_count().unwrap(), 5);
        assert!(step.measure(0).is_err());

        step.close().unwrap();
        count.close().unwrap();
    }
}
