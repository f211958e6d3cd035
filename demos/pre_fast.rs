// demos/pre_fast.rs — run the FAST pre-test on a synthetic frame.
//
//   cargo run --example pre_fast            host platform
//   cargo run --example pre_fast -- gpu     first wgpu adapter
//
// Set RUST_LOG=debug to watch objects being acquired and released.

use std::sync::Arc;

use gpuwork::platform::host::HostPlatform;
use gpuwork::{
    EmbeddedSources, GpuPlatform, ImageState, ListState, PixelFormat, Platform, PreFastStep,
    WorkStep, Worker,
};

const NX: usize = 160;
const NY: usize = 120;

fn main() -> gpuwork::Result<()> {
    env_logger::init();

    let platform: Arc<dyn Platform> = match std::env::args().nth(1).as_deref() {
        Some("gpu") => Arc::new(GpuPlatform::new()?),
        _ => Arc::new(HostPlatform::new()),
    };
    let device = platform.devices()?.remove(0);
    let worker = Worker::new(platform, device)?;
    println!("worker on {}", worker.name());

    let mut frame = vec![20u8; NX * NY];
    for (x0, y0) in [(30, 30), (90, 50), (50, 80)] {
        for y in y0..y0 + 20 {
            for x in x0..x0 + 20 {
                frame[y * NX + x] = 200;
            }
        }
    }

    let image = ImageState::new(&worker, PixelFormat::GRAY8, NX as u32, NY as u32)?;
    let points = ListState::<i32>::new(&worker, 256, 2)?;
    image.write_gray(&frame)?;

    let step = PreFastStep::new(&image, &points, 40, &EmbeddedSources::bundled())?;
    step.run()?;
    let corners = step.corners()?;
    println!("{} candidates (counter {})", corners.len(), points.get_count()?);
    for (x, y) in corners.iter().take(8) {
        println!("  ({x:3}, {y:3})");
    }

    let mean = step.measure(20)?;
    println!("mean run time: {mean:?}");

    step.close()?;
    points.close()?;
    image.close()?;
    worker.close()
}
