// platform/host/native.rs — native kernels for the host device.
//
// A native kernel is a Rust function that receives the launch range and the
// bound arguments. Buffers and images are raw little-endian byte arrays; the
// accessors below do the bounds checks and (unaligned) conversions so the
// kernel bodies read like their device counterparts.
//
// `pre_fast_gray` is the CPU reference for src/kernels/pre_fast_gray.wgsl.
// Both must produce the same corner set for the same image; only the order
// of appended corners may differ on a real GPU.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::platform::{MemId, NdRange};

/// Signature of a host kernel body.
pub type NativeFn = dyn Fn(&mut Invocation<'_>) -> Result<()> + Send + Sync;

/// Shared handle to a host kernel body.
pub type NativeKernel = Arc<NativeFn>;

/// Shape of a bound memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemShape {
    Buffer,
    Image { format: PixelFormat, nx: usize, ny: usize },
}

pub(crate) enum Bound {
    Mem { id: MemId, shape: MemShape, data: Vec<u8> },
    Int(i32),
    Uint(u32),
    Float(f32),
}

/// One kernel launch as seen by a native kernel body.
pub struct Invocation<'a> {
    pub(crate) range: NdRange,
    pub(crate) args: &'a mut [Bound],
}

impl<'a> Invocation<'a> {
    pub fn range(&self) -> NdRange {
        self.range
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        match self.args.get(index) {
            Some(Bound::Int(v)) => Ok(*v),
            _ => Err(arg_error(index, "int")),
        }
    }

    pub fn uint(&self, index: usize) -> Result<u32> {
        match self.args.get(index) {
            Some(Bound::Uint(v)) => Ok(*v),
            _ => Err(arg_error(index, "uint")),
        }
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.args.get(index) {
            Some(Bound::Float(v)) => Ok(*v),
            _ => Err(arg_error(index, "float")),
        }
    }

    /// Raw bytes of a buffer argument.
    pub fn buffer(&self, index: usize) -> Result<&[u8]> {
        match self.args.get(index) {
            Some(Bound::Mem { shape: MemShape::Buffer, data, .. }) => Ok(data),
            _ => Err(arg_error(index, "buffer")),
        }
    }

    pub fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        match self.args.get_mut(index) {
            Some(Bound::Mem { shape: MemShape::Buffer, data, .. }) => Ok(data),
            _ => Err(arg_error(index, "buffer")),
        }
    }

    /// Format, dimensions and tightly packed bytes of an image argument.
    pub fn image(&self, index: usize) -> Result<(PixelFormat, usize, usize, &[u8])> {
        match self.args.get(index) {
            Some(Bound::Mem { shape: MemShape::Image { format, nx, ny }, data, .. }) => {
                Ok((*format, *nx, *ny, data))
            }
            _ => Err(arg_error(index, "image")),
        }
    }

    pub fn read_i32(&self, index: usize, element: usize) -> Result<i32> {
        let bytes = self.buffer(index)?;
        let at = element * 4;
        let chunk = bytes
            .get(at..at + 4)
            .ok_or_else(|| out_of_bounds(index, element, bytes.len()))?;
        Ok(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    pub fn write_i32(&mut self, index: usize, element: usize, value: i32) -> Result<()> {
        let bytes = self.buffer_mut(index)?;
        let len = bytes.len();
        let at = element * 4;
        let chunk = bytes
            .get_mut(at..at + 4)
            .ok_or_else(|| out_of_bounds(index, element, len))?;
        chunk.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Add `delta` to an i32 element and return the previous value.
    /// Launches run one work item at a time, so this is trivially atomic.
    pub fn fetch_add_i32(&mut self, index: usize, element: usize, delta: i32) -> Result<i32> {
        let old = self.read_i32(index, element)?;
        self.write_i32(index, element, old.wrapping_add(delta))?;
        Ok(old)
    }

    /// Read the first channel of a U8 image at (x, y), clamping coordinates
    /// to the edge.
    pub fn texel_u8(&self, index: usize, x: i64, y: i64) -> Result<u8> {
        let (format, nx, ny, data) = self.image(index)?;
        let bpp = format.bytes_per_pixel();
        let cx = x.clamp(0, nx as i64 - 1) as usize;
        let cy = y.clamp(0, ny as i64 - 1) as usize;
        Ok(data[(cy * nx + cx) * bpp])
    }

    /// Call `f` once per work item with its global id.
    pub fn for_each_item(
        &mut self,
        mut f: impl FnMut(&mut Self, [usize; 3]) -> Result<()>,
    ) -> Result<()> {
        let [gx, gy, gz] = self.range.global;
        for z in 0..gz {
            for y in 0..gy {
                for x in 0..gx {
                    f(self, [x, y, z])?;
                }
            }
        }
        Ok(())
    }
}

fn arg_error(index: usize, want: &str) -> Error {
    Error::invalid(format!("kernel argument {index} is not bound as {want}"))
}

fn out_of_bounds(index: usize, element: usize, len: usize) -> Error {
    Error::invalid(format!(
        "kernel argument {index}: element {element} is outside a {len}-byte buffer"
    ))
}

// ---------------------------------------------------------------------------
// pre_fast_gray
// ---------------------------------------------------------------------------
//
// Arguments:
//   0  image      GRAY8 image
//   1  corners    i32 buffer, (x, y) pairs
//   2  count      i32 counter, incremented once per candidate
//   3  threshold  int
//   4  capacity   uint, number of pairs `corners` can hold
//   5  border     uint, offset of the work-item grid inside the image
//
// Compass neighbours at radius 3, visited in circular order so that each
// neighbour is adjacent to the next one.

const COMPASS: [(i64, i64); 4] = [(0, 3), (3, 0), (0, -3), (-3, 0)];

pub(crate) fn pre_fast_gray(inv: &mut Invocation<'_>) -> Result<()> {
    let threshold = inv.int(3)?;
    let capacity = inv.uint(4)?;
    let capacity = i32::try_from(capacity)
        .map_err(|_| Error::invalid(format!("corner capacity {capacity} exceeds the i32 counter")))?;
    let border = inv.uint(5)? as i64;

    let (format, _, _, _) = inv.image(0)?;
    if format != PixelFormat::GRAY8 {
        return Err(Error::shape(PixelFormat::GRAY8, format));
    }

    inv.for_each_item(|inv, [gx, gy, _]| {
        let x = gx as i64 + border;
        let y = gy as i64 + border;

        let centre = inv.texel_u8(0, x, y)? as i32;
        let mut differs = [false; 4];
        for (d, (ox, oy)) in differs.iter_mut().zip(COMPASS) {
            let p = inv.texel_u8(0, x + ox, y + oy)? as i32;
            *d = (p - centre).abs() > threshold;
        }

        let corner = (0..4).any(|k| differs[k] && differs[(k + 1) % 4]);
        if corner {
            let slot = inv.fetch_add_i32(2, 0, 1)?;
            if slot >= 0 && slot < capacity {
                let slot = slot as usize;
                inv.write_i32(1, slot * 2, x as i32)?;
                inv.write_i32(1, slot * 2 + 1, y as i32)?;
            }
        }
        Ok(())
    })
}

/// Native kernels every `HostPlatform` registers by default.
pub(crate) fn builtin() -> Vec<(&'static str, NativeKernel)> {
    vec![("pre_fast_gray", Arc::new(pre_fast_gray) as NativeKernel)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(nx: usize, ny: usize, data: Vec<u8>) -> Bound {
        Bound::Mem {
            id: MemId(1),
            shape: MemShape::Image { format: PixelFormat::GRAY8, nx, ny },
            data,
        }
    }

    fn buffer(bytes: usize) -> Bound {
        Bound::Mem { id: MemId(2), shape: MemShape::Buffer, data: vec![0; bytes] }
    }

    #[test]
    fn test_fetch_add_returns_previous() {
        let mut args = [buffer(8)];
        let mut inv = Invocation { range: NdRange::d1(1), args: &mut args };
        assert_eq!(inv.fetch_add_i32(0, 1, 5).unwrap(), 0);
        assert_eq!(inv.fetch_add_i32(0, 1, 1).unwrap(), 5);
        assert_eq!(inv.read_i32(0, 1).unwrap(), 6);
        assert!(inv.read_i32(0, 2).is_err());
    }

    #[test]
    fn test_wrong_argument_kind() {
        let mut args = [Bound::Int(3)];
        let inv = Invocation { range: NdRange::d1(1), args: &mut args };
        assert!(inv.uint(0).is_err());
        assert!(inv.buffer(0).is_err());
        assert_eq!(inv.int(0).unwrap(), 3);
    }

    #[test]
    fn test_texel_clamps_to_edge() {
        let mut args = [gray(2, 2, vec![1, 2, 3, 4])];
        let inv = Invocation { range: NdRange::d1(1), args: &mut args };
        assert_eq!(inv.texel_u8(0, -5, 0).unwrap(), 1);
        assert_eq!(inv.texel_u8(0, 9, 9).unwrap(), 4);
    }

    #[test]
    fn test_pre_fast_flat_image_has_no_corners() {
        let (nx, ny) = (32, 32);
        let mut args = [
            gray(nx, ny, vec![128; nx * ny]),
            buffer(16 * 8),
            buffer(4),
            Bound::Int(20),
            Bound::Uint(16),
            Bound::Uint(8),
        ];
        let mut inv = Invocation { range: NdRange::d2(nx - 16, ny - 16), args: &mut args };
        pre_fast_gray(&mut inv).unwrap();
        assert_eq!(inv.read_i32(2, 0).unwrap(), 0);
    }

    #[test]
    fn test_pre_fast_single_bright_pixel() {
        // One bright pixel at (16, 16). All four of its compass neighbours
        // differ, so it is a candidate. The four pixels 3 away see it as a
        // single differing neighbour, which is not enough.
        let (nx, ny) = (32, 32);
        let mut pixels = vec![10u8; nx * ny];
        pixels[16 * nx + 16] = 200;
        let mut args = [
            gray(nx, ny, pixels),
            buffer(16 * 8),
            buffer(4),
            Bound::Int(20),
            Bound::Uint(16),
            Bound::Uint(8),
        ];
        let mut inv = Invocation { range: NdRange::d2(nx - 16, ny - 16), args: &mut args };
        pre_fast_gray(&mut inv).unwrap();
        assert_eq!(inv.read_i32(2, 0).unwrap(), 1);
        assert_eq!(inv.read_i32(1, 0).unwrap(), 16);
        assert_eq!(inv.read_i32(1, 1).unwrap(), 16);
    }

    #[test]
    fn test_pre_fast_counts_past_capacity() {
        // Checkerboard of 4×4 blocks: many candidates, room for only two.
        let (nx, ny) = (40, 40);
        let pixels: Vec<u8> = (0..nx * ny)
            .map(|i| if ((i % nx) / 4 + (i / nx) / 4) % 2 == 0 { 0 } else { 255 })
            .collect();
        let mut args = [
            gray(nx, ny, pixels),
            buffer(2 * 8),
            buffer(4),
            Bound::Int(50),
            Bound::Uint(2),
            Bound::Uint(8),
        ];
        let mut inv = Invocation { range: NdRange::d2(nx - 16, ny - 16), args: &mut args };
        pre_fast_gray(&mut inv).unwrap();
        let count = inv.read_i32(2, 0).unwrap();
        assert!(count > 2, "expected more candidates than capacity, got {count}");
    }

    #[test]
    fn test_pre_fast_rejects_capacity_beyond_counter() {
        let (nx, ny) = (32, 32);
        let mut args = [
            gray(nx, ny, vec![0; nx * ny]),
            buffer(8),
            buffer(4),
            Bound::Int(20),
            Bound::Uint(u32::MAX),
            Bound::Uint(8),
        ];
        let mut inv = Invocation { range: NdRange::d2(nx - 16, ny - 16), args: &mut args };
        assert!(matches!(pre_fast_gray(&mut inv), Err(Error::InvalidArgument(_))));
        assert_eq!(inv.read_i32(2, 0).unwrap(), 0);
    }
}
