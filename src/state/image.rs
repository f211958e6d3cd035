// state/image.rs — a 2D device image of fixed shape and format.
//
// Host data must match the declared shape exactly; a mismatched write is
// rejected before anything reaches the device, so the image keeps its
// previous content.

use log::warn;

use super::WorkState;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::image::{Image, Pixel};
use crate::platform::MemId;
use crate::worker::{Tracked, Worker};

pub struct ImageState<'w> {
    worker: &'w Worker,
    nx: u32,
    ny: u32,
    format: PixelFormat,
    image: Tracked<MemId>,
    released: bool,
}

impl<'w> ImageState<'w> {
    pub fn new(worker: &'w Worker, format: PixelFormat, nx: u32, ny: u32) -> Result<Self> {
        if nx == 0 || ny == 0 {
            return Err(Error::invalid(format!("image dimensions {nx}×{ny} must be positive")));
        }
        let image = worker.create_image(format, nx as usize, ny as usize)?;
        Ok(ImageState {
            worker,
            nx,
            ny,
            format,
            image,
            released: false,
        })
    }

    pub fn nx(&self) -> u32 {
        self.nx
    }

    pub fn ny(&self) -> u32 {
        self.ny
    }

    /// Pixel count, `nx * ny`.
    pub fn nxy(&self) -> usize {
        self.nx as usize * self.ny as usize
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn mem(&self) -> MemId {
        self.image.handle
    }

    fn byte_len(&self) -> usize {
        self.nxy() * self.format.bytes_per_pixel()
    }

    fn check_format(&self, actual: PixelFormat) -> Result<()> {
        if actual != self.format {
            return Err(Error::shape(self.format, actual));
        }
        Ok(())
    }

    /// Blocking write of a host image. Rows of a strided image are
    /// compacted first.
    pub fn write<P: Pixel>(&self, image: &Image<P>) -> Result<()> {
        self.check_format(P::FORMAT)?;
        if (image.width(), image.height()) != (self.nx as usize, self.ny as usize) {
            return Err(Error::shape(
                format!("{}×{}", self.nx, self.ny),
                format!("{}×{}", image.width(), image.height()),
            ));
        }
        self.worker.write_image(self.image.handle, &image.packed_bytes())
    }

    /// Blocking write of tightly packed pixels in the image's format.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.byte_len() {
            return Err(Error::shape(
                format!("{}×{} {} ({} bytes)", self.nx, self.ny, self.format, self.byte_len()),
                format!("{} bytes", bytes.len()),
            ));
        }
        self.worker.write_image(self.image.handle, bytes)
    }

    /// Write an 8-bit grayscale frame given as `nx * ny` bytes. The bytes
    /// are copied.
    pub fn write_gray(&self, bytes: &[u8]) -> Result<()> {
        self.check_format(PixelFormat::GRAY8)?;
        if bytes.len() != self.nxy() {
            return Err(Error::shape(
                format!("{} gray pixels", self.nxy()),
                format!("{} bytes", bytes.len()),
            ));
        }
        let frame = Image::from_vec(self.nx as usize, self.ny as usize, bytes.to_vec());
        self.write(&frame)
    }

    /// Blocking read into a host image.
    pub fn read<P: Pixel>(&self) -> Result<Image<P>> {
        self.check_format(P::FORMAT)?;
        let bytes = self.read_bytes()?;
        Image::from_packed_bytes(self.nx as usize, self.ny as usize, &bytes)
    }

    /// Blocking read of the tightly packed pixels.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.byte_len()];
        self.worker.read_image(self.image.handle, &mut out)?;
        Ok(out)
    }

    /// Blocking write of an all-zero image.
    pub fn zero(&self) -> Result<()> {
        self.write_bytes(&vec![0u8; self.byte_len()])
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.worker.release_mem(self.image)
    }
}

impl<'w> WorkState<'w> for ImageState<'w> {
    fn worker(&self) -> &'w Worker {
        self.worker
    }
}

impl crate::Closable for ImageState<'_> {
    fn close(self) -> Result<()> {
        ImageState::close(self)
    }
}

impl Drop for ImageState<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!("ImageState {}×{} dropped without close, releasing", self.nx, self.ny);
            if let Err(e) = self.release() {
                warn!("ImageState release on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::host::HostPlatform;
    use crate::platform::Platform;
    use std::sync::Arc;

    fn worker() -> Worker {
        let p = Arc::new(HostPlatform::new());
        let d = p.devices().unwrap().remove(0);
        Worker::new(p, d).unwrap()
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        let w = worker();
        assert!(matches!(
            ImageState::new(&w, PixelFormat::GRAY8, 0, 4),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_read_strided() {
        let w = worker();
        let s = ImageState::new(&w, PixelFormat::GRAY8, 3, 2).unwrap();
        let img = Image::<u8>::from_vec_with_stride(3, 2, 4, vec![1, 2, 3, 0, 4, 5, 6, 0]);
        s.write(&img).unwrap();
        let back: Image<u8> = s.read().unwrap();
        assert_eq!(back.stride(), 3);
        assert_eq!(back.as_slice(), &[1, 2, 3, 4, 5, 6]);
        s.close().unwrap();
    }

    #[test]
    fn test_pixel_type_must_match_format() {
        let w = worker();
        let s = ImageState::new(&w, PixelFormat::GRAY8, 2, 2).unwrap();
        let img = Image::<f32>::new(2, 2);
        assert!(matches!(s.write(&img), Err(Error::ShapeMismatch { .. })));
        assert!(matches!(s.read::<u16>(), Err(Error::ShapeMismatch { .. })));
        s.close().unwrap();
    }

    #[test]
    fn test_write_gray_length() {
        let w = worker();
        let s = ImageState::new(&w, PixelFormat::GRAY8, 4, 2).unwrap();
        assert!(matches!(s.write_gray(&[1; 7]), Err(Error::ShapeMismatch { .. })));
        s.write_gray(&[5; 8]).unwrap();
        assert_eq!(s.read_bytes().unwrap(), vec![5; 8]);
        s.zero().unwrap();
        assert_eq!(s.read_bytes().unwrap(), vec![0; 8]);
        s.close().unwrap();
    }

    #[test]
    fn test_rgba_bytes() {
        let w = worker();
        let s = ImageState::new(&w, PixelFormat::RGBA8, 2, 1).unwrap();
        s.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(s.read_bytes().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(s.write_gray(&[0; 2]), Err(Error::ShapeMismatch { .. })));
        s.close().unwrap();
    }
}
