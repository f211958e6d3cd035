// image.rs — host-side image container used to move pixels in and out of
// `ImageState`.
//
// Row-major with an explicit row stride in elements. Device images are
// always tightly packed: padding is stripped on upload (`packed_bytes`) and
// images rebuilt from a readback (`from_packed_bytes`) have stride == width.

use std::fmt;

use crate::error::{Error, Result};
use crate::format::{ChannelOrder, ChannelType, PixelFormat};

// ---------------------------------------------------------------------------
// Pixel
// ---------------------------------------------------------------------------

/// A single-channel pixel scalar that can be staged to a device image.
pub trait Pixel: bytemuck::Pod + Default + PartialOrd + Send + Sync + 'static {
    const CHANNEL: ChannelType;

    /// The single-channel format this pixel type maps to.
    const FORMAT: PixelFormat = PixelFormat::new(ChannelOrder::Intensity, Self::CHANNEL);
}

macro_rules! pixel {
    ($($t:ty => $c:ident),* $(,)?) => {
        $(impl Pixel for $t {
            const CHANNEL: ChannelType = ChannelType::$c;
        })*
    };
}

pixel! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    f32 => F32,
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq)]
pub struct Image<T: Pixel> {
    /// `height * stride` elements.
    data: Vec<T>,
    width: usize,
    height: usize,
    stride: usize,
}

impl<T: Pixel> Image<T> {
    /// Zero-filled, tightly packed.
    pub fn new(width: usize, height: usize) -> Self {
        Self::from_vec(width, height, vec![T::default(); width * height])
    }

    /// Panics unless `data` holds exactly `width * height` pixels.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        Self::from_vec_with_stride(width, height, width, data)
    }

    /// Panics if `stride < width` or `data` is not `height * stride` long.
    pub fn from_vec_with_stride(width: usize, height: usize, stride: usize, data: Vec<T>) -> Self {
        assert!(stride >= width, "row stride {stride} is narrower than width {width}");
        assert!(
            data.len() == height * stride,
            "{} pixels supplied for {height} rows of stride {stride}",
            data.len()
        );
        Image { data, width, height, stride }
    }

    /// Rebuild an image from tightly packed native-endian bytes, as read
    /// back from a device.
    pub fn from_packed_bytes(width: usize, height: usize, bytes: &[u8]) -> Result<Self> {
        let expected = width * height * std::mem::size_of::<T>();
        if bytes.len() != expected {
            return Err(Error::shape(
                format!("{width}×{height} {} ({expected} bytes)", T::FORMAT),
                format!("{} bytes", bytes.len()),
            ));
        }
        // `bytes` need not be aligned for T.
        Ok(Image::from_vec(width, height, bytemuck::pod_collect_to_vec(bytes)))
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row stride in elements.
    pub fn stride(&self) -> usize {
        self.stride
    }

    fn index(&self, x: usize, y: usize) -> usize {
        assert!(
            x < self.width && y < self.height,
            "({x}, {y}) is outside the {}×{} image",
            self.width,
            self.height
        );
        y * self.stride + x
    }

    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[self.index(x, y)]
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let i = self.index(x, y);
        self.data[i] = value;
    }

    /// Row `y` without padding.
    pub fn row(&self, y: usize) -> &[T] {
        let start = self.index(0, y);
        &self.data[start..start + self.width]
    }

    /// Backing store, padding included.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Pixels as tightly packed bytes.
    pub fn packed_bytes(&self) -> Vec<u8> {
        if self.stride == self.width {
            return bytemuck::cast_slice(&self.data).to_vec();
        }
        (0..self.height)
            .flat_map(|y| bytemuck::cast_slice::<T, u8>(self.row(y)).iter().copied())
            .collect()
    }
}

impl<T: Pixel> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image({}×{} {}, stride {})",
            self.width,
            self.height,
            T::FORMAT,
            self.stride
        )
    }
}
