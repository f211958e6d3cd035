// format.rs — pixel format descriptors for device images.
//
// A format is a channel order (how many channels, which ones) combined with
// a channel type (the scalar stored per channel). Platforms translate the
// pair into their native image format; combinations a platform cannot
// express are rejected with `Error::Unsupported` at image creation.

use std::fmt;

/// Channel layout of a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    /// One channel, replicated on read (grayscale).
    Intensity,
    Rg,
    Rgb,
    Rgba,
}

impl ChannelOrder {
    pub const fn channels(self) -> usize {
        match self {
            ChannelOrder::Intensity => 1,
            ChannelOrder::Rg => 2,
            ChannelOrder::Rgb => 3,
            ChannelOrder::Rgba => 4,
        }
    }
}

/// Scalar type of each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
}

impl ChannelType {
    pub const fn bytes(self) -> usize {
        match self {
            ChannelType::U8 | ChannelType::I8 => 1,
            ChannelType::U16 | ChannelType::I16 => 2,
            ChannelType::U32 | ChannelType::I32 | ChannelType::F32 => 4,
        }
    }
}

/// Pixel format of a device image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    pub order: ChannelOrder,
    pub channel: ChannelType,
}

impl PixelFormat {
    /// 8-bit single-channel grayscale. The format every camera frame in the
    /// pipeline arrives in.
    pub const GRAY8: PixelFormat = PixelFormat::new(ChannelOrder::Intensity, ChannelType::U8);

    /// 32-bit float single channel, for response maps.
    pub const GRAYF32: PixelFormat = PixelFormat::new(ChannelOrder::Intensity, ChannelType::F32);

    /// 8-bit four-channel color.
    pub const RGBA8: PixelFormat = PixelFormat::new(ChannelOrder::Rgba, ChannelType::U8);

    pub const fn new(order: ChannelOrder, channel: ChannelType) -> Self {
        PixelFormat { order, channel }
    }

    #[inline]
    pub const fn channels(&self) -> usize {
        self.order.channels()
    }

    #[inline]
    pub const fn bytes_per_pixel(&self) -> usize {
        self.order.channels() * self.channel.bytes()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.order, self.channel)
    }
}
