// state/mod.rs — device memory with host staging.
//
// A work state is a device allocation plus the host memory it is staged
// through. All allocation happens in the constructor; all transfers are
// blocking. States borrow their worker, so a state can never outlive it.
//
//   CountState       one i32 counter
//   ListState<T>     `size` records of `each` items of T, plus a counter
//   ImageState       a 2D device image

mod count;
mod image;
mod list;
mod stage;

pub use count::CountState;
pub use image::ImageState;
pub use list::ListState;

use crate::worker::Worker;

/// Something allocated against a worker.
pub trait WorkState<'w> {
    fn worker(&self) -> &'w Worker;
}

/// Plain-data item type a `ListState` can hold.
///
/// Implemented for the primitive integer and float types; implement it for
/// `#[repr(C)]` records deriving `bytemuck::Pod` to stage structured data.
pub trait Item: bytemuck::Pod + Send + Sync + 'static {
    /// Short name used in logs and shape errors.
    const NAME: &'static str;
}

macro_rules! item {
    ($($t:ty),* $(,)?) => {
        $(impl Item for $t {
            const NAME: &'static str = stringify!($t);
        })*
    };
}

item!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Size and alignment of a list item, as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemDesc {
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
}

impl ItemDesc {
    pub fn of<T: Item>() -> Self {
        ItemDesc {
            name: T::NAME,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }
}
