//! Utility
//!
//! **This module is exempt from the API stability guarantee.** The bitmap and
//! the bit-scan helper are public so that ports can reuse them.
#[macro_use]
pub(crate) mod pool;
mod clz;
pub(crate) mod intrusive_list;
mod prio_bitmap;
pub use self::{clz::leading_zeros, prio_bitmap::*};
pub(crate) use self::pool::Pool;
