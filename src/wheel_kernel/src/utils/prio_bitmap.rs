//! Provides `PrioBitmap`, a bit array that finds its most urgent set entry in
//! constant time.
use core::fmt;
use num_traits::PrimInt;

use super::clz::leading_zeros;

/// A set of priority levels supporting constant-time minimum lookup.
///
/// All methods panic when the given position is out of range.
pub trait PrioBitmap: Default + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the smallest set position (the most urgent level).
    fn find_set(&self) -> Option<usize>;
}

/// Stores `T::BITS` entries in a single word. Position `i` is stored in bit
/// `BITS - 1 - i`, so the most urgent level is found by counting leading
/// zeros.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MsbPrioBitmap<T> {
    bits: T,
}

/// The bitmap used by the ready queue.
pub type PrioBitmap32 = MsbPrioBitmap<u32>;

impl<T: PrimInt> MsbPrioBitmap<T> {
    #[inline]
    fn width() -> usize {
        T::zero().count_zeros() as usize
    }

    #[inline]
    fn mask(i: usize) -> T {
        assert!(i < Self::width(), "priority {i} out of range");
        T::one() << (Self::width() - 1 - i)
    }

    /// Get the raw word. Bit `BITS - 1 - i` represents position `i`.
    #[inline]
    pub fn bits(&self) -> T {
        self.bits
    }
}

impl<T: PrimInt> fmt::Debug for MsbPrioBitmap<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..Self::width()).filter(|&i| self.bits & Self::mask(i) != T::zero()))
            .finish()
    }
}

impl<T> PrioBitmap for MsbPrioBitmap<T>
where
    T: PrimInt + Default + Send + Sync + 'static,
{
    fn get(&self, i: usize) -> bool {
        self.bits & Self::mask(i) != T::zero()
    }

    fn clear(&mut self, i: usize) {
        self.bits = self.bits & !Self::mask(i);
    }

    fn set(&mut self, i: usize) {
        self.bits = self.bits | Self::mask(i);
    }

    fn find_set(&self) -> Option<usize> {
        if self.bits.is_zero() {
            return None;
        }
        let i = match self.bits.to_u32() {
            // Use the target-tuned version for 32-bit words
            Some(word) if Self::width() == 32 => leading_zeros(word),
            _ => self.bits.leading_zeros(),
        };
        Some(i as usize)
    }
}
