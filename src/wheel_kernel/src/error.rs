//! Error codes
use core::fmt;

/// The macro to define [`KernelError`].
macro_rules! define_error_code {
    (
        $( #[$meta:meta] )*
        pub enum KernelError {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum KernelError {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl KernelError {
            /// Get the short name of the error code.
            ///
            /// # Examples
            ///
            /// ```
            /// use wheel_kernel::KernelError;
            /// assert_eq!(KernelError::WouldBlock.as_str(), "WouldBlock");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            /// Get the signed status code. Always negative.
            #[inline]
            pub const fn code(self) -> i8 {
                self as i8
            }

            /// Convert a signed status code back to `KernelError`. Returns
            /// `None` for `0` (success) and unknown codes.
            pub fn from_code(code: i8) -> Option<Self> {
                $(
                    if code == $vd {
                        return Some(Self::$vname);
                    }
                )*
                None
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for KernelError {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }

        impl fmt::Display for KernelError {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }

    };
}

define_error_code! {
    /// Every way a kernel operation can fail.
    ///
    /// The discriminants are the signed status codes reported across the
    /// C-style interface (see [`result_code`]). `0` is reserved for success.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum KernelError {
        /// The operation is explicitly unfinished and always fails (message
        /// queue deletion, optional interrupt controller paths).
        Unimplemented = -9,
        /// A handle does not name a live object, a priority is out of range,
        /// a size is zero, or a parameter is otherwise invalid.
        InvalidArgument = -17,
        /// The current context disallows the operation: an interrupt
        /// handler, the idle task, a locked scheduler, a nested critical
        /// job, or the pre-kernel phase.
        BadContext = -25,
        /// The caller does not own the mutex.
        NotOwner = -29,
        /// An object arena is full or a memory allocation failed.
        ResourceExhausted = -33,
        /// A semaphore count is already at its representable maximum.
        Overflow = -43,
        /// The critical-job ring or a deferred-work FIFO is full. The job was
        /// dropped.
        QueueFull = -45,
        /// The wait expired before the condition was satisfied.
        Timeout = -50,
        /// A polling operation found the resource unavailable.
        WouldBlock = -51,
    }
}

/// The result type of kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Collapse a kernel result into a signed status: `0` on success, the
/// negative error code on failure.
#[inline]
pub fn result_code<T>(result: &KernelResult<T>) -> i8 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
