//! # Internal Macros
//!
//! Accessor-generation macros for zerocopy header structs. All on-disk
//! headers in HareDB store multi-byte fields as `zerocopy::little_endian`
//! wrapper types; these macros generate the `get`/`set` pairs that convert
//! to and from native integers.
//!
//! ## Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     pages: U64,
//!     freed: U32,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         pages: u64,
//!         freed: u32,
//!     }
//! }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    (@impl $field:ident, i64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i64) {
                self.$field = ::zerocopy::little_endian::I64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Generates only getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
