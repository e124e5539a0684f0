//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U32, U64, I32, I64). Used by the on-disk
//! headers of the block store, the table and the records.
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     end_offset: U64,
//!     version: U32,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         end_offset: u64,
//!         version: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn end_offset(&self) -> u64 { self.end_offset.get() }
//! // pub fn set_end_offset(&mut self, val: u64) { self.end_offset = U64::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
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
    (@impl $field:ident, i32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i32) {
                self.$field = ::zerocopy::little_endian::I32::new(val);
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
