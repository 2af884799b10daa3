//! # Internal Macros
//!
//! Boilerplate reduction for zerocopy structs whose fields use the
//! little-endian wrapper types (U16, U32, U64). The wrapper type is derived
//! from the native type name, so one arm covers every width.
//!
//! ## zerocopy_accessors!
//!
//! Getter/setter pairs for fields the code mutates in place:
//!
//! ```ignore
//! use zerocopy::little_endian::U64;
//!
//! #[repr(C)]
//! struct Header {
//!     root: U64,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         root: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn root(&self) -> u64 { self.root.get() }
//! // pub fn set_root(&mut self, value: u64) { self.root = U64::new(value); }
//! ```
//!
//! ## zerocopy_getters!
//!
//! Getters only, for fields written once at construction and read-only
//! afterwards. Using this instead of the read-write macro keeps setters
//! that nothing would ever call out of the API.

/// Generates a getter and setter for each little-endian zerocopy field.
#[macro_export]
macro_rules! zerocopy_accessors {
    ($($field:ident : $ty:ident),* $(,)?) => {
        ::paste::paste! {
            $(
                #[inline]
                pub fn $field(&self) -> $ty {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, value: $ty) {
                    self.$field = ::zerocopy::little_endian::[<$ty:upper>]::new(value);
                }
            )*
        }
    };
}

/// Generates only getters for little-endian zerocopy fields that are
/// written once at construction.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $ty:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $ty {
                self.$field.get()
            }
        )*
    };
}
