//! An assortment of non-owning containers.
//!
//! All of these containers have some option to construct them from one (or more) slices of the
//! underlying types instead of allocating resources dynamically. A strict `no_std` crate can not
//! allocate on its own, so the calling code passes the memory in and the containers here only
//! manage it.
mod partial;
mod slice;

pub use self::partial::Partial;
pub use self::slice::Slice;

/// A sort of `Vec` on initialized data.
pub type List<'a, T> = Partial<Slice<'a, T>>;
