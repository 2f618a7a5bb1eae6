/// Provides a constant default value.
///
/// The handle types of this crate also implement
/// [`const_default1::ConstDefault`] with the same value, so they can be
/// placed in `static`s through either trait.
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}

#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl Init for std::alloc::System {
    const INIT: Self = Self;
}
