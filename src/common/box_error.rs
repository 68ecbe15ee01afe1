//! crate wide error type.
//!
//! Boxed trait object so errors from any layer can be returned with `?`
//! and still move across thread boundaries.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
