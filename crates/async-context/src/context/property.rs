use std::fmt;

use downcast_rs::{impl_downcast, DowncastSync};

/// A value stored in a context's property bag.
///
/// Users get it back as an `Arc<dyn Property>` and downcast it to the concrete type they stored,
/// or use [`Context::get_as`](super::Context::get_as) to do both at once.
pub trait Property: DowncastSync + fmt::Debug {}

impl_downcast!(sync Property);

/// Blanket implementation for all types that implements `Send + Sync + Debug + 'static`
impl<T: Send + Sync + fmt::Debug + 'static> Property for T {}
