#[macro_use]
mod macros;

/// A Smallvec instantiation with 4 embeddable values.
///
/// Used about everywhere, for node inputs and outputs, or tensor dimensions.
pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

pub mod prelude {
    pub use crate::datum::{Datum, DatumType};
    pub use crate::fact::BlobFact;
    pub use crate::tensor::{IntoTensor, Tensor};
    pub use crate::tvec;
    pub use crate::TVec;
    pub use crate::dispatch_datum;
    pub use anyhow::{anyhow, bail, ensure, format_err, Context as DreamErrorContext};
}

pub mod internal {
    pub use crate::prelude::*;
    pub use ndarray as dream_ndarray;
    pub use smallvec as dream_smallvec;
}

pub use anyhow;

mod datum;
mod fact;
mod tensor;
