use crate::datum::{Datum, DatumType};
use crate::TVec;
use itertools::Itertools;
use std::fmt;

/// Declared element type and shape of a blob.
///
/// Facts are computed once, when a net is instantiated, and every tensor
/// written afterwards is checked against them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobFact {
    pub datum_type: DatumType,
    pub shape: TVec<usize>,
}

impl BlobFact {
    pub fn dt_shape(datum_type: DatumType, shape: impl AsRef<[usize]>) -> BlobFact {
        BlobFact { datum_type, shape: shape.as_ref().iter().copied().collect() }
    }

    pub fn shape<T: Datum>(shape: impl AsRef<[usize]>) -> BlobFact {
        BlobFact::dt_shape(T::datum_type(), shape)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn volume(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for BlobFact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.shape.is_empty() {
            write!(f, "{}", self.datum_type)
        } else {
            write!(f, "{}x{}", self.shape.iter().join("x"), self.datum_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(BlobFact::shape::<f32>([1, 3, 224, 224]).to_string(), "1x3x224x224xF32");
        assert_eq!(BlobFact::shape::<i64>([0usize; 0]).to_string(), "I64");
    }
}
