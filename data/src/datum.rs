//! Element types a blob can hold.
use crate::tensor::{Storage, Tensor};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum DatumType {
    F32,
    I64,
}

impl DatumType {
    pub fn is_float(&self) -> bool {
        *self == DatumType::F32
    }

    /// Map the element type codes used by serialized graphs (TensorProto
    /// data types) to a `DatumType`.
    pub fn from_proto_code(code: i64) -> Option<DatumType> {
        match code {
            1 => Some(DatumType::F32),
            // INT32 labels are widened, everything integral lives in i64 here
            2 | 10 => Some(DatumType::I64),
            _ => None,
        }
    }

    pub fn proto_code(&self) -> i64 {
        match self {
            DatumType::F32 => 1,
            DatumType::I64 => 10,
        }
    }
}

impl fmt::Display for DatumType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatumType::F32 => write!(f, "F32"),
            DatumType::I64 => write!(f, "I64"),
        }
    }
}

pub trait Datum:
    Copy
    + fmt::Debug
    + fmt::Display
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + num_traits::Zero
    + num_traits::One
    + 'static
{
    fn name() -> &'static str;
    fn datum_type() -> DatumType;

    #[doc(hidden)]
    fn wrap(data: Vec<Self>) -> Storage;
    #[doc(hidden)]
    fn slice(tensor: &Tensor) -> Option<&[Self]>;
    #[doc(hidden)]
    fn slice_mut(tensor: &mut Tensor) -> Option<&mut [Self]>;
}

macro_rules! datum {
    ($t:ty, $v:ident) => {
        impl Datum for $t {
            fn name() -> &'static str {
                stringify!($t)
            }

            fn datum_type() -> DatumType {
                DatumType::$v
            }

            fn wrap(data: Vec<Self>) -> Storage {
                Storage::$v(data)
            }

            fn slice(tensor: &Tensor) -> Option<&[Self]> {
                match &tensor.storage {
                    Storage::$v(v) => Some(v.as_slice()),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }

            fn slice_mut(tensor: &mut Tensor) -> Option<&mut [Self]> {
                match &mut tensor.storage {
                    Storage::$v(v) => Some(v.as_mut_slice()),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}

datum!(f32, F32);
datum!(i64, I64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_codes() {
        assert_eq!(DatumType::from_proto_code(1), Some(DatumType::F32));
        assert_eq!(DatumType::from_proto_code(2), Some(DatumType::I64));
        assert_eq!(DatumType::from_proto_code(DatumType::I64.proto_code()), Some(DatumType::I64));
        assert_eq!(DatumType::from_proto_code(7), None);
    }
}
