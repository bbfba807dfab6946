//! `Tensor` is the data container stored in workspaces.
use crate::datum::{Datum, DatumType};
use crate::fact::BlobFact;
use crate::TVec;
use itertools::Itertools;
use ndarray::prelude::*;
use std::fmt;

#[doc(hidden)]
#[derive(Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

/// A dense, row-major tensor of f32 or i64.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    pub(crate) shape: TVec<usize>,
    pub(crate) storage: Storage,
}

impl Tensor {
    /// Build a tensor from a shape and a vector of matching length.
    pub fn from_vec<T: Datum>(shape: &[usize], data: Vec<T>) -> anyhow::Result<Tensor> {
        let volume = shape.iter().product::<usize>();
        if volume != data.len() {
            anyhow::bail!(
                "Shape {:?} has {} elements, got {} {}",
                shape,
                volume,
                data.len(),
                T::name()
            )
        }
        Ok(Tensor { shape: shape.into(), storage: T::wrap(data) })
    }

    pub fn from_shape<T: Datum>(shape: &[usize], data: &[T]) -> anyhow::Result<Tensor> {
        Self::from_vec(shape, data.to_vec())
    }

    /// Create a tensor filled with `value`.
    pub fn filled<T: Datum>(shape: &[usize], value: T) -> Tensor {
        let volume = shape.iter().product::<usize>();
        Tensor { shape: shape.into(), storage: T::wrap(vec![value; volume]) }
    }

    pub fn zero<T: Datum>(shape: &[usize]) -> Tensor {
        Self::filled(shape, T::zero())
    }

    /// A rank 0 tensor.
    pub fn scalar<T: Datum>(value: T) -> Tensor {
        Tensor { shape: tvec!(), storage: T::wrap(vec![value]) }
    }

    pub fn datum_type(&self) -> DatumType {
        match self.storage {
            Storage::F32(_) => DatumType::F32,
            Storage::I64(_) => DatumType::I64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fact(&self) -> BlobFact {
        BlobFact { datum_type: self.datum_type(), shape: self.shape.clone() }
    }

    /// Reinterpret the same data under a new shape of the same volume.
    pub fn into_shape(mut self, shape: &[usize]) -> anyhow::Result<Tensor> {
        if shape.iter().product::<usize>() != self.len() {
            anyhow::bail!("Can not reshape {:?} to {:?}", self.shape, shape)
        }
        self.shape = shape.into();
        Ok(self)
    }

    fn check_for_access<D: Datum>(&self) -> anyhow::Result<()> {
        if self.datum_type() != D::datum_type() {
            anyhow::bail!(
                "Tensor datum type error: tensor is {:?}, accessed as {:?}",
                self.datum_type(),
                D::datum_type(),
            );
        }
        Ok(())
    }

    /// Access the data as a slice.
    pub fn as_slice<D: Datum>(&self) -> anyhow::Result<&[D]> {
        self.check_for_access::<D>()?;
        D::slice(self).ok_or_else(|| anyhow::anyhow!("Inconsistent storage for {:?}", self))
    }

    /// Access the data as a mutable slice.
    pub fn as_slice_mut<D: Datum>(&mut self) -> anyhow::Result<&mut [D]> {
        self.check_for_access::<D>()?;
        let dt = self.datum_type();
        D::slice_mut(self).ok_or_else(|| anyhow::anyhow!("Inconsistent storage for {:?}", dt))
    }

    /// Access the first element, for scalars and single element tensors.
    pub fn to_scalar<D: Datum>(&self) -> anyhow::Result<&D> {
        let slice = self.as_slice::<D>()?;
        if slice.is_empty() {
            anyhow::bail!("to_scalar called on empty tensor ({:?})", self)
        }
        Ok(&slice[0])
    }

    /// Transform the data as a `ndarray::Array`.
    pub fn to_array_view<D: Datum>(&self) -> anyhow::Result<ArrayViewD<'_, D>> {
        let slice = self.as_slice::<D>()?;
        Ok(ArrayViewD::from_shape(&*self.shape, slice)?)
    }

    /// Transform the data as a mutable `ndarray::Array`.
    pub fn to_array_view_mut<D: Datum>(&mut self) -> anyhow::Result<ArrayViewMutD<'_, D>> {
        let shape = self.shape.clone();
        let slice = self.as_slice_mut::<D>()?;
        Ok(ArrayViewMutD::from_shape(&*shape, slice)?)
    }

    /// Transform the tensor into a `ndarray::Array`.
    pub fn into_array<D: Datum>(self) -> anyhow::Result<ArrayD<D>> {
        Ok(self.to_array_view::<D>()?.to_owned())
    }

    /// False if any float element is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match &self.storage {
            Storage::F32(v) => v.iter().all(|x| x.is_finite()),
            Storage::I64(_) => true,
        }
    }

    /// Dump the tensor in a human readable form.
    ///
    /// `force_full` will force the tensor to be dump in full even if it is big.
    pub fn dump(&self, force_full: bool) -> String {
        fn dump_t<D: Datum>(tensor: &Tensor, n: usize) -> String {
            tensor.as_slice::<D>().map(|s| s[0..n].iter().join(", ")).unwrap_or_default()
        }
        let trunc = self.len() > 12 && !force_full;
        let data =
            dispatch_datum!(dump_t(self.datum_type())(self, if trunc { 12 } else { self.len() }));
        format!("{} {}{}", self.fact(), data, if trunc { "..." } else { "" })
    }

    /// Compare two tensors, allowing for rounding errors.
    pub fn close_enough(&self, other: &Self, approx: bool) -> anyhow::Result<()> {
        if self.shape() != other.shape() {
            anyhow::bail!("Shape mismatch {:?} != {:?}", self.shape(), other.shape())
        }
        if self.datum_type() != other.datum_type() {
            anyhow::bail!("Type mismatch {:?} != {:?}", self.datum_type(), other.datum_type())
        }
        if approx && self.datum_type().is_float() {
            let atol = 5e-4;
            let rtol = 1e-4;
            let ma = self.as_slice::<f32>()?;
            let mb = other.as_slice::<f32>()?;
            ma.iter().zip(mb.iter()).enumerate().try_for_each(|(ix, (&a, &b))| {
                if !((a.is_nan() && b.is_nan())
                    || (a.is_infinite() && b.is_infinite() && a.signum() == b.signum())
                    || (a - b).abs() <= atol + rtol * b.abs())
                {
                    anyhow::bail!("Mismatch at {} {} != {}", ix, a, b)
                }
                Ok(())
            })
        } else if self.eq(other) {
            Ok(())
        } else {
            anyhow::bail!("Mismatch")
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.dump(false))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.dump(false))
    }
}

pub trait IntoTensor: Sized {
    fn into_tensor(self) -> Tensor;
}

impl<D: Datum, Dim: Dimension> IntoTensor for Array<D, Dim> {
    fn into_tensor(self) -> Tensor {
        let shape: TVec<usize> = self.shape().into();
        let data = self.iter().copied().collect();
        Tensor { shape, storage: D::wrap(data) }
    }
}

impl<D: Datum, Dim: Dimension> From<Array<D, Dim>> for Tensor {
    fn from(it: Array<D, Dim>) -> Tensor {
        it.into_tensor()
    }
}

impl From<f32> for Tensor {
    fn from(it: f32) -> Tensor {
        Tensor::scalar(it)
    }
}

impl From<i64> for Tensor {
    fn from(it: i64) -> Tensor {
        Tensor::scalar(it)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn from_vec_checks_volume() {
        assert!(Tensor::from_vec(&[2, 3], vec![0f32; 5]).is_err());
        let t = Tensor::from_vec(&[2, 3], vec![0f32; 6]).unwrap();
        assert_eq!(t.fact(), BlobFact::shape::<f32>([2, 3]));
    }

    #[test]
    fn access_checks_type() {
        let t = Tensor::filled(&[2], 3i64);
        assert!(t.as_slice::<f32>().is_err());
        assert_eq!(t.as_slice::<i64>().unwrap(), &[3, 3]);
    }

    #[test]
    fn arrays_round_trip() {
        let a = arr2(&[[1f32, 2.], [3., 4.]]);
        let t: Tensor = a.clone().into();
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.into_array::<f32>().unwrap(), a.into_dyn());
    }

    #[test]
    fn transposed_arrays_are_copied_in_logical_order() {
        let a = arr2(&[[1f32, 2.], [3., 4.]]).reversed_axes();
        let t = a.into_tensor();
        assert_eq!(t.as_slice::<f32>().unwrap(), &[1., 3., 2., 4.]);
    }

    #[test]
    fn finiteness() {
        assert!(Tensor::filled(&[3], 1f32).is_finite());
        assert!(!Tensor::from_vec(&[2], vec![1f32, f32::NAN]).unwrap().is_finite());
        assert!(!Tensor::from_vec(&[2], vec![f32::INFINITY, 0.]).unwrap().is_finite());
    }

    #[test]
    fn reshape_keeps_data() {
        let t = Tensor::from_vec(&[2, 3], (0..6).map(|x| x as f32).collect()).unwrap();
        let t = t.into_shape(&[3, 2]).unwrap();
        assert_eq!(t.to_array_view::<f32>().unwrap()[[2, 1]], 5.0);
        assert!(t.into_shape(&[4]).is_err());
    }

    proptest! {
        #[test]
        fn close_enough_is_reflexive(data in proptest::collection::vec(-1e3f32..1e3, 1..32)) {
            let t = Tensor::from_vec(&[data.len()], data).unwrap();
            prop_assert!(t.close_enough(&t, true).is_ok());
            prop_assert!(t.close_enough(&t, false).is_ok());
        }
    }
}
