//! Shared, device-tagged byte buffers passed to collectives.
//!
//! A `Tensor` is a cheap handle: clones share storage, so the caller keeps
//! a clone to observe results once the request completes. Storage is always
//! host-addressable; the `Device` tag drives memory kind and stream
//! ordering, not placement.

use std::sync::{Arc, Mutex};

use crate::error::{Result, XcollError};
use crate::types::{DataType, Device};

/// Element types that can be moved in and out of a `Tensor`.
pub trait Element: Copy + 'static {
    const DTYPE: DataType;

    fn append_le(self, out: &mut Vec<u8>);

    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = $dtype;

                #[inline]
                fn append_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    f32 => DataType::F32,
    f64 => DataType::F64,
    i8 => DataType::I8,
    i32 => DataType::I32,
    i64 => DataType::I64,
    u8 => DataType::U8,
    u32 => DataType::U32,
    u64 => DataType::U64,
);

#[derive(Debug, Clone)]
pub struct Tensor {
    device: Device,
    dtype: DataType,
    storage: Arc<Mutex<Vec<u8>>>,
}

impl Tensor {
    pub fn from_slice<T: Element>(device: Device, data: &[T]) -> Self {
        let mut bytes = Vec::with_capacity(std::mem::size_of_val(data));
        for &v in data {
            v.append_le(&mut bytes);
        }
        Self::from_parts(device, T::DTYPE, bytes)
    }

    pub fn zeros(device: Device, dtype: DataType, numel: usize) -> Self {
        Self::from_parts(device, dtype, vec![0u8; numel * dtype.size_in_bytes()])
    }

    /// Wrap raw little-endian bytes. The length must be a whole number of
    /// `dtype` elements.
    pub fn from_bytes(device: Device, dtype: DataType, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() % dtype.size_in_bytes() != 0 {
            return Err(XcollError::InvalidArgument(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(Self::from_parts(device, dtype, bytes))
    }

    fn from_parts(device: Device, dtype: DataType, bytes: Vec<u8>) -> Self {
        Self {
            device,
            dtype,
            storage: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Allocate a contiguous scratch tensor holding every output back to
    /// back, on the device and with the dtype of the first output.
    pub(crate) fn new_like_flat(outputs: &[Tensor]) -> Result<Self> {
        let first = outputs
            .first()
            .ok_or_else(|| XcollError::InvalidArgument("empty output list".into()))?;
        let mut numel = 0;
        for t in outputs {
            numel += t.numel()?;
        }
        Ok(Self::zeros(first.device, first.dtype, numel))
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    pub fn len_bytes(&self) -> Result<usize> {
        self.with_bytes(|b| b.len())
    }

    pub fn numel(&self) -> Result<usize> {
        Ok(self.len_bytes()? / self.element_size())
    }

    /// Whether two handles point at the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let guard = self
            .storage
            .lock()
            .map_err(|_| XcollError::LockPoisoned("tensor storage"))?;
        Ok(f(&guard))
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self
            .storage
            .lock()
            .map_err(|_| XcollError::LockPoisoned("tensor storage"))?;
        Ok(f(&mut guard))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.with_bytes(|b| b.to_vec())
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(XcollError::InvalidArgument(format!(
                "tensor holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let size = self.element_size();
        self.with_bytes(|b| b.chunks_exact(size).map(T::from_le).collect())
    }

    /// Copy `len` bytes starting at `offset` out of the tensor.
    pub fn read_range(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.with_bytes(|b| {
            b.get(offset..offset + len)
                .map(<[u8]>::to_vec)
                .ok_or(XcollError::BufferSizeMismatch {
                    expected: offset + len,
                    actual: b.len(),
                })
        })?
    }

    /// Overwrite bytes starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.with_bytes_mut(|b| {
            let actual = b.len();
            let dst = b
                .get_mut(offset..offset + data.len())
                .ok_or(XcollError::BufferSizeMismatch {
                    expected: offset + data.len(),
                    actual,
                })?;
            dst.copy_from_slice(data);
            Ok(())
        })?
    }
}
