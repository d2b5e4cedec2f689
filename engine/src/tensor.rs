use std::{
    fmt,
    ops::Range,
    sync::Arc,
};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::{Context, DType, EngineErr, Result, Shape, var::Var};

struct Storage {
    data: RwLock<Box<[f32]>>,
    len: usize,
    dtype: DType,
    ctx: Context,
    var: Var,
}

/// A shaped, typed array living on a device.
///
/// Cloning a `Tensor` clones the handle, both handles share the same storage.
/// Views created with `reshape` or `slice` share it as well.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    offset: usize,
    shape: Shape,
}

fn alloc(elements: usize) -> Result<Vec<f32>> {
    let mut data = Vec::new();
    data.try_reserve_exact(elements)
        .map_err(|_| EngineErr::AllocationFailure { elements })?;

    data.resize(elements, 0.);
    Ok(data)
}

impl Tensor {
    fn with_storage(data: Vec<f32>, shape: Shape, ctx: Context, dtype: DType) -> Self {
        let storage = Storage {
            len: data.len(),
            data: RwLock::new(data.into_boxed_slice()),
            dtype,
            ctx,
            var: Var::default(),
        };

        Self {
            storage: Arc::new(storage),
            offset: 0,
            shape,
        }
    }

    /// Allocates a zeroed tensor.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `ctx` - The device it lives on.
    /// * `dtype` - The element type tag.
    ///
    /// # Returns
    /// The new tensor or `AllocationFailure` if the memory can't be reserved.
    pub fn zeros(shape: impl Into<Shape>, ctx: Context, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        let data = alloc(shape.size())?;
        Ok(Self::with_storage(data, shape, ctx, dtype))
    }

    /// Allocates a tensor with every element set to `value`.
    pub fn full(shape: impl Into<Shape>, value: f32, ctx: Context) -> Result<Self> {
        let tensor = Self::zeros(shape, ctx, DType::F32)?;
        tensor.fill(value);
        Ok(tensor)
    }

    /// Creates a `float32` tensor owning `data`.
    ///
    /// # Returns
    /// `ShapeMismatch` if the length of `data` isn't the size of `shape`.
    pub fn from_vec(shape: impl Into<Shape>, data: Vec<f32>, ctx: Context) -> Result<Self> {
        let shape = shape.into();

        if shape.size() != data.len() {
            return Err(EngineErr::ShapeMismatch(format!(
                "{} values don't fit shape {shape}",
                data.len()
            )));
        }

        Ok(Self::with_storage(data, shape, ctx, DType::F32))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype
    }

    pub fn context(&self) -> Context {
        self.storage.ctx
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// The amount of elements reachable from this handle's offset in the storage.
    pub fn capacity(&self) -> usize {
        self.storage.len - self.offset
    }

    /// Whether both handles view the same storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Creates a view with a new shape over the leading elements of this tensor's storage.
    ///
    /// The new shape may be smaller than the current one, this is how shared buffers get
    /// reused for smaller batches.
    ///
    /// # Returns
    /// `ShapeMismatch` if `shape` needs more elements than the storage holds.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let capacity = self.capacity();

        if shape.size() > capacity {
            return Err(EngineErr::ShapeMismatch(format!(
                "can't view {capacity} elements as {shape}"
            )));
        }

        Ok(Tensor {
            storage: self.storage.clone(),
            offset: self.offset,
            shape,
        })
    }

    /// Creates a view over the rows `range` of the leading axis.
    ///
    /// # Returns
    /// `ShapeMismatch` if the range is reversed or past the leading axis.
    pub fn slice(&self, range: Range<usize>) -> Result<Tensor> {
        let rows = self.shape.rows();

        if range.start > range.end || range.end > rows {
            return Err(EngineErr::ShapeMismatch(format!(
                "rows {range:?} out of {rows}"
            )));
        }

        let row_size = self.shape.row_size();

        Ok(Tensor {
            storage: self.storage.clone(),
            offset: self.offset + range.start * row_size,
            shape: self.shape.with_rows(range.len()),
        })
    }

    /// Blocks until every pending write to this tensor finished.
    ///
    /// # Returns
    /// The error recorded by the last failed asynchronous write, if any.
    pub fn wait_to_read(&self) -> Result<()> {
        self.storage.var.wait_to_read()
    }

    /// Blocks until every pending read and write of this tensor finished.
    pub fn wait_to_write(&self) {
        self.storage.var.wait_to_write();
    }

    /// The error recorded by the last failed asynchronous write, without waiting.
    pub fn error(&self) -> Option<EngineErr> {
        self.storage.var.error()
    }

    /// Runs `f` over this tensor's elements once every pending write finished.
    pub fn with_data<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        self.wait_to_read()?;
        Ok(f(&self.read_guard()))
    }

    /// Runs `f` over this tensor's elements once every pending access finished.
    ///
    /// Writing through this handle clears any error recorded by a failed write.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        self.wait_to_write();
        self.storage.var.clear_error();
        f(&mut self.write_guard())
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.with_data(<[f32]>::to_vec)
    }

    pub fn fill(&self, value: f32) {
        self.with_data_mut(|data| data.fill(value));
    }

    /// Overwrites this tensor with `values`.
    ///
    /// # Returns
    /// `ShapeMismatch` if the lengths differ.
    pub fn copy_from_slice(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.size() {
            return Err(EngineErr::ShapeMismatch(format!(
                "{} values into a tensor of shape {}",
                values.len(),
                self.shape
            )));
        }

        self.with_data_mut(|data| data.copy_from_slice(values));
        Ok(())
    }

    /// Copies this tensor's elements into `other`, possibly across devices.
    ///
    /// # Returns
    /// `TypeMismatch` or `ShapeMismatch` if the tensors aren't compatible, or the
    /// error recorded on this tensor by a failed write.
    pub fn copy_to(&self, other: &Tensor) -> Result<()> {
        if self.dtype() != other.dtype() {
            return Err(EngineErr::TypeMismatch {
                expected: other.dtype(),
                found: self.dtype(),
            });
        }

        if self.size() != other.size() {
            return Err(EngineErr::ShapeMismatch(format!(
                "can't copy {} into {}",
                self.shape, other.shape
            )));
        }

        if self.same_storage(other) && self.offset == other.offset {
            return self.wait_to_read();
        }

        // Goes through an owned buffer since both views may share a storage lock.
        let values = self.to_vec()?;
        other.copy_from_slice(&values)
    }

    pub(crate) fn var(&self) -> &Var {
        &self.storage.var
    }

    pub(crate) fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.storage) as usize
    }

    pub(crate) fn read_guard(&self) -> MappedRwLockReadGuard<'_, [f32]> {
        let range = self.offset..self.offset + self.size();
        RwLockReadGuard::map(self.storage.data.read(), move |data| &data[range])
    }

    pub(crate) fn write_guard(&self) -> MappedRwLockWriteGuard<'_, [f32]> {
        let range = self.offset..self.offset + self.size();
        RwLockWriteGuard::map(self.storage.data.write(), move |data| &mut data[range])
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.storage.dtype)
            .field("ctx", &self.storage.ctx)
            .field("offset", &self.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Context {
        Context::cpu(0)
    }

    #[test]
    fn from_vec_checks_size() {
        let err = Tensor::from_vec([2, 2], vec![1., 2., 3.], cpu()).unwrap_err();
        assert!(matches!(err, EngineErr::ShapeMismatch(_)));
    }

    #[test]
    fn reshape_is_a_view() {
        let big = Tensor::zeros([4, 3], cpu(), DType::F32).unwrap();
        let small = big.reshape([2, 3]).unwrap();

        small.copy_from_slice(&[1., 2., 3., 4., 5., 6.]).unwrap();

        assert!(small.same_storage(&big));
        assert_eq!(big.shape(), &Shape::from([4, 3]));
        assert_eq!(&big.to_vec().unwrap()[..6], &[1., 2., 3., 4., 5., 6.]);
        assert!(big.reshape([5, 3]).is_err());
    }

    #[test]
    fn slice_selects_rows() {
        let t = Tensor::from_vec([3, 2], vec![0., 1., 2., 3., 4., 5.], cpu()).unwrap();

        let rows = t.slice(1..3).unwrap();
        assert_eq!(rows.shape(), &Shape::from([2, 2]));
        assert_eq!(rows.to_vec().unwrap(), vec![2., 3., 4., 5.]);

        rows.slice(1..2).unwrap().fill(9.);
        assert_eq!(t.to_vec().unwrap(), vec![0., 1., 2., 3., 9., 9.]);

        assert!(t.slice(2..4).is_err());
    }

    #[test]
    fn copy_to_checks_type_and_size() {
        let src = Tensor::full([2], 1., cpu()).unwrap();
        let ints = Tensor::zeros([2], cpu(), DType::I32).unwrap();
        let short = Tensor::zeros([1], cpu(), DType::F32).unwrap();

        assert!(matches!(
            src.copy_to(&ints),
            Err(EngineErr::TypeMismatch { .. })
        ));
        assert!(matches!(
            src.copy_to(&short),
            Err(EngineErr::ShapeMismatch(_))
        ));

        let dst = Tensor::zeros([2], Context::cpu(1), DType::F32).unwrap();
        src.copy_to(&dst).unwrap();
        assert_eq!(dst.to_vec().unwrap(), vec![1., 1.]);
    }

    #[test]
    fn copy_between_views_of_one_storage() {
        let t = Tensor::from_vec([2, 2], vec![1., 2., 3., 4.], cpu()).unwrap();
        t.slice(0..1)
            .unwrap()
            .copy_to(&t.slice(1..2).unwrap())
            .unwrap();

        assert_eq!(t.to_vec().unwrap(), vec![1., 2., 1., 2.]);
    }
}
