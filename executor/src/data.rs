use engine::{DType, Shape, Tensor};

/// The name, shape and type of an input the iterator provides.
#[derive(Debug, Clone, PartialEq)]
pub struct DataDesc {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
}

impl DataDesc {
    /// Creates a new `float32` input description.
    pub fn new(name: &str, shape: impl Into<Shape>) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.into(),
            dtype: DType::F32,
        }
    }
}

/// A batch of samples as yielded by a `DataIter`.
#[derive(Debug, Clone, Default)]
pub struct DataBatch {
    /// One tensor per data input, the leading axis is the batch.
    pub data: Vec<Tensor>,
    /// One tensor per label input.
    pub label: Vec<Tensor>,
    /// The amount of trailing samples that only fill the last batch.
    pub pad: usize,
    /// The bucket of variable shaped inputs this batch belongs to.
    pub bucket_key: Option<u64>,
    /// The input descriptions of this batch when it's bucket differs from the iterator's.
    pub provide_data: Option<Vec<DataDesc>>,
    pub provide_label: Option<Vec<DataDesc>>,
}

/// The source of training and evaluation batches.
pub trait DataIter {
    /// The description of every data input.
    fn provide_data(&self) -> &[DataDesc];

    /// The description of every label input.
    fn provide_label(&self) -> &[DataDesc];

    /// The amount of samples per batch.
    fn batch_size(&self) -> usize {
        self.provide_data().first().map_or(0, |desc| desc.shape.rows())
    }

    /// The bucket the default inputs describe, `None` when the iterator isn't bucketed.
    fn default_bucket_key(&self) -> Option<u64> {
        None
    }

    /// Starts over from the first batch.
    fn reset(&mut self);

    /// Returns the next batch or `None` at the end of the epoch.
    fn next_batch(&mut self) -> Option<DataBatch>;
}
