use std::fmt::{self, Display};

/// The dimensions of a tensor, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// The total amount of elements, `1` for a scalar shape.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// The size of the leading axis, `0` for a scalar shape.
    pub fn rows(&self) -> usize {
        self.0.first().copied().unwrap_or_default()
    }

    /// The amount of elements in a single row of the leading axis.
    pub fn row_size(&self) -> usize {
        self.0.iter().skip(1).product()
    }

    /// Returns this shape with the leading axis replaced by `rows`.
    ///
    /// # Arguments
    /// * `rows` - The new size of the leading axis.
    pub fn with_rows(&self, rows: usize) -> Self {
        let mut dims = self.0.clone();

        match dims.first_mut() {
            Some(first) => *first = rows,
            None => dims.push(rows),
        }

        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The element type tag of a tensor.
///
/// The host engine stores every tensor as `f32`, the tag is checked at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    F32,
    F64,
    I32,
}

impl Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

/// The device a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub device_type: DeviceType,
    pub device_id: usize,
}

impl Context {
    pub fn cpu(device_id: usize) -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id,
        }
    }

    pub fn gpu(device_id: usize) -> Self {
        Self {
            device_type: DeviceType::Gpu,
            device_id,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu(0)
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.device_type {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
        };

        write!(f, "{kind}({})", self.device_id)
    }
}
