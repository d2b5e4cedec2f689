use std::collections::HashMap;

use crate::{Context, Result, Shape, Tensor};

/// The shapes a graph derives from its known input shapes.
///
/// Every vector follows the order of the matching `Graph::list_*` method.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InferredShapes {
    pub args: Vec<Shape>,
    pub outputs: Vec<Shape>,
    pub aux: Vec<Shape>,
}

/// A computation graph that can be bound to a device.
pub trait Graph: Send + Sync {
    /// The names of the graph's arguments, inputs and parameters alike.
    fn list_arguments(&self) -> Vec<String>;

    /// The names of the auxiliary states, updated by forward but never by gradients.
    fn list_auxiliary_states(&self) -> Vec<String>;

    fn list_outputs(&self) -> Vec<String>;

    /// Infers every shape from the shapes of the named inputs.
    ///
    /// # Arguments
    /// * `known` - The shapes of the inputs by name.
    ///
    /// # Returns
    /// The inferred shapes or a `ShapeMismatch` error.
    fn infer_shape(&self, known: &HashMap<String, Shape>) -> Result<InferredShapes>;

    /// Binds the graph to concrete tensors on `ctx`.
    ///
    /// # Arguments
    /// * `ctx` - The device to run on.
    /// * `args` - One tensor per argument.
    /// * `grads` - One gradient buffer per argument, `None` when it needs no gradient.
    /// * `aux` - One tensor per auxiliary state.
    ///
    /// # Returns
    /// The bound graph or a `ShapeMismatch` error.
    fn bind(
        &self,
        ctx: Context,
        args: Vec<Tensor>,
        grads: Vec<Option<Tensor>>,
        aux: Vec<Tensor>,
    ) -> Result<Box<dyn BoundGraph>>;
}

/// A graph bound to tensors on a single device.
pub trait BoundGraph: Send {
    /// Computes the outputs, `is_train` keeps what backward needs.
    fn forward(&mut self, is_train: bool) -> Result<()>;

    /// Overwrites the gradient buffers using the last training forward pass.
    fn backward(&mut self) -> Result<()>;

    fn outputs(&self) -> &[Tensor];
}
