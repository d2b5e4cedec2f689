use std::collections::HashMap;

use ndarray::{ShapeError, prelude::*};

use crate::{BoundGraph, Context, DType, EngineErr, Graph, InferredShapes, Result, Shape, Tensor};

/// The loss head on top of a `Dense` graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseOutput {
    /// Identity output, the gradient is `output - label`.
    LinearRegression,
    /// Row wise softmax over class scores, labels are class indices.
    Softmax,
}

impl DenseOutput {
    fn prefix(self) -> &'static str {
        match self {
            DenseOutput::LinearRegression => "lro",
            DenseOutput::Softmax => "softmax",
        }
    }
}

/// A single fully connected layer with a loss head.
///
/// Arguments are `data`, `{name}_weight` of shape `[num_hidden, features]`,
/// `{name}_bias` of shape `[num_hidden]` and the label.
#[derive(Debug, Clone)]
pub struct Dense {
    name: String,
    num_hidden: usize,
    output: DenseOutput,
}

impl Dense {
    /// Creates a new `Dense` graph.
    ///
    /// # Arguments
    /// * `name` - The prefix of the parameter names.
    /// * `num_hidden` - The amount of outputs per sample.
    /// * `output` - The loss head.
    pub fn new(name: &str, num_hidden: usize, output: DenseOutput) -> Self {
        Self {
            name: name.to_string(),
            num_hidden,
            output,
        }
    }

    pub fn label_name(&self) -> String {
        format!("{}_label", self.output.prefix())
    }

    fn label_shape(&self, batch: usize) -> Shape {
        match self.output {
            DenseOutput::LinearRegression => Shape::from([batch, self.num_hidden]),
            DenseOutput::Softmax => Shape::from([batch]),
        }
    }
}

fn shape_err(e: ShapeError) -> EngineErr {
    EngineErr::ShapeMismatch(e.to_string())
}

impl Graph for Dense {
    fn list_arguments(&self) -> Vec<String> {
        vec![
            "data".to_string(),
            format!("{}_weight", self.name),
            format!("{}_bias", self.name),
            self.label_name(),
        ]
    }

    fn list_auxiliary_states(&self) -> Vec<String> {
        Vec::new()
    }

    fn list_outputs(&self) -> Vec<String> {
        vec![format!("{}_output", self.output.prefix())]
    }

    fn infer_shape(&self, known: &HashMap<String, Shape>) -> Result<InferredShapes> {
        let data = known
            .get("data")
            .ok_or_else(|| EngineErr::ShapeMismatch("the shape of data is unknown".into()))?;

        if data.ndim() < 2 {
            return Err(EngineErr::ShapeMismatch(format!(
                "data must have a batch axis and features, got {data}"
            )));
        }

        let batch = data.rows();
        let features = data.row_size();
        let label = self.label_shape(batch);

        if let Some(given) = known.get(&self.label_name()) {
            if given.size() != label.size() {
                return Err(EngineErr::ShapeMismatch(format!(
                    "label must be {label}, got {given}"
                )));
            }
        }

        Ok(InferredShapes {
            args: vec![
                data.clone(),
                Shape::from([self.num_hidden, features]),
                Shape::from([self.num_hidden]),
                label,
            ],
            outputs: vec![Shape::from([batch, self.num_hidden])],
            aux: Vec::new(),
        })
    }

    fn bind(
        &self,
        ctx: Context,
        args: Vec<Tensor>,
        grads: Vec<Option<Tensor>>,
        aux: Vec<Tensor>,
    ) -> Result<Box<dyn BoundGraph>> {
        if args.len() != 4 || grads.len() != 4 || !aux.is_empty() {
            return Err(EngineErr::ShapeMismatch(format!(
                "expected 4 arguments, 4 gradients and no auxiliary states, got {}, {} and {}",
                args.len(),
                grads.len(),
                aux.len()
            )));
        }

        let known = HashMap::from([
            ("data".to_string(), args[0].shape().clone()),
            (self.label_name(), args[3].shape().clone()),
        ]);
        let shapes = self.infer_shape(&known)?;

        for (i, (arg, expected)) in args.iter().zip(&shapes.args).enumerate() {
            let grad_size = grads[i].as_ref().map_or(arg.size(), Tensor::size);

            if arg.size() != expected.size() || grad_size != expected.size() {
                return Err(EngineErr::ShapeMismatch(format!(
                    "argument {i} must be {expected}, got {}",
                    arg.shape()
                )));
            }
        }

        let output = Tensor::zeros(shapes.outputs[0].clone(), ctx, DType::F32)?;

        Ok(Box::new(BoundDense {
            num_hidden: self.num_hidden,
            kind: self.output,
            args,
            grads,
            outputs: vec![output],
            trained: false,
        }))
    }
}

struct BoundDense {
    num_hidden: usize,
    kind: DenseOutput,
    args: Vec<Tensor>,
    grads: Vec<Option<Tensor>>,
    outputs: Vec<Tensor>,
    trained: bool,
}

impl BoundDense {
    fn dims(&self) -> (usize, usize) {
        let data = self.args[0].shape();
        (data.rows(), data.row_size())
    }
}

impl BoundGraph for BoundDense {
    fn forward(&mut self, is_train: bool) -> Result<()> {
        let (batch, features) = self.dims();

        let x = self.args[0].to_vec()?;
        let w = self.args[1].to_vec()?;
        let b = self.args[2].to_vec()?;

        let x = ArrayView2::from_shape((batch, features), &x).map_err(shape_err)?;
        let w = ArrayView2::from_shape((self.num_hidden, features), &w).map_err(shape_err)?;
        let b = ArrayView1::from(&b);

        let mut z = x.dot(&w.t());
        z += &b;

        if self.kind == DenseOutput::Softmax {
            for mut row in z.rows_mut() {
                let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
                row.mapv_inplace(|v| (v - max).exp());
                let sum = row.sum();
                row /= sum;
            }
        }

        self.outputs[0].with_data_mut(|out| {
            out.iter_mut().zip(z.iter()).for_each(|(o, &v)| *o = v);
        });

        self.trained = is_train;
        Ok(())
    }

    fn backward(&mut self) -> Result<()> {
        if !self.trained {
            return Err(EngineErr::Op(
                "backward needs a previous training forward pass".into(),
            ));
        }

        let (batch, features) = self.dims();
        let out = self.outputs[0].to_vec()?;
        let label = self.args[3].to_vec()?;

        let mut d = Array2::from_shape_vec((batch, self.num_hidden), out).map_err(shape_err)?;

        match self.kind {
            DenseOutput::LinearRegression => {
                let label = ArrayView2::from_shape((batch, self.num_hidden), &label)
                    .map_err(shape_err)?;
                d -= &label;
            }
            DenseOutput::Softmax => {
                for (mut row, &class) in d.rows_mut().into_iter().zip(&label) {
                    if class < 0. || class.fract() != 0. || class as usize >= self.num_hidden {
                        return Err(EngineErr::Op(format!(
                            "label {class} out of {} classes",
                            self.num_hidden
                        )));
                    }

                    row[class as usize] -= 1.;
                }
            }
        }

        let x = self.args[0].to_vec()?;
        let x = ArrayView2::from_shape((batch, features), &x).map_err(shape_err)?;

        if let Some(dw) = &self.grads[1] {
            let grad = d.t().dot(&x);
            dw.copy_from_slice(&grad.iter().copied().collect::<Vec<_>>())?;
        }

        if let Some(db) = &self.grads[2] {
            let grad = d.sum_axis(Axis(0));
            db.copy_from_slice(&grad.to_vec())?;
        }

        if let Some(dx) = &self.grads[0] {
            let w = self.args[1].to_vec()?;
            let w = ArrayView2::from_shape((self.num_hidden, features), &w).map_err(shape_err)?;
            let grad = d.dot(&w);
            dx.copy_from_slice(&grad.iter().copied().collect::<Vec<_>>())?;
        }

        if let Some(dl) = &self.grads[3] {
            dl.fill(0.);
        }

        Ok(())
    }

    fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }
}
