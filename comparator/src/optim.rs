use std::collections::HashMap;

use burn::{config::Config, module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId}, optim::{GradientsParams, Optimizer}, tensor::{backend::{AutodiffBackend, Backend}, Tensor}, LearningRate};

#[derive(Config, Debug)]
pub struct LookaheadConfig {
    /// Fast steps between two slow-weight synchronizations.
    #[config(default = 5)]
    pub k: usize,
    #[config(default = 0.5)]
    pub alpha: f64,
}

impl LookaheadConfig {
    pub fn init<O, B: AutodiffBackend>(&self, inner: O) -> Lookahead<O, B> {
        Lookahead {
            inner,
            k: self.k.max(1),
            alpha: self.alpha,
            steps: 0,
            slow_weights: HashMap::new(),
        }
    }
}

/// Lookahead wrapper around any burn optimizer.
///
/// The inner optimizer moves the fast weights; every `k` steps the slow
/// weights move `alpha` of the way towards them and the module is reset to
/// the slow weights.
pub struct Lookahead<O, B: AutodiffBackend> {
    inner: O,
    k: usize,
    alpha: f64,
    steps: usize,
    slow_weights: HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
}

impl<O, B: AutodiffBackend> Lookahead<O, B> {
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Restores the step count of an interrupted run so that slow-weight
    /// synchronizations keep their `k`-step phase.
    pub fn set_steps(&mut self, steps: usize) {
        self.steps = steps;
    }
}

impl<O, M, B> Optimizer<M, B> for Lookahead<O, B>
where
    O: Optimizer<M, B>,
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    type Record = O::Record;

    fn step(&mut self, lr: LearningRate, module: M, grads: GradientsParams) -> M {
        if self.slow_weights.is_empty() {
            self.slow_weights = flatten_params(&module)
                .into_iter()
                .map(|(id, tensor)| (id, tensor.inner()))
                .collect();
        }

        let module = self.inner.step(lr, module, grads);
        self.steps += 1;
        if self.steps % self.k != 0 {
            return module;
        }

        let mut sync = SlowWeightsSync::<B> {
            alpha: self.alpha,
            slow_weights: &mut self.slow_weights,
        };
        module.map(&mut sync)
    }

    fn to_record(&self) -> Self::Record {
        self.inner.to_record()
    }

    /// Slow weights are not part of the record; they restart from the
    /// restored parameters on the next step. The step count is left as is,
    /// see [`Lookahead::set_steps`].
    fn load_record(mut self, record: Self::Record) -> Self {
        self.inner = self.inner.load_record(record);
        self.slow_weights.clear();
        self
    }
}

struct SlowWeightsSync<'a, B: AutodiffBackend> {
    alpha: f64,
    slow_weights: &'a mut HashMap<ParamId, Tensor<B::InnerBackend, 1>>,
}

impl<'a, B: AutodiffBackend> ModuleMapper<B> for SlowWeightsSync<'a, B> {
    fn map_float<const D: usize>(&mut self, id: &ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let require_grad = tensor.is_require_grad();
        let shape = tensor.shape();
        let fast = tensor.inner().reshape([shape.num_elements()]);

        let slow = match self.slow_weights.remove(id) {
            Some(slow) => slow.clone() + (fast - slow).mul_scalar(self.alpha),
            None => fast,
        };
        self.slow_weights.insert(id.clone(), slow.clone());

        let tensor = Tensor::from_inner(slow.reshape(shape));
        if require_grad {
            tensor.require_grad()
        } else {
            tensor
        }
    }
}

struct ParamFlattener<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamFlattener<B> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.params.insert(id.clone(), tensor.clone().reshape([numel]));
    }
}

/// Every float parameter of `module`, flattened and keyed by parameter id.
pub fn flatten_params<B: Backend, M: Module<B>>(module: &M) -> HashMap<ParamId, Tensor<B, 1>> {
    let mut flattener = ParamFlattener { params: HashMap::new() };
    module.visit(&mut flattener);
    flattener.params
}
