use burn::module::{ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;
use std::collections::HashMap;

/// Host copy of a float parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamValue {
    pub values: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Host copy of every float parameter of a module, keyed by parameter id
#[derive(Debug, Clone, Default)]
pub struct ParamSnapshot {
    params: HashMap<ParamId, ParamValue>,
}

impl ParamSnapshot {
    /// Copy the parameters of `module` to host memory
    pub fn capture<B: Backend, M: Module<B>>(module: &M) -> Self {
        let mut collector = Collector::default();
        module.visit(&mut collector);
        Self {
            params: collector.params,
        }
    }

    /// Overwrite the parameters of `module` that appear in this snapshot
    pub fn apply<B: Backend, M: Module<B>>(&self, module: M) -> M {
        module.map(&mut Applier { snapshot: self })
    }

    pub fn from_params(params: HashMap<ParamId, ParamValue>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &HashMap<ParamId, ParamValue> {
        &self.params
    }

    pub fn get(&self, id: &ParamId) -> Option<&ParamValue> {
        self.params.get(id)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters
    pub fn n_values(&self) -> usize {
        self.params.values().map(|p| p.values.len()).sum()
    }
}

#[derive(Default)]
struct Collector {
    params: HashMap<ParamId, ParamValue>,
}

impl<B: Backend> ModuleVisitor<B> for Collector {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let data = tensor.to_data();
        self.params.insert(
            id,
            ParamValue {
                shape: data.shape.clone(),
                values: data.iter::<f32>().collect(),
            },
        );
    }
}

struct Applier<'a> {
    snapshot: &'a ParamSnapshot,
}

impl<B: Backend> ModuleMapper<B> for Applier<'_> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.snapshot.get(&id) {
            Some(param) if param.values.len() == tensor.shape().num_elements() => {
                let device = tensor.device();
                Tensor::from_data(TensorData::new(param.values.clone(), param.shape.clone()), &device)
            }
            _ => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::LinearConfig;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_capture_and_apply() {
        let device = Default::default();
        let source = LinearConfig::new(3, 2).init::<TestBackend>(&device);
        let snapshot = ParamSnapshot::capture(&source);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.n_values(), 8);

        // Zero every value, apply, and check the module follows
        let zeroed = ParamSnapshot::from_params(
            snapshot
                .params()
                .iter()
                .map(|(id, p)| {
                    (
                        id.clone(),
                        ParamValue {
                            values: vec![0.0; p.values.len()],
                            shape: p.shape.clone(),
                        },
                    )
                })
                .collect(),
        );
        let target = zeroed.apply(source);
        let weight: Vec<f32> = target.weight.val().into_data().to_vec().unwrap();
        assert!(weight.iter().all(|&w| w == 0.0));
    }
}
