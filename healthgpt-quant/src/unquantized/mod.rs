use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Linear, Module};

use crate::QuantMethod;

/// Plain full precision linear layer. Weights are detached on construction.
#[derive(Debug, Clone)]
pub struct UnquantLinear(Linear);

impl UnquantLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self(Linear::new(weight.detach(), bias.map(|b| b.detach())))
    }
}

impl QuantMethod for UnquantLinear {
    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        self.0.forward(a)
    }

    fn quantized_act_type(&self) -> Option<DType> {
        None
    }

    fn dtype_and_device(&self) -> (DType, Device) {
        (self.0.weight().dtype(), self.0.weight().device().clone())
    }

    fn dims(&self) -> (usize, usize) {
        let dims = self.0.weight().dims();
        (dims[0], dims[1])
    }

    fn unquant_weight_bias(&self) -> Option<(Tensor, Option<Tensor>)> {
        Some((self.0.weight().clone(), self.0.bias().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::UnquantLinear;
    use crate::QuantMethod;

    #[test]
    fn forward_matches_matmul() {
        let dev = Device::Cpu;
        let w = Tensor::arange(0f32, 6f32, &dev).unwrap().reshape((2, 3)).unwrap();
        let layer = UnquantLinear::new(w.clone(), None);
        let x = Tensor::ones((1, 4, 3), DType::F32, &dev).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 4, 2]);
        let row = y.get(0).unwrap().get(0).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(row, vec![3.0, 12.0]);
        assert_eq!(layer.dims(), (2, 3));
    }
}
