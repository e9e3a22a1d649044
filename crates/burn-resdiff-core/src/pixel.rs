//! Pixel range conversions
//!
//! Images enter the engine in `[0, 1]`, are processed in `[-1, 1]`, and leave
//! in `[0, 1]` again.

use burn::prelude::*;

/// Maps `[0, 1]` to `[-1, 1]`
pub fn normalize_to_neg_one_to_one<B: Backend, const D: usize>(img: Tensor<B, D>) -> Tensor<B, D> {
    img.mul_scalar(2.0).sub_scalar(1.0)
}

/// Maps `[-1, 1]` to `[0, 1]`
pub fn unnormalize_to_zero_to_one<B: Backend, const D: usize>(img: Tensor<B, D>) -> Tensor<B, D> {
    img.add_scalar(1.0).mul_scalar(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_range_conversions() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 1>::from_floats([0.0, 0.25, 1.0], &device);

        let normalized = normalize_to_neg_one_to_one(img.clone());
        assert_eq!(normalized.clone().into_data().to_vec::<f32>().unwrap(), vec![-1.0, -0.5, 1.0]);

        let restored = unnormalize_to_zero_to_one(normalized);
        assert_eq!(
            restored.into_data().to_vec::<f32>().unwrap(),
            img.into_data().to_vec::<f32>().unwrap()
        );
    }
}
