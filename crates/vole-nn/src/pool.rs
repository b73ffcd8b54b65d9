// AvgPoolND — N-dimensional average pooling
//
// Parameter-free spatial down-sampling: each output element is the mean of
// a kernel window. The divisor is the full kernel volume, so padding
// positions count as zeros in the average.

use vole_core::error::{Error, Result};
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

use crate::layer::Layer;

/// N-dimensional average pooling over `[batch, channels, spatial...]`.
pub struct AvgPoolND {
    kernel: Vec<usize>,
    stride: Vec<usize>,
    padding: Vec<usize>,
    last_input_shape: Option<Shape>,
}

impl AvgPoolND {
    pub fn new(kernel: Vec<usize>, stride: Vec<usize>, padding: Vec<usize>) -> Result<Self> {
        if kernel.is_empty() {
            return Err(Error::config(
                "AvgPoolND: at least one spatial dimension is required",
            ));
        }
        if stride.len() != kernel.len() || padding.len() != kernel.len() {
            return Err(Error::config(
                "AvgPoolND: kernel/stride/padding must have equal lengths",
            ));
        }
        if kernel.iter().any(|&k| k == 0) || stride.iter().any(|&s| s == 0) {
            return Err(Error::config("AvgPoolND: kernel and stride must be > 0"));
        }
        Ok(AvgPoolND {
            kernel,
            stride,
            padding,
            last_input_shape: None,
        })
    }

    fn output_spatial(&self, x: &Tensor) -> Result<Vec<usize>> {
        let dims = self.kernel.len();
        if x.rank() != 2 + dims {
            return Err(Error::RankMismatch {
                expected: 2 + dims,
                got: x.rank(),
            });
        }
        let mut out = vec![0usize; dims];
        for d in 0..dims {
            let padded = x.dims()[2 + d] + 2 * self.padding[d];
            if padded < self.kernel[d] {
                return Err(Error::Msg(format!(
                    "AvgPoolND: kernel {} exceeds padded input {} in spatial dim {}",
                    self.kernel[d], padded, d
                )));
            }
            out[d] = (padded - self.kernel[d]) / self.stride[d] + 1;
        }
        Ok(out)
    }

    /// Walk the kernel window of one output position, yielding the flat
    /// input offset of each in-bounds tap.
    fn window_offsets(
        &self,
        idx_out: &[usize],
        in_spatial: &[usize],
        kernel_shape: &Shape,
    ) -> Vec<usize> {
        let dims = self.kernel.len();
        let in_vol: usize = in_spatial.iter().product::<usize>().max(1);
        let mut offsets = Vec::new();
        for kf in 0..kernel_shape.elem_count() {
            let kpos = kernel_shape.unravel(kf);
            let mut inside = true;
            let mut flat = 0usize;
            let mut stride_acc = in_vol;
            for d in 0..dims {
                let pos = idx_out[2 + d] as isize * self.stride[d] as isize + kpos[d] as isize
                    - self.padding[d] as isize;
                if pos < 0 || pos >= in_spatial[d] as isize {
                    inside = false;
                    break;
                }
                stride_acc /= in_spatial[d];
                flat += pos as usize * stride_acc;
            }
            if inside {
                offsets.push(flat);
            }
        }
        offsets
    }
}

impl Layer for AvgPoolND {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let out_spatial = self.output_spatial(input)?;
        self.last_input_shape = Some(input.shape().clone());

        let (batch, channels) = (input.dims()[0], input.dims()[1]);
        let mut out_dims = vec![batch, channels];
        out_dims.extend_from_slice(&out_spatial);
        let mut out = Tensor::zeros(out_dims);

        let kernel_shape = Shape::new(self.kernel.clone());
        let kernel_vol = kernel_shape.elem_count() as f64;
        let in_spatial: Vec<usize> = input.dims()[2..].to_vec();
        let in_vol: usize = in_spatial.iter().product::<usize>().max(1);

        let x = input.data();
        let out_shape = out.shape().clone();
        let o = out.data_mut();
        for p in 0..o.len() {
            let idx_out = out_shape.unravel(p);
            let base = (idx_out[0] * channels + idx_out[1]) * in_vol;
            let mut sum = 0.0;
            for off in self.window_offsets(&idx_out, &in_spatial, &kernel_shape) {
                sum += x[base + off];
            }
            o[p] = sum / kernel_vol;
        }
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let in_shape = self
            .last_input_shape
            .take()
            .ok_or(Error::MissingState { layer: "AvgPoolND" })?;
        let mut grad_in = Tensor::zeros(in_shape.clone());

        let kernel_shape = Shape::new(self.kernel.clone());
        let kernel_vol = kernel_shape.elem_count() as f64;
        let channels = in_shape.dims()[1];
        let in_spatial: Vec<usize> = in_shape.dims()[2..].to_vec();
        let in_vol: usize = in_spatial.iter().product::<usize>().max(1);

        let g = grad_out.data();
        let gi = grad_in.data_mut();
        for p in 0..g.len() {
            let idx_out = grad_out.shape().unravel(p);
            let base = (idx_out[0] * channels + idx_out[1]) * in_vol;
            let spread = g[p] / kernel_vol;
            for off in self.window_offsets(&idx_out, &in_spatial, &kernel_shape) {
                gi[base + off] += spread;
            }
        }
        Ok(grad_in)
    }
}
