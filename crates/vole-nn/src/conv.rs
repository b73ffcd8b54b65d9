// ConvND & ConvTransposeND — N-dimensional (de)convolution
//
// The number of spatial dimensions is a runtime parameter: the same layer
// type handles 1-D signals, 2-D images, and 3-D volumes. Instead of nested
// loops of compile-time depth (or the hand-rolled counter stacks such code
// often grows), both layers run a single flat pass over the output (and
// kernel) volume and decode each flat position into coordinates through the
// strides mechanism — `Shape::unravel` is the inner loop of everything here.
//
// SHAPES:
//
//   ConvND           input  [batch, inC,  s0, s1, ...]
//                    weight [outC,  inC,  k0, k1, ...]
//                    output [batch, outC, o0, o1, ...]
//                    o_i = (s_i + 2*pad_i - k_i) / stride_i + 1
//
//   ConvTransposeND  input  [batch, inC,  s0, s1, ...]
//                    weight [inC,   outC, k0, k1, ...]
//                    output [batch, outC, o0, o1, ...]
//                    o_i = (s_i - 1) * stride_i - 2*pad_i + k_i
//
// Out-of-bounds kernel taps are implicit zero padding: skipped on read in
// ConvND, skipped on write in ConvTransposeND. Backward passes
// scatter-accumulate into zero-initialized buffers, because with
// stride < kernel several output positions touch the same input element.

use vole_core::error::{Error, Result};
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

use crate::init;
use crate::layer::{Layer, Param};

/// Validate the kernel/stride/padding triple shared by both conv layers.
fn check_spatial_config(
    name: &str,
    kernel: &[usize],
    stride: &[usize],
    padding: &[usize],
) -> Result<()> {
    if kernel.is_empty() {
        return Err(Error::config(format!(
            "{name}: at least one spatial dimension is required"
        )));
    }
    if stride.len() != kernel.len() || padding.len() != kernel.len() {
        return Err(Error::config(format!(
            "{name}: kernel/stride/padding must have equal lengths, got {}/{}/{}",
            kernel.len(),
            stride.len(),
            padding.len()
        )));
    }
    if kernel.iter().any(|&k| k == 0) {
        return Err(Error::config(format!("{name}: kernel dims must be > 0")));
    }
    if stride.iter().any(|&s| s == 0) {
        return Err(Error::config(format!("{name}: stride dims must be > 0")));
    }
    Ok(())
}

/// Check an input tensor is [batch, channels, spatial...] with the expected
/// channel count and spatial rank.
fn check_input_shape(name: &str, x: &Tensor, channels: usize, spatial_dims: usize) -> Result<()> {
    if x.rank() != 2 + spatial_dims {
        return Err(Error::RankMismatch {
            expected: 2 + spatial_dims,
            got: x.rank(),
        });
    }
    if x.dims()[1] != channels {
        return Err(Error::Msg(format!(
            "{name}: expected {} input channels, got input shape {}",
            channels,
            x.shape()
        )));
    }
    Ok(())
}

// ConvND

/// N-dimensional convolution with implicit zero padding.
///
/// # Examples
/// ```ignore
/// // 2-D: 3 input channels, 8 filters, 3x3 kernel, stride 1, pad 1
/// let mut conv = ConvND::new(3, 8, vec![3, 3], vec![1, 1], vec![1, 1])?;
/// let y = conv.forward(&x)?; // [batch, 8, H, W]
/// ```
pub struct ConvND {
    in_channels: usize,
    out_channels: usize,
    kernel: Vec<usize>,
    stride: Vec<usize>,
    padding: Vec<usize>,
    /// Filters: [outC, inC, k...]
    weight: Tensor,
    /// Bias: [outC]
    bias: Tensor,
    d_weight: Tensor,
    d_bias: Tensor,
    last_input: Option<Tensor>,
}

impl ConvND {
    /// Create a new ConvND layer.
    ///
    /// Rejects zero-sized kernels/strides and mismatched spatial lengths at
    /// construction time.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: Vec<usize>,
        stride: Vec<usize>,
        padding: Vec<usize>,
    ) -> Result<Self> {
        check_spatial_config("ConvND", &kernel, &stride, &padding)?;
        if in_channels == 0 || out_channels == 0 {
            return Err(Error::config("ConvND: channel counts must be > 0"));
        }

        let mut w_dims = vec![out_channels, in_channels];
        w_dims.extend_from_slice(&kernel);
        let fan_in = in_channels * kernel.iter().product::<usize>();

        Ok(ConvND {
            in_channels,
            out_channels,
            weight: init::scaled_uniform(w_dims.clone(), fan_in),
            bias: Tensor::zeros(out_channels),
            d_weight: Tensor::zeros(w_dims),
            d_bias: Tensor::zeros(out_channels),
            kernel,
            stride,
            padding,
            last_input: None,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Output spatial size per dim: (in + 2*pad - kernel) / stride + 1.
    fn output_spatial(&self, x: &Tensor) -> Result<Vec<usize>> {
        let dims = self.kernel.len();
        let mut out = vec![0usize; dims];
        for d in 0..dims {
            let in_size = x.dims()[2 + d];
            let padded = in_size + 2 * self.padding[d];
            if padded < self.kernel[d] {
                return Err(Error::Msg(format!(
                    "ConvND: kernel {} exceeds padded input {} in spatial dim {}",
                    self.kernel[d], padded, d
                )));
            }
            out[d] = (padded - self.kernel[d]) / self.stride[d] + 1;
        }
        Ok(out)
    }
}

impl Layer for ConvND {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let dims = self.kernel.len();
        check_input_shape("ConvND", input, self.in_channels, dims)?;
        let out_spatial = self.output_spatial(input)?;
        self.last_input = Some(input.clone());

        let batch = input.dims()[0];
        let mut out_dims = vec![batch, self.out_channels];
        out_dims.extend_from_slice(&out_spatial);
        let mut out = Tensor::zeros(out_dims);

        let kernel_shape = Shape::new(self.kernel.clone());
        let kernel_vol = kernel_shape.elem_count();
        let in_spatial: Vec<usize> = input.dims()[2..].to_vec();
        let in_vol = spatial_volume(&in_spatial);

        let x = input.data();
        let w = self.weight.data();
        let b = self.bias.data();

        // One flat pass over every output element; coordinates are decoded
        // from the flat position instead of nesting runtime-depth loops.
        let out_shape = out.shape().clone();
        let o = out.data_mut();
        for p in 0..o.len() {
            let idx_out = out_shape.unravel(p);
            let (bi, oc) = (idx_out[0], idx_out[1]);
            let mut sum = b[oc];

            for ic in 0..self.in_channels {
                for kf in 0..kernel_vol {
                    let kpos = kernel_shape.unravel(kf);
                    // Input coordinate for this kernel tap; taps landing
                    // outside the input are the implicit zero padding.
                    let mut inside = true;
                    let mut x_flat = (bi * self.in_channels + ic) * in_vol;
                    let mut stride_acc = in_vol;
                    for d in 0..dims {
                        let pos = idx_out[2 + d] as isize * self.stride[d] as isize
                            + kpos[d] as isize
                            - self.padding[d] as isize;
                        if pos < 0 || pos >= in_spatial[d] as isize {
                            inside = false;
                            break;
                        }
                        stride_acc /= in_spatial[d];
                        x_flat += pos as usize * stride_acc;
                    }
                    if inside {
                        let w_flat = ((oc * self.in_channels) + ic) * kernel_vol + kf;
                        sum += w[w_flat] * x[x_flat];
                    }
                }
            }
            o[p] = sum;
        }
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "ConvND" })?;
        let dims = self.kernel.len();
        let out_spatial = self.output_spatial(&x)?;
        let batch = x.dims()[0];
        let mut expected_dims = vec![batch, self.out_channels];
        expected_dims.extend_from_slice(&out_spatial);
        let expected = Shape::new(expected_dims);
        if grad_out.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: grad_out.shape().clone(),
            });
        }

        self.d_weight.zero();
        self.d_bias.zero();
        let mut grad_in = Tensor::zeros(x.shape().clone());

        let kernel_shape = Shape::new(self.kernel.clone());
        let kernel_vol = kernel_shape.elem_count();
        let in_spatial = x.dims()[2..].to_vec();
        let in_vol = spatial_volume(&in_spatial);

        let xs = x.data();
        let w = self.weight.data();
        let g = grad_out.data();
        let dw = self.d_weight.data_mut();
        let db = self.d_bias.data_mut();
        let gi = grad_in.data_mut();

        // Scatter from every output-gradient element. Multiple output
        // positions can touch the same input element (stride < kernel), so
        // everything accumulates into zeroed buffers.
        for p in 0..g.len() {
            let idx_out = grad_out.shape().unravel(p);
            let (bi, oc) = (idx_out[0], idx_out[1]);
            let grad = g[p];

            // dB picks up the gradient once per output element.
            db[oc] += grad;

            for ic in 0..self.in_channels {
                for kf in 0..kernel_vol {
                    let kpos = kernel_shape.unravel(kf);
                    let mut inside = true;
                    let mut x_flat = (bi * self.in_channels + ic) * in_vol;
                    let mut stride_acc = in_vol;
                    for d in 0..dims {
                        let pos = idx_out[2 + d] as isize * self.stride[d] as isize
                            + kpos[d] as isize
                            - self.padding[d] as isize;
                        if pos < 0 || pos >= in_spatial[d] as isize {
                            inside = false;
                            break;
                        }
                        stride_acc /= in_spatial[d];
                        x_flat += pos as usize * stride_acc;
                    }
                    if inside {
                        let w_flat = ((oc * self.in_channels) + ic) * kernel_vol + kf;
                        dw[w_flat] += grad * xs[x_flat];
                        gi[x_flat] += grad * w[w_flat];
                    }
                }
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.weight,
                grad: &self.d_weight,
            },
            Param {
                value: &mut self.bias,
                grad: &self.d_bias,
            },
        ]
    }
}

fn spatial_volume(spatial: &[usize]) -> usize {
    spatial.iter().product::<usize>().max(1)
}

// ConvTransposeND

/// N-dimensional transposed (fractionally-strided) convolution.
///
/// The forward pass scatters each input element across its kernel footprint
/// into a larger output — the adjoint of ConvND's gather.
pub struct ConvTransposeND {
    in_channels: usize,
    out_channels: usize,
    kernel: Vec<usize>,
    stride: Vec<usize>,
    padding: Vec<usize>,
    /// Filters: [inC, outC, k...]
    weight: Tensor,
    /// Bias: [outC]
    bias: Tensor,
    d_weight: Tensor,
    d_bias: Tensor,
    last_input: Option<Tensor>,
}

impl ConvTransposeND {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: Vec<usize>,
        stride: Vec<usize>,
        padding: Vec<usize>,
    ) -> Result<Self> {
        check_spatial_config("ConvTransposeND", &kernel, &stride, &padding)?;
        if in_channels == 0 || out_channels == 0 {
            return Err(Error::config("ConvTransposeND: channel counts must be > 0"));
        }

        let mut w_dims = vec![in_channels, out_channels];
        w_dims.extend_from_slice(&kernel);
        let fan_in = in_channels * kernel.iter().product::<usize>();

        Ok(ConvTransposeND {
            in_channels,
            out_channels,
            weight: init::scaled_uniform(w_dims.clone(), fan_in),
            bias: Tensor::zeros(out_channels),
            d_weight: Tensor::zeros(w_dims),
            d_bias: Tensor::zeros(out_channels),
            kernel,
            stride,
            padding,
            last_input: None,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Output spatial size per dim: (in - 1) * stride - 2*pad + kernel.
    fn output_spatial(&self, x: &Tensor) -> Result<Vec<usize>> {
        let dims = self.kernel.len();
        let mut out = vec![0usize; dims];
        for d in 0..dims {
            let in_size = x.dims()[2 + d];
            if in_size == 0 {
                return Err(Error::Msg(format!(
                    "ConvTransposeND: empty spatial dim {}",
                    d
                )));
            }
            let grown = (in_size - 1) * self.stride[d] + self.kernel[d];
            let trim = 2 * self.padding[d];
            if grown <= trim {
                return Err(Error::Msg(format!(
                    "ConvTransposeND: padding {} swallows the whole output in spatial dim {}",
                    self.padding[d], d
                )));
            }
            out[d] = grown - trim;
        }
        Ok(out)
    }
}

impl Layer for ConvTransposeND {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let dims = self.kernel.len();
        check_input_shape("ConvTransposeND", input, self.in_channels, dims)?;
        let out_spatial = self.output_spatial(input)?;
        self.last_input = Some(input.clone());

        let batch = input.dims()[0];
        let mut out_dims = vec![batch, self.out_channels];
        out_dims.extend_from_slice(&out_spatial);
        let mut out = Tensor::zeros(out_dims);

        let kernel_shape = Shape::new(self.kernel.clone());
        let kernel_vol = kernel_shape.elem_count();
        let out_vol = spatial_volume(&out_spatial);

        let x = input.data();
        let w = self.weight.data();

        let in_shape = input.shape().clone();
        let o = out.data_mut();

        // Scatter: every input element spreads over its kernel footprint.
        for p in 0..x.len() {
            let idx_in = in_shape.unravel(p);
            let (bi, ic) = (idx_in[0], idx_in[1]);
            let xv = x[p];

            for kf in 0..kernel_vol {
                let kpos = kernel_shape.unravel(kf);
                let mut inside = true;
                let mut o_base = bi * self.out_channels * out_vol;
                let mut stride_acc = out_vol;
                for d in 0..dims {
                    let pos = idx_in[2 + d] as isize * self.stride[d] as isize
                        - self.padding[d] as isize
                        + kpos[d] as isize;
                    if pos < 0 || pos >= out_spatial[d] as isize {
                        inside = false;
                        break;
                    }
                    stride_acc /= out_spatial[d];
                    o_base += pos as usize * stride_acc;
                }
                if inside {
                    for oc in 0..self.out_channels {
                        let w_flat = ((ic * self.out_channels) + oc) * kernel_vol + kf;
                        o[o_base + oc * out_vol] += xv * w[w_flat];
                    }
                }
            }
        }

        // Bias is added once over the whole output, after the scatter.
        let b = self.bias.data();
        for (q, v) in o.iter_mut().enumerate() {
            let oc = (q / out_vol) % self.out_channels;
            *v += b[oc];
        }
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState {
                layer: "ConvTransposeND",
            })?;
        let dims = self.kernel.len();
        let out_spatial = self.output_spatial(&x)?;
        let batch = x.dims()[0];
        let mut expected_dims = vec![batch, self.out_channels];
        expected_dims.extend_from_slice(&out_spatial);
        let expected = Shape::new(expected_dims);
        if grad_out.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: grad_out.shape().clone(),
            });
        }

        self.d_weight.zero();
        self.d_bias.zero();
        let mut grad_in = Tensor::zeros(x.shape().clone());

        let kernel_shape = Shape::new(self.kernel.clone());
        let kernel_vol = kernel_shape.elem_count();
        let out_vol = spatial_volume(&out_spatial);

        let xs = x.data();
        let w = self.weight.data();
        let g = grad_out.data();
        let dw = self.d_weight.data_mut();
        let db = self.d_bias.data_mut();
        let gi = grad_in.data_mut();

        // dB: plain sum of the output gradient per out-channel.
        for (q, &gv) in g.iter().enumerate() {
            let oc = (q / out_vol) % self.out_channels;
            db[oc] += gv;
        }

        // Walk the same scatter footprint as forward: dW gathers
        // input * gradOut, dX gathers weight * gradOut.
        let in_shape = x.shape().clone();
        for p in 0..xs.len() {
            let idx_in = in_shape.unravel(p);
            let (bi, ic) = (idx_in[0], idx_in[1]);

            for kf in 0..kernel_vol {
                let kpos = kernel_shape.unravel(kf);
                let mut inside = true;
                let mut o_base = bi * self.out_channels * out_vol;
                let mut stride_acc = out_vol;
                for d in 0..dims {
                    let pos = idx_in[2 + d] as isize * self.stride[d] as isize
                        - self.padding[d] as isize
                        + kpos[d] as isize;
                    if pos < 0 || pos >= out_spatial[d] as isize {
                        inside = false;
                        break;
                    }
                    stride_acc /= out_spatial[d];
                    o_base += pos as usize * stride_acc;
                }
                if inside {
                    for oc in 0..self.out_channels {
                        let w_flat = ((ic * self.out_channels) + oc) * kernel_vol + kf;
                        let go = g[o_base + oc * out_vol];
                        dw[w_flat] += xs[p] * go;
                        gi[p] += w[w_flat] * go;
                    }
                }
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.weight,
                grad: &self.d_weight,
            },
            Param {
                value: &mut self.bias,
                grad: &self.d_bias,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_output_shape_2d() {
        let mut conv = ConvND::new(1, 2, vec![3, 3], vec![1, 1], vec![1, 1]).unwrap();
        let x = Tensor::zeros((1, 1, 5, 5));
        let y = conv.forward(&x).unwrap();
        // Same padding: (5 + 2 - 3)/1 + 1 = 5
        assert_eq!(y.dims(), &[1, 2, 5, 5]);
    }

    #[test]
    fn test_conv_1d_known_values() {
        // kernel [1, 2], no padding, stride 1 over [1, 2, 3]
        let mut conv = ConvND::new(1, 1, vec![2], vec![1], vec![0]).unwrap();
        // Overwrite the random weight with a known one
        conv.weight = Tensor::from_vec(vec![1.0, 2.0], (1, 1, 2)).unwrap();
        conv.bias = Tensor::from_vec(vec![0.5], (1,)).unwrap();

        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], (1, 1, 3)).unwrap();
        let y = conv.forward(&x).unwrap();
        // [1*1+2*2+0.5, 2*1+3*2+0.5] = [5.5, 8.5]
        assert_eq!(y.dims(), &[1, 1, 2]);
        assert_eq!(y.data(), &[5.5, 8.5]);
    }

    #[test]
    fn test_conv_backward_accumulates() {
        let mut conv = ConvND::new(1, 1, vec![2], vec![1], vec![0]).unwrap();
        conv.weight = Tensor::from_vec(vec![1.0, 2.0], (1, 1, 2)).unwrap();
        conv.bias = Tensor::zeros(1);

        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], (1, 1, 3)).unwrap();
        conv.forward(&x).unwrap();
        let g = Tensor::ones((1, 1, 2));
        let dx = conv.backward(&g).unwrap();

        // dB = 2 output elements
        assert_eq!(conv.d_bias.data(), &[2.0]);
        // dW[k] = Σ_p g * x[p + k] = [1+2, 2+3] = [3, 5]
        assert_eq!(conv.d_weight.data(), &[3.0, 5.0]);
        // dX: middle element is touched by both output positions
        assert_eq!(dx.data(), &[1.0, 3.0, 2.0]);
    }

    #[test]
    fn test_conv_invalid_config_rejected() {
        assert!(ConvND::new(1, 1, vec![], vec![], vec![]).is_err());
        assert!(ConvND::new(1, 1, vec![3], vec![0], vec![0]).is_err());
        assert!(ConvND::new(1, 1, vec![3, 3], vec![1], vec![1, 1]).is_err());
        assert!(ConvND::new(1, 1, vec![0], vec![1], vec![0]).is_err());
    }

    #[test]
    fn test_conv_3d_shape() {
        let mut conv = ConvND::new(2, 3, vec![2, 2, 2], vec![1, 1, 1], vec![0, 0, 0]).unwrap();
        let x = Tensor::zeros((1, 2, 4, 4, 4));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 3, 3, 3, 3]);
    }

    #[test]
    fn test_conv_transpose_output_shape() {
        let mut conv = ConvTransposeND::new(1, 1, vec![3, 3], vec![2, 2], vec![0, 0]).unwrap();
        let x = Tensor::zeros((1, 1, 4, 4));
        let y = conv.forward(&x).unwrap();
        // (4-1)*2 + 3 = 9
        assert_eq!(y.dims(), &[1, 1, 9, 9]);
    }

    #[test]
    fn test_conv_transpose_1d_known_values() {
        let mut conv = ConvTransposeND::new(1, 1, vec![2], vec![1], vec![0]).unwrap();
        conv.weight = Tensor::from_vec(vec![1.0, 2.0], (1, 1, 2)).unwrap();
        conv.bias = Tensor::zeros(1);

        let x = Tensor::from_vec(vec![1.0, 2.0], (1, 1, 2)).unwrap();
        let y = conv.forward(&x).unwrap();
        // scatter: out[0] = 1*1; out[1] = 1*2 + 2*1; out[2] = 2*2
        assert_eq!(y.dims(), &[1, 1, 3]);
        assert_eq!(y.data(), &[1.0, 4.0, 4.0]);
    }

    #[test]
    fn test_conv_transpose_inverts_conv_shape() {
        // ConvTransposeND undoes ConvND's spatial shrink for matching configs
        let mut conv = ConvND::new(1, 1, vec![3], vec![2], vec![1]).unwrap();
        let mut deconv = ConvTransposeND::new(1, 1, vec![3], vec![2], vec![1]).unwrap();
        let x = Tensor::zeros((1, 1, 7));
        let y = conv.forward(&x).unwrap();
        let z = deconv.forward(&y).unwrap();
        assert_eq!(z.dims(), x.dims());
    }
}
