//! Neural Network inference.

use std::{ops::Index, path::Path, sync::Arc};

use anyhow::{bail, Context};
use image::RgbImage;
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, Tensor, TypedFact, TypedOp,
};

use crate::{rect::Rect, resolution::Resolution};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// A neural network that can be used for inference.
///
/// This is a cheaply [`Clone`]able handle to the underlying network structures.
#[derive(Clone)]
pub struct NeuralNetwork(Arc<NeuralNetworkImpl>);

struct NeuralNetworkImpl {
    inner: Model,
    input_shape: Vec<usize>,
}

impl NeuralNetwork {
    /// Loads a pre-trained model from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_path_impl(path.as_ref())
    }

    fn from_path_impl(path: &Path) -> anyhow::Result<Self> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!(
                "neural network file must have `.onnx` extension: {}",
                path.display()
            ),
        }

        let model_data =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_onnx(&model_data)
    }

    /// Loads and optimizes a pre-trained model from an in-memory ONNX file.
    ///
    /// Returns an error if the network data is malformed, if the network uses unimplemented
    /// operations, or if it does not have exactly one input of a fixed shape.
    pub fn from_onnx(raw: &[u8]) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*raw)?
            .into_optimized()?;
        let outputs = graph.output_outlets()?.to_vec();
        let inner = SimplePlan::new_for_outputs(graph, &outputs)?;

        let model = inner.model();
        if model.inputs.len() != 1 {
            bail!(
                "network has to take exactly 1 input, this one takes {}",
                model.inputs.len(),
            );
        }
        let fact = model.input_fact(0)?;
        let Some(shape) = fact.shape.as_concrete() else {
            bail!("symbolic network input shape {:?} is not supported", fact.shape);
        };
        let input_shape = shape.to_vec();

        Ok(Self(Arc::new(NeuralNetworkImpl { inner, input_shape })))
    }

    /// Returns the tensor shape of the network's only input.
    pub fn input_shape(&self) -> &[usize] {
        &self.0.input_shape
    }

    /// Returns the number of output nodes of the network.
    pub fn num_outputs(&self) -> usize {
        self.0.inner.model().outputs.len()
    }

    /// Runs the network on an input tensor of shape [`NeuralNetwork::input_shape`].
    #[doc(alias = "infer")]
    pub fn estimate(&self, input: &[f32]) -> anyhow::Result<Outputs> {
        let tensor = Tensor::from_shape(self.input_shape(), input)?;
        let outputs = self
            .0
            .inner
            .run(tvec![TValue::from_const(Arc::new(tensor))])?;

        let inner = outputs
            .iter()
            .map(|value| {
                let view = value.to_array_view::<f32>()?;
                Ok(Output {
                    shape: view.shape().to_vec(),
                    data: view.iter().copied().collect(),
                })
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(Outputs { inner })
    }
}

/// Describes in what order a CNN expects its input image data.
///
/// - `N` is the number of images, fixed at 1.
/// - `C` is the number of color channels, 3 for RGB inputs.
/// - `H` and `W` are the height and width of the input, respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnnInputShape {
    /// Shape is `[N, C, H, W]`.
    NCHW,
    /// Shape is `[N, H, W, C]`.
    NHWC,
}

/// A convolutional neural network (CNN) that operates on RGB image data.
///
/// The input layout is detected from the network's input shape. Color values are mapped linearly
/// from `0..=255` to `0.0..=1.0`.
#[derive(Clone)]
pub struct Cnn {
    nn: NeuralNetwork,
    shape: CnnInputShape,
    input_res: Resolution,
}

impl Cnn {
    /// Creates a CNN wrapper from a [`NeuralNetwork`].
    pub fn new(nn: NeuralNetwork) -> anyhow::Result<Self> {
        let (shape, w, h) = match *nn.input_shape() {
            [1, 3, h, w] => (CnnInputShape::NCHW, w, h),
            [1, h, w, 3] => (CnnInputShape::NHWC, w, h),
            ref other => bail!("invalid CNN input shape: {:?}", other),
        };
        let (w, h): (u32, u32) = (w.try_into()?, h.try_into()?);

        Ok(Self {
            nn,
            shape,
            input_res: Resolution::new(w, h),
        })
    }

    /// Returns the expected input image size.
    #[inline]
    pub fn input_resolution(&self) -> Resolution {
        self.input_res
    }

    /// Runs the network on the area of `image` covered by `rect`.
    ///
    /// `rect` is sampled to fill the network input. Parts of `rect` that lie outside of `image`
    /// are filled with black. If the aspect ratio of `rect` does not match the network's input,
    /// the image will be stretched.
    pub fn estimate(&self, image: &RgbImage, rect: Rect) -> anyhow::Result<Outputs> {
        let input = image_to_tensor(image, rect, self.shape, self.input_res);
        self.nn.estimate(&input)
    }
}

fn image_to_tensor(
    image: &RgbImage,
    rect: Rect,
    shape: CnnInputShape,
    res: Resolution,
) -> Vec<f32> {
    let (w, h) = (res.width() as usize, res.height() as usize);
    let mut data = vec![0.0; w * h * 3];

    for y in 0..h {
        for x in 0..w {
            let [px, py] =
                rect.transform_out((x as f32 + 0.5) / w as f32, (y as f32 + 0.5) / h as f32);
            let rgb = if px < 0.0 || py < 0.0 {
                [0; 3]
            } else {
                let (px, py) = (px as u32, py as u32);
                if px < image.width() && py < image.height() {
                    image.get_pixel(px, py).0
                } else {
                    [0; 3]
                }
            };

            for (c, value) in rgb.into_iter().enumerate() {
                let index = match shape {
                    CnnInputShape::NCHW => c * w * h + y * w + x,
                    CnnInputShape::NHWC => (y * w + x) * 3 + c,
                };
                data[index] = f32::from(value) / 255.0;
            }
        }
    }

    data
}

/// A single output tensor, flattened in row-major order.
#[derive(Debug)]
pub struct Output {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Output {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// The result of a neural network inference pass.
///
/// This is a list of tensors corresponding to the network's output nodes.
#[derive(Debug)]
pub struct Outputs {
    inner: Vec<Output>,
}

impl FromIterator<Output> for Outputs {
    fn from_iter<T: IntoIterator<Item = Output>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl Outputs {
    /// Returns the number of tensors in this inference output.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Index<usize> for Outputs {
    type Output = Output;

    fn index(&self, index: usize) -> &Output {
        &self.inner[index]
    }
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn test_image() -> RgbImage {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 255, 0]));
        image.put_pixel(0, 1, Rgb([0, 0, 255]));
        image.put_pixel(1, 1, Rgb([255, 255, 255]));
        image
    }

    #[test]
    fn tensor_layout_nchw() {
        let rect = Rect::from_top_left(0.0, 0.0, 2.0, 2.0);
        let data = image_to_tensor(
            &test_image(),
            rect,
            CnnInputShape::NCHW,
            Resolution::new(2, 2),
        );
        // red plane, then green, then blue
        assert_eq!(&data[0..4], &[1.0, 0.0, 0.0, 1.0]);
        assert_eq!(&data[4..8], &[0.0, 1.0, 0.0, 1.0]);
        assert_eq!(&data[8..12], &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn tensor_layout_nhwc() {
        let rect = Rect::from_top_left(0.0, 0.0, 2.0, 2.0);
        let data = image_to_tensor(
            &test_image(),
            rect,
            CnnInputShape::NHWC,
            Resolution::new(2, 2),
        );
        assert_eq!(&data[0..3], &[1.0, 0.0, 0.0]);
        assert_eq!(&data[3..6], &[0.0, 1.0, 0.0]);
        assert_eq!(&data[9..12], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn outside_of_image_is_black() {
        // Only the bottom right quadrant of the rect overlaps the image.
        let rect = Rect::from_top_left(-2.0, -2.0, 4.0, 4.0);
        let data = image_to_tensor(
            &test_image(),
            rect,
            CnnInputShape::NHWC,
            Resolution::new(2, 2),
        );
        assert_eq!(&data[0..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&data[3..6], &[0.0, 0.0, 0.0]);
        assert_eq!(&data[9..12], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn rejects_non_onnx_path() {
        let err = NeuralNetwork::from_path("model.tflite").err().unwrap();
        assert!(err.to_string().contains(".onnx"));
    }
}
