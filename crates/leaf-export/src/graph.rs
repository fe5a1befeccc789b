//! Conversion of a trained MobileNetV3-Small into a static ONNX inference graph.
//!
//! Batch norm is folded into the preceding convolution, dropout is dropped and
//! hard-swish becomes `HardSigmoid` followed by `Mul`.

use burn::nn::{conv::Conv2d, Linear};
use burn::tensor::{backend::Backend, Tensor};
use leaf_core::{Error, Result};
use leaf_training::model::{
    ConvBn, InvertedResidual, MobileNetV3Small, SqueezeExcitation, HARD_SIGMOID_ALPHA,
    HARD_SIGMOID_BETA, MOBILENET_V3_SMALL_BLOCKS,
};

use crate::onnx::{AttributeProto, GraphProto, NodeProto, TensorProto, ValueInfoProto};

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
pub const BATCH_PARAM: &str = "batch_size";

/// Convolution parameters after batch-norm folding
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedConv {
    /// `[out, in / groups, kh, kw]`
    pub dims: [usize; 4],
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Export(format!("Failed to read tensor data: {e:?}")))
}

/// Folds `bn` into `conv`:
/// `w' = w * gamma / sqrt(var + eps)`, `b' = beta - mean * gamma / sqrt(var + eps)`.
pub fn fold_batch_norm<B: Backend>(layer: &ConvBn<B>) -> Result<FoldedConv> {
    let weight = layer.conv.weight.val();
    let dims = weight.dims();
    let mut weight = values(weight)?;

    let bn = &layer.bn;
    let gamma = values(bn.gamma.val())?;
    let beta = values(bn.beta.val())?;
    let mean = values(bn.running_mean.value())?;
    let var = values(bn.running_var.value())?;
    let conv_bias = match &layer.conv.bias {
        Some(bias) => values(bias.val())?,
        None => vec![0.0; dims[0]],
    };

    let per_channel = dims[1] * dims[2] * dims[3];
    let mut bias = Vec::with_capacity(dims[0]);
    for c in 0..dims[0] {
        let scale = gamma[c] / (var[c] + bn.epsilon as f32).sqrt();
        for w in &mut weight[c * per_channel..(c + 1) * per_channel] {
            *w *= scale;
        }
        bias.push(beta[c] + (conv_bias[c] - mean[c]) * scale);
    }

    Ok(FoldedConv { dims, weight, bias })
}

fn plain_conv<B: Backend>(conv: &Conv2d<B>) -> Result<FoldedConv> {
    let weight = conv.weight.val();
    let dims = weight.dims();
    let bias = match &conv.bias {
        Some(bias) => values(bias.val())?,
        None => vec![0.0; dims[0]],
    };
    Ok(FoldedConv {
        dims,
        weight: values(weight)?,
        bias,
    })
}

/// Accumulates nodes and initializers with deterministic names.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    next_id: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, prefix: &str) -> String {
        let name = format!("{prefix}_{}", self.next_id);
        self.next_id += 1;
        name
    }

    fn push(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        attribute: Vec<AttributeProto>,
        output: String,
    ) -> String {
        let name = format!("{op_type}_{}", self.nodes.len());
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            attribute,
        });
        output
    }

    fn node(&mut self, op_type: &str, inputs: Vec<String>, attribute: Vec<AttributeProto>) -> String {
        let output = self.fresh(&op_type.to_lowercase());
        self.push(op_type, inputs, attribute, output)
    }

    fn initializer(&mut self, name: String, dims: &[usize], data: &[f32]) -> String {
        self.initializers.push(TensorProto::float(&name, dims, data));
        name
    }

    pub fn conv(&mut self, prefix: &str, input: &str, conv: &FoldedConv, stride: usize, groups: usize) -> String {
        let [out, _, kh, kw] = conv.dims;
        let weight = self.initializer(format!("{prefix}.weight"), &conv.dims, &conv.weight);
        let bias = self.initializer(format!("{prefix}.bias"), &[out], &conv.bias);
        let (ph, pw) = (((kh - 1) / 2) as i64, ((kw - 1) / 2) as i64);
        self.node(
            "Conv",
            vec![input.to_string(), weight, bias],
            vec![
                AttributeProto::ints("dilations", &[1, 1]),
                AttributeProto::int("group", groups as i64),
                AttributeProto::ints("kernel_shape", &[kh as i64, kw as i64]),
                AttributeProto::ints("pads", &[ph, pw, ph, pw]),
                AttributeProto::ints("strides", &[stride as i64, stride as i64]),
            ],
        )
    }

    pub fn relu(&mut self, input: &str) -> String {
        self.node("Relu", vec![input.to_string()], Vec::new())
    }

    pub fn hard_sigmoid(&mut self, input: &str) -> String {
        self.node(
            "HardSigmoid",
            vec![input.to_string()],
            vec![
                AttributeProto::float("alpha", HARD_SIGMOID_ALPHA as f32),
                AttributeProto::float("beta", HARD_SIGMOID_BETA as f32),
            ],
        )
    }

    pub fn mul(&mut self, lhs: &str, rhs: &str) -> String {
        self.node("Mul", vec![lhs.to_string(), rhs.to_string()], Vec::new())
    }

    pub fn add(&mut self, lhs: &str, rhs: &str) -> String {
        self.node("Add", vec![lhs.to_string(), rhs.to_string()], Vec::new())
    }

    pub fn hard_swish(&mut self, input: &str) -> String {
        let gate = self.hard_sigmoid(input);
        self.mul(input, &gate)
    }

    pub fn global_average_pool(&mut self, input: &str) -> String {
        self.node("GlobalAveragePool", vec![input.to_string()], Vec::new())
    }

    pub fn flatten(&mut self, input: &str) -> String {
        self.node(
            "Flatten",
            vec![input.to_string()],
            vec![AttributeProto::int("axis", 1)],
        )
    }

    /// `input @ weight + bias` with burn's `[in, out]` weight layout.
    pub fn gemm<B: Backend>(&mut self, prefix: &str, input: &str, linear: &Linear<B>, output: Option<&str>) -> Result<String> {
        let weight = linear.weight.val();
        let dims = weight.dims();
        let weight = values(weight)?;
        let bias = match &linear.bias {
            Some(bias) => values(bias.val())?,
            None => vec![0.0; dims[1]],
        };
        let weight = self.initializer(format!("{prefix}.weight"), &dims, &weight);
        let bias = self.initializer(format!("{prefix}.bias"), &[dims[1]], &bias);

        let inputs = vec![input.to_string(), weight, bias];
        let attribute = vec![
            AttributeProto::float("alpha", 1.0),
            AttributeProto::float("beta", 1.0),
            AttributeProto::int("transB", 0),
        ];
        Ok(match output {
            Some(name) => self.push("Gemm", inputs, attribute, name.to_string()),
            None => self.node("Gemm", inputs, attribute),
        })
    }

    pub fn conv_bn<B: Backend>(&mut self, prefix: &str, input: &str, layer: &ConvBn<B>, stride: usize, groups: usize) -> Result<String> {
        let folded = fold_batch_norm(layer)?;
        Ok(self.conv(prefix, input, &folded, stride, groups))
    }

    fn squeeze_excitation<B: Backend>(&mut self, prefix: &str, input: &str, se: &SqueezeExcitation<B>) -> Result<String> {
        let pooled = self.global_average_pool(input);
        let reduced = self.conv(&format!("{prefix}.reduce"), &pooled, &plain_conv(&se.reduce)?, 1, 1);
        let reduced = self.relu(&reduced);
        let expanded = self.conv(&format!("{prefix}.expand"), &reduced, &plain_conv(&se.expand)?, 1, 1);
        let scale = self.hard_sigmoid(&expanded);
        Ok(self.mul(input, &scale))
    }

    fn activate(&mut self, input: &str, hard_swish: bool) -> String {
        if hard_swish {
            self.hard_swish(input)
        } else {
            self.relu(input)
        }
    }

    fn inverted_residual<B: Backend>(
        &mut self,
        prefix: &str,
        input: &str,
        block: &InvertedResidual<B>,
        stride: usize,
    ) -> Result<String> {
        let mut x = input.to_string();
        if let Some(expand) = &block.expand {
            x = self.conv_bn(&format!("{prefix}.expand"), &x, expand, 1, 1)?;
            x = self.activate(&x, block.hard_swish);
        }
        let channels = block.depthwise.conv.weight.val().dims()[0];
        x = self.conv_bn(&format!("{prefix}.depthwise"), &x, &block.depthwise, stride, channels)?;
        x = self.activate(&x, block.hard_swish);
        if let Some(se) = &block.se {
            x = self.squeeze_excitation(&format!("{prefix}.se"), &x, se)?;
        }
        x = self.conv_bn(&format!("{prefix}.project"), &x, &block.project, 1, 1)?;
        if block.use_residual {
            x = self.add(&x, input);
        }
        Ok(x)
    }

    pub fn finish(self, name: &str, inputs: Vec<ValueInfoProto>, outputs: Vec<ValueInfoProto>) -> GraphProto {
        GraphProto {
            node: self.nodes,
            name: name.to_string(),
            initializer: self.initializers,
            doc_string: String::new(),
            input: inputs,
            output: outputs,
        }
    }
}

/// Builds the inference graph for `[batch, 3, S, S]` inputs.
pub fn build_graph<B: Backend>(model: &MobileNetV3Small<B>, image_size: usize) -> Result<GraphProto> {
    if model.blocks.len() != MOBILENET_V3_SMALL_BLOCKS.len() {
        return Err(Error::Export(format!(
            "Expected {} bottleneck blocks, found {}",
            MOBILENET_V3_SMALL_BLOCKS.len(),
            model.blocks.len()
        )));
    }

    let mut graph = GraphBuilder::new();
    let x = graph.conv_bn("stem", INPUT_NAME, &model.stem, 2, 1)?;
    let mut x = graph.hard_swish(&x);

    for (i, (block, spec)) in model.blocks.iter().zip(MOBILENET_V3_SMALL_BLOCKS.iter()).enumerate() {
        x = graph.inverted_residual(&format!("blocks.{i}"), &x, block, spec.stride)?;
    }

    let x = graph.conv_bn("last_conv", &x, &model.last_conv, 1, 1)?;
    let x = graph.hard_swish(&x);
    let x = graph.global_average_pool(&x);
    let x = graph.flatten(&x);
    let x = graph.gemm("pre_classifier", &x, &model.pre_classifier, None)?;
    let x = graph.hard_swish(&x);
    graph.gemm("classifier", &x, &model.classifier, Some(OUTPUT_NAME))?;

    let num_classes = model.classifier.weight.val().dims()[1];
    Ok(graph.finish(
        "leafsense_mobilenet_v3_small",
        vec![ValueInfoProto::batched_float(
            INPUT_NAME,
            BATCH_PARAM,
            &[3, image_size, image_size],
        )],
        vec![ValueInfoProto::batched_float(OUTPUT_NAME, BATCH_PARAM, &[num_classes])],
    ))
}
