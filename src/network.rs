// This module loads the network descriptions consumed by the npupass driver. A description is
// a TOML document with a name and an ordered array of node tables; each node names its kind,
// its output shape and the names of the nodes it reads, which must appear earlier in the file.
// MCE nodes carry a weights table and fused PLE nodes name their kernel. Weight values are not
// part of the description: a fixed byte pattern stands in for them, which is all the scheduler
// and the estimator need. Building the graph also registers each network input as a DRAM
// input buffer so the first pass has something to read.

//! Network description files.

use crate::command_stream::{MceOperation, PleOperation};
use crate::core::buffer_manager::{BufferLocation, BufferManager};
use crate::core::error::ConfigError;
use crate::core::utils::{total_size, TensorShape};
use crate::graph::{
    AlgorithmHint, CompilerDataFormat, CompressionHint, FuseOnlyPleData, Graph, LocationHint, MceOperationData,
    NodeId, NodeKind, QuantizationInfo, Stride, WeightsFormat, WeightsInfo,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NetworkDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindDescription {
    Input,
    Output,
    FormatConversion,
    ExtractSubtensor,
    Mce,
    McePostProcess,
    FuseOnlyPle,
    Requantize,
    Concat,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeDescription {
    pub name: String,
    pub kind: NodeKindDescription,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output shape; outputs default to the shape of what they read.
    pub shape: Option<TensorShape>,
    #[serde(default)]
    pub format: CompilerDataFormat,
    #[serde(default)]
    pub quantization: QuantizationInfo,
    #[serde(default)]
    pub compression_hint: CompressionHint,
    #[serde(default)]
    pub location_hint: LocationHint,
    pub mce: Option<MceDescription>,
    pub ple: Option<PleOperation>,
    /// `[lower, upper]` clamp of an MCE post-process.
    pub bounds: Option<[u8; 2]>,
    pub supertensor_offset: Option<TensorShape>,
    pub axis: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MceDescription {
    pub operation: MceOperation,
    pub weights_shape: TensorShape,
    pub weights_format: WeightsFormat,
    #[serde(default)]
    pub weights_quantization: QuantizationInfo,
    #[serde(default = "default_stride")]
    pub stride: [u32; 2],
    /// `[top, left]`
    #[serde(default)]
    pub padding: [u32; 2],
    #[serde(default = "default_upscale_factor")]
    pub upscale_factor: u32,
    #[serde(default)]
    pub algorithm_hint: AlgorithmHint,
}

fn default_stride() -> [u32; 2] {
    [1, 1]
}

fn default_upscale_factor() -> u32 {
    1
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::InvalidNetwork { reason }
}

/// Stand-in weight values of an MCE operation.
pub fn dummy_weights(shape: &TensorShape) -> Vec<u8> {
    (0..total_size(shape)).map(|i| (i % 251) as u8).collect()
}

impl NetworkDescription {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Build the graph, registering network inputs in `buffers`.
    pub fn build_graph(&self, buffers: &mut BufferManager) -> Result<Graph, ConfigError> {
        let mut graph = Graph::new();
        let mut ids: HashMap<&str, NodeId> = HashMap::new();

        for (index, desc) in self.nodes.iter().enumerate() {
            if ids.contains_key(desc.name.as_str()) {
                return Err(invalid(format!("duplicate node name '{}'", desc.name)));
            }

            let inputs = desc
                .inputs
                .iter()
                .map(|input| {
                    ids.get(input.as_str()).copied().ok_or_else(|| {
                        invalid(format!("node '{}' reads '{}', which is not defined before it", desc.name, input))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let expected_inputs = match desc.kind {
                NodeKindDescription::Input => Some(0),
                NodeKindDescription::Concat | NodeKindDescription::Passthrough => None,
                _ => Some(1),
            };
            if let Some(expected) = expected_inputs {
                if inputs.len() != expected {
                    return Err(invalid(format!(
                        "node '{}' has {} inputs, expected {}",
                        desc.name,
                        inputs.len(),
                        expected
                    )));
                }
            }

            let shape = match (desc.shape, desc.kind) {
                (Some(shape), _) => shape,
                (None, NodeKindDescription::Output) => graph[inputs[0]].shape,
                (None, _) => return Err(invalid(format!("node '{}' has no shape", desc.name))),
            };

            let kind = self.node_kind(desc, index as u32, &inputs)?;
            let id = graph.add_node(&desc.name, kind, shape, &inputs);
            let node = &mut graph[id];
            node.format = desc.format;
            node.quantization = desc.quantization;
            node.compression_hint = desc.compression_hint;
            node.location_hint = desc.location_hint;

            if desc.kind == NodeKindDescription::Input {
                node.location = BufferLocation::Dram;
                node.buffer_id = Some(buffers.add_dram_input(total_size(&shape), index as u32));
            }
            ids.insert(desc.name.as_str(), id);
        }

        log::info!("loaded network '{}' with {} nodes", self.name, graph.len());
        Ok(graph)
    }

    fn node_kind(&self, desc: &NodeDescription, index: u32, inputs: &[NodeId]) -> Result<NodeKind, ConfigError> {
        let missing = |field: &str| invalid(format!("node '{}' needs '{}'", desc.name, field));
        Ok(match desc.kind {
            NodeKindDescription::Input => NodeKind::Input {
                source_operation_id: index,
            },
            NodeKindDescription::Output => NodeKind::Output {
                source_operation_id: inputs[0].0 as u32,
                output_index: 0,
            },
            NodeKindDescription::FormatConversion => NodeKind::FormatConversion,
            NodeKindDescription::ExtractSubtensor => NodeKind::ExtractSubtensor {
                supertensor_offset: desc.supertensor_offset.ok_or_else(|| missing("supertensor_offset"))?,
            },
            NodeKindDescription::Mce => {
                let mce = desc.mce.as_ref().ok_or_else(|| missing("mce"))?;
                if !matches!(mce.upscale_factor, 1 | 2) {
                    return Err(invalid(format!(
                        "node '{}' has upscale factor {}, expected 1 or 2",
                        desc.name, mce.upscale_factor
                    )));
                }
                let info = WeightsInfo {
                    dimensions: mce.weights_shape,
                    format: mce.weights_format,
                    quantization: mce.weights_quantization,
                };
                let data = MceOperationData::new(mce.operation, info, dummy_weights(&mce.weights_shape))
                    .with_stride(Stride::new(mce.stride[0], mce.stride[1]))
                    .with_padding(mce.padding[0], mce.padding[1])
                    .with_upscale_factor(mce.upscale_factor)
                    .with_algorithm_hint(mce.algorithm_hint);
                NodeKind::MceOperation(data)
            }
            NodeKindDescription::McePostProcess => {
                let [lower_bound, upper_bound] = desc.bounds.ok_or_else(|| missing("bounds"))?;
                NodeKind::McePostProcess {
                    lower_bound,
                    upper_bound,
                }
            }
            NodeKindDescription::FuseOnlyPle => {
                NodeKind::FuseOnlyPle(FuseOnlyPleData::new(desc.ple.ok_or_else(|| missing("ple"))?))
            }
            NodeKindDescription::Requantize => NodeKind::Requantize,
            NodeKindDescription::Concat => {
                let axis = desc.axis.ok_or_else(|| missing("axis"))?;
                if axis >= 4 {
                    return Err(invalid(format!(
                        "node '{}' concatenates along axis {}, expected 0..=3",
                        desc.name, axis
                    )));
                }
                NodeKind::Concat { axis }
            }
            NodeKindDescription::Passthrough => NodeKind::Passthrough {
                label: desc.name.clone(),
            },
        })
    }
}

/// Load a network description from a TOML file.
pub fn load_network_file(path: &Path) -> Result<NetworkDescription, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    NetworkDescription::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DW_POOL: &str = r#"
        name = "dw_pool"

        [[nodes]]
        name = "in"
        kind = "input"
        shape = [1, 64, 64, 32]

        [[nodes]]
        name = "dw"
        kind = "mce"
        inputs = ["in"]
        shape = [1, 64, 64, 32]
        quantization = { zero_point = 3, scale = 0.5 }
        mce = { operation = "depthwise_convolution", weights_shape = [3, 3, 32, 1], weights_format = "hwim", padding = [1, 1] }

        [[nodes]]
        name = "pool"
        kind = "fuse_only_ple"
        inputs = ["dw"]
        shape = [1, 32, 32, 32]
        ple = "maxpool_3x3_2_2"

        [[nodes]]
        name = "out"
        kind = "output"
        inputs = ["pool"]
    "#;

    #[test]
    fn test_build_graph() {
        let description = NetworkDescription::from_toml_str(DW_POOL).unwrap();
        let mut buffers = BufferManager::new();
        let graph = description.build_graph(&mut buffers).unwrap();

        assert_eq!(graph.len(), 4);
        let input = graph.find_by_name("in").unwrap();
        assert_eq!(graph[input].location, BufferLocation::Dram);
        assert_eq!(buffers.get(graph[input].buffer_id.unwrap()).unwrap().size, 64 * 64 * 32);

        let dw = graph.find_by_name("dw").unwrap();
        let mce = graph[dw].mce().unwrap();
        assert!(mce.is_depthwise());
        assert_eq!((mce.pad_top, mce.pad_left), (1, 1));
        assert_eq!(mce.weights_data.len(), 3 * 3 * 32);
        assert_eq!(graph[dw].quantization, QuantizationInfo::new(3, 0.5));

        let pool = graph.find_by_name("pool").unwrap();
        assert_eq!(graph[pool].ple().unwrap().operation, PleOperation::MaxPool3x3);
        assert_eq!(graph[graph.find_by_name("out").unwrap()].shape, [1, 32, 32, 32]);
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let description = NetworkDescription::from_toml_str(
            r#"
            [[nodes]]
            name = "rq"
            kind = "requantize"
            inputs = ["later"]
            shape = [1, 8, 8, 16]
            "#,
        )
        .unwrap();
        let err = description.build_graph(&mut BufferManager::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNetwork { .. }));
        assert!(err.to_string().contains("later"));
    }

    #[test]
    fn test_mce_without_weights_table_is_rejected() {
        let description = NetworkDescription::from_toml_str(
            r#"
            [[nodes]]
            name = "in"
            kind = "input"
            shape = [1, 8, 8, 16]

            [[nodes]]
            name = "conv"
            kind = "mce"
            inputs = ["in"]
            shape = [1, 8, 8, 16]
            "#,
        )
        .unwrap();
        let err = description.build_graph(&mut BufferManager::new()).unwrap_err();
        assert!(err.to_string().contains("needs 'mce'"));
    }

    #[test]
    fn test_concat_axis_out_of_range_is_rejected() {
        let description = NetworkDescription::from_toml_str(
            r#"
            [[nodes]]
            name = "a"
            kind = "input"
            shape = [1, 8, 8, 16]

            [[nodes]]
            name = "b"
            kind = "input"
            shape = [1, 8, 8, 16]

            [[nodes]]
            name = "cat"
            kind = "concat"
            inputs = ["a", "b"]
            shape = [1, 8, 8, 32]
            axis = 7
            "#,
        )
        .unwrap();
        let err = description.build_graph(&mut BufferManager::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNetwork { .. }));
        assert!(err.to_string().contains("axis 7"));
    }
}
