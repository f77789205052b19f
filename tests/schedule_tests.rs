//! End-to-end scheduling of network description files.

use npupass::command_stream::{Command, MceAlgorithm, PleOperation, SramAllocationStrategy};
use npupass::core::{load_config_file, BufferManager, BufferType, CompilationSession, CompilerConfig};
use npupass::driver::{schedule, Schedule};
use npupass::graph::{FixupRequest, Graph};
use npupass::network::{load_network_file, NetworkDescription};
use npupass::pass::MaskWeightEncoder;
use std::io::Write;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
    [capabilities]
    num_srams = 8
    total_sram_size = 16384
    max_ple_size = 1024
"#;

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

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn run(network: &NetworkDescription, config: &CompilerConfig) -> (Graph, Schedule, BufferManager, CompilationSession) {
    let session = CompilationSession::new();
    let mut buffers = BufferManager::new();
    let mut graph = network.build_graph(&mut buffers).unwrap();
    let result = schedule(&mut graph, config, &MaskWeightEncoder::new(), &mut buffers, &session).unwrap();
    (graph, result, buffers, session)
}

#[test]
fn test_schedule_from_files() {
    init_logging();
    let config_file = temp_file(CONFIG);
    let network_file = temp_file(DW_POOL);
    let config = load_config_file(config_file.path()).unwrap();
    let network = load_network_file(network_file.path()).unwrap();
    assert_eq!(config.capabilities.total_sram_size, 16384);

    let (graph, result, mut buffers, session) = run(&network, &config);
    assert!(result.is_complete());
    assert_eq!(result.passes.len(), 1);
    assert_eq!(result.command_stream.len(), 1);

    let pool = graph.find_by_name("pool").unwrap();
    let output_buffer = graph[pool].buffer_id.unwrap();

    let Command::McePle(record) = &result.command_stream.commands()[0];
    assert_eq!(record.sram_config.allocation_strategy, Some(SramAllocationStrategy::Strategy6));
    assert_eq!(record.ple_data.operation, PleOperation::MaxPool3x3);
    assert_eq!(record.output_info.dram_buffer_id, output_buffer);
    assert_eq!(record.output_info.tensor_shape, [1, 32, 32, 32]);

    buffers.add_command_stream(&result.command_stream.to_bytes());
    buffers.allocate().unwrap();
    let table = buffers.buffers().unwrap();
    assert_eq!(table[&output_buffer].buffer_type, BufferType::Output);
    assert_eq!(table[&BufferManager::COMMAND_STREAM_ID].size as usize, result.command_stream.size_bytes());
    assert_eq!(
        table.values().filter(|info| info.buffer_type == BufferType::Input).count(),
        1
    );

    let stats = session.stats();
    assert_eq!(stats.commands_emitted, 1);
    assert_eq!(stats.command_stream_size, result.command_stream.size_bytes());
}

#[test]
fn test_schedule_is_deterministic() {
    init_logging();
    let config = CompilerConfig::from_toml_str(CONFIG).unwrap();
    let network = NetworkDescription::from_toml_str(DW_POOL).unwrap();

    let layout = |mut buffers: BufferManager, result: &Schedule| {
        buffers.add_command_stream(&result.command_stream.to_bytes());
        buffers.allocate().unwrap();
        (
            buffers.buffers().unwrap().clone(),
            buffers.constant_dma_data().unwrap().to_vec(),
        )
    };

    let (_, first, buffers_a, _) = run(&network, &config);
    let (_, second, buffers_b, _) = run(&network, &config);
    assert_eq!(first.command_stream.to_bytes(), second.command_stream.to_bytes());
    assert_eq!(layout(buffers_a, &first), layout(buffers_b, &second));
}

#[test]
fn test_schedule_stops_at_first_fixup() {
    init_logging();
    let network = NetworkDescription::from_toml_str(
        r#"
        [[nodes]]
        name = "in"
        kind = "input"
        shape = [1, 1, 1, 1024]

        [[nodes]]
        name = "fc"
        kind = "mce"
        inputs = ["in"]
        shape = [1, 1, 1, 16]
        mce = { operation = "fully_connected", weights_shape = [1, 1, 1024, 16], weights_format = "hwio" }
        "#,
    )
    .unwrap();

    let (graph, result, _, session) = run(&network, &CompilerConfig::default());
    let fc = graph.find_by_name("fc").unwrap();
    assert!(!result.is_complete());
    assert!(result.passes.is_empty());
    assert!(matches!(
        result.pending_fixup,
        Some(FixupRequest::RequireOutputFormat { node, .. }) if node == fc
    ));
    assert_eq!(session.stats().fixups.get("RequireOutputFormat"), Some(&1));
}

#[test]
fn test_compressed_input_never_costs_more_traffic() {
    init_logging();
    let config = CompilerConfig::from_toml_str(CONFIG).unwrap();
    let network = NetworkDescription::from_toml_str(DW_POOL).unwrap();
    let (mut graph, result, _, _) = run(&network, &config);
    let pass = &result.passes[0];
    let encoder = MaskWeightEncoder::new();

    let plain = pass.stats(&graph, &config.capabilities, &config.options, &config.estimation, &encoder);
    let input = graph.find_by_name("in").unwrap();
    graph[input].compressed = true;
    let compressed = pass.stats(&graph, &config.capabilities, &config.options, &config.estimation, &encoder);

    assert!(plain.input.memory.dram_total() > 0);
    assert!(compressed.input.memory.dram_total() <= plain.input.memory.dram_total());
    assert_eq!(compressed.mce, plain.mce);
    assert_eq!(compressed.weights.memory, plain.weights.memory);
}

#[test]
fn test_concat_inputs_share_one_buffer() {
    init_logging();
    let network = NetworkDescription::from_toml_str(
        r#"
        [[nodes]]
        name = "in"
        kind = "input"
        shape = [1, 8, 8, 16]

        [[nodes]]
        name = "left"
        kind = "mce"
        inputs = ["in"]
        shape = [1, 8, 8, 16]
        location_hint = "require_dram"
        mce = { operation = "convolution", weights_shape = [1, 1, 16, 16], weights_format = "hwio" }

        [[nodes]]
        name = "right"
        kind = "mce"
        inputs = ["in"]
        shape = [1, 8, 8, 16]
        location_hint = "require_dram"
        mce = { operation = "convolution", weights_shape = [1, 1, 16, 16], weights_format = "hwio" }

        [[nodes]]
        name = "cat"
        kind = "concat"
        inputs = ["left", "right"]
        shape = [1, 8, 8, 32]
        axis = 3

        [[nodes]]
        name = "out"
        kind = "output"
        inputs = ["cat"]
        "#,
    )
    .unwrap();

    let (graph, result, mut buffers, _) = run(&network, &CompilerConfig::default());
    assert!(result.is_complete());
    assert_eq!(result.passes.len(), 2);

    let records: Vec<_> = result
        .command_stream
        .commands()
        .iter()
        .map(|Command::McePle(record)| record.output_info)
        .collect();
    let shared = graph[graph.find_by_name("cat").unwrap()].buffer_id.unwrap();
    assert_eq!(records[0].dram_buffer_id, shared);
    assert_eq!(records[1].dram_buffer_id, shared);
    assert_eq!(records[0].supertensor_offset, [0, 0, 0, 0]);
    assert_eq!(records[1].supertensor_offset, [0, 0, 0, 16]);
    assert_eq!(records[1].supertensor_shape, [1, 8, 8, 32]);

    buffers.add_command_stream(&result.command_stream.to_bytes());
    buffers.allocate().unwrap();
    assert_eq!(buffers.buffers().unwrap()[&shared].buffer_type, BufferType::Output);
}

fn wide_conv_network(algorithm_hint: &str) -> NetworkDescription {
    NetworkDescription::from_toml_str(&format!(
        r#"
        [[nodes]]
        name = "in"
        kind = "input"
        shape = [1, 16, 16, 64]

        [[nodes]]
        name = "conv"
        kind = "mce"
        inputs = ["in"]
        shape = [1, 16, 16, 64]
        mce = {{ operation = "convolution", weights_shape = [3, 3, 64, 64], weights_format = "hwio", padding = [1, 1], algorithm_hint = "{}" }}

        [[nodes]]
        name = "out"
        kind = "output"
        inputs = ["conv"]
        "#,
        algorithm_hint
    ))
    .unwrap()
}

const TINY_SRAM: &str = r#"
    [capabilities]
    total_sram_size = 4096
"#;

#[test]
fn test_schedule_reports_winograd_fixup_and_stops() {
    init_logging();
    let config = CompilerConfig::from_toml_str(TINY_SRAM).unwrap();
    let (graph, result, _, session) = run(&wide_conv_network("allow_winograd"), &config);
    let conv = graph.find_by_name("conv").unwrap();

    assert!(!result.is_complete());
    assert_eq!(
        result.pending_fixup,
        Some(FixupRequest::ForceAlgorithm {
            node: conv,
            algorithm: MceAlgorithm::Direct,
        })
    );
    // Nothing after the fix-up is visited.
    assert!(result.passes.is_empty());
    assert!(result.infeasible.is_empty());
    assert!(result.command_stream.commands().is_empty());
    assert_eq!(session.stats().fixups.get("ForceAlgorithm"), Some(&1));
}

#[test]
fn test_schedule_collects_infeasible_nodes() {
    init_logging();
    let config = CompilerConfig::from_toml_str(TINY_SRAM).unwrap();
    let (graph, result, _, _) = run(&wide_conv_network("require_direct"), &config);
    let conv = graph.find_by_name("conv").unwrap();

    assert!(!result.is_complete());
    assert!(result.pending_fixup.is_none());
    assert!(result.passes.is_empty());
    assert!(result.command_stream.commands().is_empty());
    assert_eq!(result.infeasible.first(), Some(&conv));
    assert!(graph[conv].pass.is_none());
}
