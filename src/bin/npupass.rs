//! npupass driver.
//!
//! Schedules a network description into MCE+PLE passes and prints the passes,
//! the buffer layout, per-pass estimates and session statistics.

use clap::Parser;
use npupass::core::{load_config_file, BufferManager, CompilationSession, CompilerConfig};
use npupass::driver::schedule;
use npupass::network::load_network_file;
use npupass::pass::MaskWeightEncoder;
use std::fs;
use std::path::PathBuf;

/// Greedy MCE+PLE pass scheduler
#[derive(Parser, Debug)]
#[command(name = "npupass")]
#[command(version = "0.1.0")]
#[command(about = "Schedules a network into NPU MCE+PLE passes", long_about = None)]
struct Args {
    /// Network description (TOML)
    #[arg(value_name = "NETWORK")]
    network: PathBuf,

    /// Compiler configuration (TOML); built-in defaults otherwise
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the serialized command stream to this file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Log scheduling decisions
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => CompilerConfig::default(),
    };
    let network = load_network_file(&args.network)?;

    let session = CompilationSession::new();
    session.set_network_name(&network.name);
    let mut buffers = BufferManager::new();
    let mut graph = network.build_graph(&mut buffers)?;
    let encoder = MaskWeightEncoder::new();

    let result = schedule(&mut graph, &config, &encoder, &mut buffers, &session)?;

    for pass in &result.passes {
        println!("{}", pass);
        println!(
            "{}",
            pass.stats(
                &graph,
                &config.capabilities,
                &config.options,
                &config.estimation,
                &encoder
            )
        );
    }
    if let Some(request) = &result.pending_fixup {
        println!("stopped: {}", request);
    }
    for node in &result.infeasible {
        println!("no pass fits at {} ({})", node, graph[*node].name);
    }

    let stream = result.command_stream.to_bytes();
    buffers.add_command_stream(&stream);
    buffers.allocate()?;
    println!("Buffers:");
    for (id, info) in buffers.buffers()? {
        println!(
            "  {:>3} {:?} {:?} offset {} size {}",
            id, info.buffer_type, info.location, info.offset, info.size
        );
    }

    if let Some(path) = &args.output {
        fs::write(path, &stream)?;
    }

    print!("{}", session.stats());
    if !result.is_complete() {
        std::process::exit(1);
    }
    Ok(())
}
