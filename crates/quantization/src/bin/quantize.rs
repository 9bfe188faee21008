use std::path::PathBuf;

use candle_core::Device;
use clap::{Args, Parser, Subcommand, ValueEnum};
use layers::QuantDType;
use quantization::{
    artifact, benchmark, pipeline, BenchmarkOptions, LowpSetting, PipelineConfig, QuantMode,
    QuantizationError,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("quantize failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Quantize a decoder model and benchmark the result", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a dense model into a frozen quantized artifact.
    Run(RunArgs),
    /// Measure first-token and next-token latency of an artifact.
    Benchmark(BenchmarkArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, value_name = "PATH", help = "Pipeline config (toml or json)")]
    config: PathBuf,

    #[arg(long, value_enum)]
    mode: Option<QuantMode>,

    #[arg(long, value_enum)]
    weight_dtype: Option<WeightDtype>,

    #[arg(
        long,
        value_enum,
        help = "Execution precision of weight-only linears; int8 is rejected with INT8 weights"
    )]
    lowp_mode: Option<LowpSetting>,

    #[arg(long, help = "Smooth-quant migration strength in [0, 1]")]
    alpha: Option<f32>,

    #[arg(long, help = "INT4 group width along the input dimension")]
    group_size: Option<usize>,

    #[arg(long, value_name = "PATH")]
    low_precision_checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "JSON-lines file of tokenized samples")]
    calibration_data: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BenchmarkArgs {
    #[arg(long, value_name = "PATH")]
    artifact: PathBuf,

    #[arg(long, default_value_t = 100)]
    num_iter: usize,

    #[arg(long, default_value_t = 10)]
    num_warmup: usize,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 32)]
    input_tokens: usize,

    #[arg(long, default_value_t = 32)]
    max_new_tokens: usize,

    #[arg(long, help = "Greedy decoding instead of 4-beam search")]
    greedy: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WeightDtype {
    Int8,
    Int4,
}

impl From<WeightDtype> for QuantDType {
    fn from(value: WeightDtype) -> Self {
        match value {
            WeightDtype::Int8 => QuantDType::Int8,
            WeightDtype::Int4 => QuantDType::Int4,
        }
    }
}

fn run() -> Result<(), QuantizationError> {
    let cli = Cli::parse();
    let device = Device::Cpu;
    match cli.command {
        Command::Run(args) => run_pipeline(args, &device),
        Command::Benchmark(args) => run_benchmark(args, &device),
    }
}

fn run_pipeline(args: RunArgs, device: &Device) -> Result<(), QuantizationError> {
    let mut config = PipelineConfig::read(&args.config)?;
    apply_overrides(&mut config, args);
    config.validate()?;

    let report = pipeline::run(&config, device)?;
    println!(
        "quantized {} projections ({}) -> {}",
        report.converted,
        report.recipe,
        report.artifact.display()
    );
    Ok(())
}

fn apply_overrides(config: &mut PipelineConfig, args: RunArgs) {
    let quant = &mut config.quantization;
    if let Some(mode) = args.mode {
        quant.mode = mode;
    }
    if let Some(dtype) = args.weight_dtype {
        quant.weight_dtype = Some(dtype.into());
    }
    if let Some(lowp) = args.lowp_mode {
        quant.lowp_mode = lowp;
    }
    if let Some(alpha) = args.alpha {
        quant.alpha = alpha;
    }
    if let Some(group) = args.group_size {
        quant.group_size = Some(group);
    }
    if let Some(path) = args.low_precision_checkpoint {
        quant.low_precision_checkpoint = Some(path);
    }
    if let Some(path) = args.calibration_data {
        config.calibration.data = Some(path);
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
}

fn run_benchmark(args: BenchmarkArgs, device: &Device) -> Result<(), QuantizationError> {
    let options = BenchmarkOptions {
        num_iter: args.num_iter,
        num_warmup: args.num_warmup,
        batch_size: args.batch_size,
        input_tokens: args.input_tokens,
        max_new_tokens: args.max_new_tokens,
        greedy: args.greedy,
    };
    let mut loaded = artifact::load(&args.artifact, device)?;
    let summary = benchmark::run(&mut loaded.model, &options)?;

    println!("recipe: {}", loaded.manifest.recipe);
    println!("iterations: {}", summary.runs);
    println!(
        "first token latency: {:.3} ms",
        summary.first_token.as_secs_f64() * 1e3
    );
    println!(
        "next token latency: mean {:.3} ms, p90 {:.3} ms, p99 {:.3} ms",
        summary.next_token_mean.as_secs_f64() * 1e3,
        summary.next_token_p90.as_secs_f64() * 1e3,
        summary.next_token_p99.as_secs_f64() * 1e3
    );
    Ok(())
}
