//! llama-generate: Generate text through a llama-session.

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use llama_session::cli::{self, ConfigOverrides};
use llama_session::{LlamaConfig, Session, StubBackend};

#[derive(Parser)]
#[command(name = "llama-generate", about = "Generate text from a model through a llama-session")]
struct Args {
    /// Path to the model file
    #[arg(short = 'm', long, required_unless_present = "version_info")]
    model: Option<PathBuf>,

    /// Prompt text
    #[arg(short = 'p', long, conflicts_with = "file")]
    prompt: Option<String>,

    /// Read prompt from file
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// JSON session configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum tokens to generate (-1 = until EOS or context limit)
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    max_tokens: Option<i64>,

    /// Temperature (0.0 = no temperature scaling)
    #[arg(long)]
    temp: Option<f32>,

    /// Top-k sampling (0 = disabled)
    #[arg(long)]
    top_k: Option<u32>,

    /// Top-p (nucleus) sampling
    #[arg(long)]
    top_p: Option<f32>,

    /// Repetition penalty (1.0 = disabled)
    #[arg(long)]
    repeat_penalty: Option<f32>,

    /// Random seed for sampling
    #[arg(short = 's', long)]
    seed: Option<u32>,

    /// Context window size in tokens
    #[arg(short = 'c', long)]
    ctx: Option<u32>,

    /// Threads for generation and prompt processing
    #[arg(short = 't', long)]
    threads: Option<u32>,

    /// Print tokens as they are generated
    #[arg(long)]
    stream: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,

    /// Print the session version and exit
    #[arg(long)]
    version_info: bool,
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[derive(Serialize)]
struct Timings {
    load_ms: f64,
    prefill_ms: f64,
    decode_ms: f64,
    total_ms: f64,
    prefill_tok_per_sec: f64,
    decode_tok_per_sec: f64,
}

#[derive(Serialize)]
struct JsonOutput {
    version: String,
    model: String,
    prompt: String,
    output: String,
    prompt_tokens: usize,
    generated_tokens: usize,
    stop_reason: String,
    error: Option<String>,
    timings: Timings,
    config: LlamaConfig,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::new(StubBackend::new());

    if args.version_info {
        println!("{}", session.version());
        return Ok(());
    }

    let model_path = args.model.clone().ok_or("--model is required")?;
    let base = match &args.config {
        Some(path) => LlamaConfig::from_json_file(path)?,
        None => LlamaConfig::default(),
    };
    let config = ConfigOverrides {
        max_tokens: args.max_tokens,
        temperature: args.temp,
        top_k: args.top_k,
        top_p: args.top_p,
        repeat_penalty: args.repeat_penalty,
        seed: args.seed,
        context_size: args.ctx,
        threads: args.threads,
    }
    .apply(base);

    let input = cli::read_input(args.prompt.as_deref(), args.file.as_deref(), true)?;

    let total_start = Instant::now();
    let load_start = Instant::now();
    session.load_model(&model_path, &config)?;
    let load_ms = load_start.elapsed().as_secs_f64() * 1000.0;

    let print_tokens = args.stream && args.output_format == "text";
    let mut generated_text = String::new();
    let mut stdout = std::io::stdout();
    let output = session.generate_stream(
        &input,
        |piece| {
            generated_text.push_str(piece);
            if print_tokens {
                let _ = write!(stdout, "{}", piece);
                let _ = stdout.flush();
            }
        },
        None,
    )?;
    let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;

    if let Some(err) = &output.error {
        eprintln!("Warning: generation stopped early: {}", err);
    }

    match args.output_format.as_str() {
        "json" => {
            let json = JsonOutput {
                version: session.version(),
                model: model_path.display().to_string(),
                prompt: input,
                output: generated_text,
                prompt_tokens: output.prompt_tokens,
                generated_tokens: output.generated_tokens,
                stop_reason: output.stop_reason.to_string(),
                error: output.error.as_ref().map(|e| e.to_string()),
                timings: Timings {
                    load_ms,
                    prefill_ms: output.prefill_duration.as_secs_f64() * 1000.0,
                    decode_ms: output.decode_duration.as_secs_f64() * 1000.0,
                    total_ms,
                    prefill_tok_per_sec: output.prefill_tokens_per_second(),
                    decode_tok_per_sec: output.decode_tokens_per_second(),
                },
                config,
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            if print_tokens {
                println!();
            } else {
                println!("{}", generated_text);
            }
            eprintln!(
                "[{} prompt tokens, {} generated, stop: {}, {:.1} tok/s]",
                output.prompt_tokens,
                output.generated_tokens,
                output.stop_reason,
                output.decode_tokens_per_second()
            );
        }
    }

    Ok(())
}
