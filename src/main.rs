use clap::{arg, Parser};
use log::info;

use cpu_time::ProcessTime;

use tcep_rust::engine::Engine;
use tcep_rust::pattern::parser::PatternFile;
use tcep_rust::pattern::{NegationMode, TreeShape};
use tcep_rust::stream::CsvEventStream;
use tcep_rust::tree::EvalTree;

/// Tree-based complex event processing over timestamped event streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The path of the pattern description, e.g. ../data/patterns/probe_then_login.json
    pattern_file: String,

    /// The path to the input event stream (headerless CSV)
    event_stream: String,

    /// Window size override (milliseconds)
    #[arg(short, long)]
    window_size: Option<u64>,

    /// Negation evaluation mode (first-chance or post-processing)
    #[arg(short, long)]
    negation_mode: Option<NegationMode>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    info!("Command line arguments: {:?}", args);

    let pattern_file = PatternFile::parse(&args.pattern_file).expect("Failed to parse pattern");
    let mut pattern = pattern_file.pattern;
    if let Some(window_size) = args.window_size {
        pattern.window = window_size;
    }
    info!("Pattern placeholders: {:#?}", pattern.placeholders);

    let negation_mode = args
        .negation_mode
        .or(pattern_file.negation_mode)
        .unwrap_or(NegationMode::FirstChance);
    let tree_shape = pattern_file
        .tree_shape
        .unwrap_or_else(|| TreeShape::left_deep(pattern.num_positives()));
    info!("Tree shape: {:?}, negation mode: {:?}", tree_shape, negation_mode);

    let tree = EvalTree::new(&pattern, &tree_shape, negation_mode)
        .expect("Failed to build the evaluation tree");
    let events =
        CsvEventStream::open(&args.event_stream).expect("Failed to open the event stream");

    let start_time = ProcessTime::now();

    let engine = Engine::new(events, tree);

    let mut num_result = 0u32;
    for pattern_match in engine {
        let pattern_match = pattern_match.expect("Evaluation failed");
        info!("Pattern Match: {}", pattern_match);
        num_result += 1;
    }
    println!("Total number of matches: {num_result}");

    println!(
        "CPU time elapsed: {:?} secs",
        start_time.elapsed().as_secs_f64()
    );

    #[cfg(target_os = "linux")]
    {
        print_peak_memory();
    }

    info!("Finished");
}

#[cfg(target_os = "linux")]
fn print_peak_memory() {
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    if let Ok(file) = File::open("/proc/self/status") {
        let mut buf_reader = BufReader::new(file);

        let mut line = String::new();
        while let Ok(nread) = buf_reader.read_line(&mut line) {
            if nread == 0 {
                break;
            }

            if let Some(line) = line.strip_prefix("VmHWM:") {
                println!("Peak memory usage: {}", line.trim());
                break;
            }

            line.clear();
        }
    }
}
