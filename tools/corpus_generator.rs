/// Corpus Generator — runs coverage-driven generation cycles against a
/// local model server and writes each batch to disk.
///
/// Usage: corpus_generator [--settings <file.ron>] [--target <n>] [--cycles <n>] [--seed <n>] [--db <file>]
///
/// Ctrl-C finishes the current bucket, writes what the cycle produced, and
/// exits.
use corpus_forge::core::batch_writer::BatchWriter;
use corpus_forge::core::pipeline::CorpusEngine;
use corpus_forge::core::settings::Settings;
use std::env;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "Usage: corpus_generator [--settings <file.ron>] [--target <n>] [--cycles <n>] [--seed <n>] [--db <file>]";

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or_else(|| {
        eprintln!("Error: {} expects a number", flag);
        eprintln!("{}", USAGE);
        process::exit(1);
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    let mut settings_path = None;
    let mut target = None;
    let mut cycles = 1usize;
    let mut seed = None;
    let mut db = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--settings" => {
                i += 1;
                settings_path = args.get(i).cloned();
            }
            "--target" => {
                i += 1;
                target = Some(parse_number::<usize>("--target", args.get(i)));
            }
            "--cycles" => {
                i += 1;
                cycles = parse_number("--cycles", args.get(i));
            }
            "--seed" => {
                i += 1;
                seed = Some(parse_number::<u64>("--seed", args.get(i)));
            }
            "--db" => {
                i += 1;
                db = args.get(i).cloned();
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("{}", USAGE);
                process::exit(1);
            }
        }
        i += 1;
    }

    let settings_path = settings_path.unwrap_or_else(|| "space_data/settings.ron".to_string());
    let mut settings = if Path::new(&settings_path).exists() {
        Settings::load_from_ron(Path::new(&settings_path)).unwrap_or_else(|e| {
            eprintln!("ERROR: Failed to load settings '{}': {}", settings_path, e);
            process::exit(1);
        })
    } else {
        println!("Settings file '{}' not found, using defaults", settings_path);
        Settings::default()
    };
    if let Some(db) = db {
        settings.generation.coverage_db = db;
    }
    let target = target.unwrap_or(settings.generation.target_examples);

    let mut writer = BatchWriter::new(
        Path::new(&settings.generation.output_dir),
        &settings.generation.output_prefix,
    )
    .unwrap_or_else(|e| {
        eprintln!("ERROR: Cannot prepare output directory: {}", e);
        process::exit(1);
    });

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, stopping after the current bucket...");
        handler_flag.store(true, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set interrupt handler: {}", e);
    }

    let mut builder = CorpusEngine::builder()
        .settings(settings)
        .stop_flag(Arc::clone(&stop));
    if let Some(seed) = seed {
        builder = builder.seed(seed);
    }
    let mut engine = builder.build().unwrap_or_else(|e| {
        eprintln!("ERROR: Failed to start engine: {}", e);
        process::exit(1);
    });

    let mut failed_batches = 0;
    for cycle in 1..=cycles {
        println!("\n=== Cycle {}/{} (target {}) ===\n", cycle, cycles, target);
        let outcome = match engine.run_cycle(target) {
            Ok(outcome) => outcome,
            Err(e) => {
                eprintln!("ERROR: Cycle {} aborted: {}", cycle, e);
                process::exit(1);
            }
        };

        match writer.write(&outcome.batch, Some(&outcome.validation)) {
            Ok(path) => println!("Wrote {} examples to {}", outcome.batch.len(), path.display()),
            Err(e) => {
                eprintln!("ERROR: Failed to write batch: {}", e);
                process::exit(1);
            }
        }

        println!(
            "Rounds: {} (+{} gap rounds), attempts: {}, failed generations: {}",
            outcome.rounds,
            outcome.gap_rounds,
            outcome.attempts.len(),
            outcome.failures
        );
        print!("{}", outcome.validation);
        if let Some(ref coverage) = outcome.coverage {
            println!();
            print!("{}", coverage);
        }
        if !outcome.validation.passed {
            failed_batches += 1;
        }
        if outcome.stopped || stop.load(Ordering::SeqCst) {
            println!("Stopped early.");
            break;
        }
    }

    println!(
        "\nSummary: {} cycles, {} batches failed validation",
        cycles, failed_batches
    );
}
