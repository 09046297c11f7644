/// Coverage Report — prints per-bucket and per-level coverage from a
/// coverage database.
///
/// Usage: coverage_report <coverage.db> [--space <space.ron>] [--buckets] [--history]
use corpus_forge::core::reporter::CoverageReporter;
use corpus_forge::core::space::BucketSpace;
use corpus_forge::core::store::SqliteCoverageStore;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: coverage_report <coverage.db> [--space <space.ron>] [--buckets] [--history]");
        process::exit(0);
    }

    let db_path = &args[1];
    let mut space_path = "space_data/default_space.ron".to_string();
    let mut show_buckets = false;
    let mut show_history = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--space" if i + 1 < args.len() => {
                i += 1;
                space_path = args[i].clone();
            }
            "--buckets" => show_buckets = true,
            "--history" => show_history = true,
            other => {
                eprintln!("Unknown argument: {}", other);
                process::exit(1);
            }
        }
        i += 1;
    }

    if !Path::new(db_path).exists() {
        eprintln!("ERROR: Database '{}' does not exist", db_path);
        process::exit(1);
    }

    let space = match BucketSpace::load_from_ron(Path::new(&space_path)) {
        Ok(space) => Arc::new(space),
        Err(e) => {
            eprintln!("ERROR: Failed to load bucket space: {}", e);
            process::exit(1);
        }
    };

    let store = match SqliteCoverageStore::open(Path::new(db_path), Arc::clone(&space)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };

    let reporter = CoverageReporter::new(Arc::clone(&space), store.clone());
    let report = match reporter.report() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };

    print!("{}", report);

    if show_buckets {
        println!("\nBuckets:");
        for b in &report.per_bucket {
            println!(
                "  {:<48} {:>5} (min {})",
                b.bucket.to_string(),
                b.count,
                b.minimum_required
            );
        }
    }

    if show_history {
        match store.batch_history() {
            Ok(history) if history.is_empty() => println!("\nNo validated batches recorded."),
            Ok(history) => {
                println!("\nBatch history:");
                for h in history {
                    let status = if h.passed { "passed" } else { "FAILED" };
                    print!(
                        "  {} {} {:>4} examples {}",
                        h.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                        h.batch_id,
                        h.total_examples,
                        status
                    );
                    if h.failed_checks.is_empty() {
                        println!();
                    } else {
                        println!(" ({})", h.failed_checks.join(", "));
                    }
                }
            }
            Err(e) => eprintln!("ERROR: Failed to read batch history: {}", e),
        }
    }

    if !report.underfilled.is_empty() {
        process::exit(2);
    }
}
