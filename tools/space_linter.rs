/// Space Linter — validates a bucket space definition and the prompt
/// template that will be rendered against it.
///
/// Usage: space_linter <space.ron> [--prompt <prompts.ron>]

use corpus_forge::core::derive::ScenarioCalculator;
use corpus_forge::core::prompt::PromptTemplate;
use corpus_forge::core::space::BucketSpace;
use corpus_forge::schema::dimension::DimensionKind;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: space_linter <space.ron> [--prompt <prompts.ron>]");
        process::exit(0);
    }

    let space_path = &args[1];
    let mut prompt_path = None;

    let mut i = 2;
    while i < args.len() {
        if args[i] == "--prompt" && i + 1 < args.len() {
            i += 1;
            prompt_path = Some(args[i].clone());
        }
        i += 1;
    }

    let space = match BucketSpace::load_from_ron(Path::new(space_path)) {
        Ok(space) => Arc::new(space),
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };

    println!(
        "Loaded {} dimensions, {} buckets",
        space.dimensions().len(),
        space.bucket_count()
    );

    let (errors, warnings) = lint_space(&space, prompt_path.as_deref());

    println!("\n=== Space Lint Report ===\n");

    if errors.is_empty() && warnings.is_empty() {
        println!("All checks passed!");
    }

    for warning in &warnings {
        println!("WARNING: {}", warning);
    }

    for error in &errors {
        println!("ERROR: {}", error);
    }

    println!(
        "\nSummary: {} errors, {} warnings",
        errors.len(),
        warnings.len()
    );

    if !errors.is_empty() {
        process::exit(1);
    }
}

fn lint_space(space: &Arc<BucketSpace>, prompt_path: Option<&str>) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = space.range_gaps();

    for dim in space.dimensions() {
        for level in &dim.levels {
            if level.frequency == 0.0 && level.min_examples == 0 {
                warnings.push(format!(
                    "{}.{} has zero frequency and no minimum; it will never be generated",
                    dim.name, level.name
                ));
            }
            if level.description.is_none() {
                warnings.push(format!(
                    "{}.{} has no description for prompts",
                    dim.name, level.name
                ));
            }
        }
        let owed: u32 = dim.levels.iter().map(|l| l.min_examples).sum();
        println!("  {:<24} {} levels, {} examples owed", dim.name, dim.levels.len(), owed);
    }

    for kind in [DimensionKind::Capacity, DimensionKind::Authenticity] {
        if space.dimension_of_kind(kind).is_none() {
            warnings.push(format!("no {:?} dimension; derived parameters use defaults", kind));
        }
    }

    // Bands that cannot fit inside the domain are clamped at generation time
    let calculator = ScenarioCalculator::new(Arc::clone(space));
    let mut rng = StdRng::seed_from_u64(0);
    let mut clamped: Vec<String> = Vec::new();
    for bucket in space.buckets() {
        match calculator.derive(&bucket, false, &mut rng) {
            Ok(params) if params.clamped => {
                let pair = params
                    .capacity_level
                    .iter()
                    .chain(params.authenticity_target.iter())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" / ");
                if !clamped.contains(&pair) {
                    clamped.push(pair);
                }
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("bucket {}: {}", bucket, e)),
        }
    }
    for pair in clamped {
        warnings.push(format!("{}: gap band cannot be honoured, support will be clamped", pair));
    }

    let template = match prompt_path {
        Some(path) => PromptTemplate::load_from_ron(Path::new(path)),
        None => PromptTemplate::builtin(),
    };
    match template {
        Ok(t) => {
            if let Err(e) = t.check(space) {
                errors.push(format!("prompt: {}", e));
            } else {
                println!("  prompt uses {} parameters", t.parameters().len());
            }
        }
        Err(e) => errors.push(format!("prompt: {}", e)),
    }

    (errors, warnings)
}
