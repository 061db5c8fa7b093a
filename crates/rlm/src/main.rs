use std::time::{Duration, Instant};

use rand::Rng;
use tracing_subscriber::EnvFilter;

use rlm_runtime_core::controller::{Controller, ControllerConfig};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn generate_massive_context(num_lines: usize, answer: &str) -> String {
    println!("Generating massive context with {num_lines} lines");

    let random_words = [
        "blah",
        "random",
        "text",
        "data",
        "content",
        "information",
        "sample",
    ];
    let mut rng = rand::rng();
    let mut lines = Vec::with_capacity(num_lines);
    for _ in 0..num_lines {
        let num_words = rng.random_range(3..=8);
        let line_words: Vec<&str> = (0..num_words)
            .map(|_| random_words[rng.random_range(0..random_words.len())])
            .collect();
        lines.push(line_words.join(" "));
    }

    let magic_position = rng.random_range(400_000..600_000);
    lines[magic_position] = format!("The magic number is {answer}");
    println!("Magic number inserted at position {magic_position}");

    lines.join("\n")
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Example of using the RLM REPL on a needle-in-haystack problem.");
    let answer: String = rand::rng().random_range(1_000_000..9_999_999).to_string();
    let answer_for_context = answer.clone();
    let context = tokio::task::spawn_blocking(move || {
        generate_massive_context(1_000_000, &answer_for_context)
    })
    .await?;

    let config = ControllerConfig {
        api_key: Some(std::env::var("OPENAI_API_KEY")?),
        base_url: "https://api.openai.com/v1".to_owned(),
        model: "gpt-5".to_owned(),
        other_models: vec!["gpt-5-nano".to_owned()],
        recursive_max_depth: 3,
        max_iterations: 10,
        root_timeout: Duration::from_secs(120),
        min_timeout: Duration::from_secs(20),
        step: Duration::from_secs(20),
        ..ControllerConfig::default()
    };
    let mut controller = Controller::new(config)?;
    let query = "I'm looking for a magic number. What is it?";
    let start = Instant::now();
    let result = controller.completion(context, Some(query)).await?;
    let elapsed = start.elapsed().as_secs_f64();

    println!("Time taken: {elapsed} seconds");
    println!("Result: {result}. Expected: {answer}");
    Ok(())
}
