use model_probe::{ProbeConfig, Prober};
use tracing_subscriber::EnvFilter;

fn main() {
    // Diagnostics go to stderr, the report owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = ProbeConfig::from_env();
    print!("{}", config.banner());

    // Every path exits 0; the verdict is in the report.
    match Prober::new(config).and_then(|prober| prober.run()) {
        Ok(outcome) => {
            println!();
            println!("{}", outcome);
        }
        Err(error) => println!("Error: {}", error),
    }
}
