mod cli;
mod demo;
mod logging;

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("stagehand error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    demo::run(args).await
}
