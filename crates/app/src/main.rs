mod cli;
mod review;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    review::telemetry::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    if cli::handle_commands(&args)? {
        return Ok(());
    }

    eprint!("{}", cli::USAGE);
    std::process::exit(2);
}
