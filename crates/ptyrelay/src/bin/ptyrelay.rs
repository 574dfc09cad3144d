use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = ptyrelay::cli::Args::parse();
    ptyrelay::cli::init_logging(&args)?;

    let result = ptyrelay::cli::run(args);

    // Leave nothing buffered for the front-end
    use std::io::{self, Write};
    let _ = io::stderr().flush();
    let _ = io::stdout().flush();

    result.map(|_| ())
}
