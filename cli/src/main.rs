use clap::Parser;
use procpipe_cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    procpipe_cli::init_tracing(cli.verbose);

    let exit_code = match procpipe_cli::run_main(cli).await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("procpipe: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}
