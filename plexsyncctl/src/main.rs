use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = plexsyncctl::Cli::parse();
    if let Err(err) = plexsyncctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
