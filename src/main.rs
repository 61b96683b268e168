use clap::Parser;
use color_print::cformat;
use peer_exclusion::{config::Config, log, peer::Peer};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = log::init(&config.log_filter, config.log_path().as_deref()) {
        eprintln!("{e}");
        std::process::exit(2);
    }

    log::info(&cformat!("Creating peer on port <bold>{}</bold>.", config.port));

    if Peer::new(config).run().await.is_err() {
        std::process::exit(1);
    }
}
