use clap::Parser;
use tracing::error;

use ravel::{init_logging, ProxyServer};

#[derive(Parser)]
#[command(name = "ravel")]
#[command(about = "Caching keep-alive HTTP/1.1 forward proxy")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = 8080)]
    port: u16,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let mut server = match ProxyServer::new(cli.port) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start proxy");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!(error = %e, "proxy terminated abnormally");
        std::process::exit(1);
    }
}
