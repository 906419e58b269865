use clap::{Parser, Subcommand};
use log::info;
use std::net::IpAddr;
use std::path::PathBuf;
use tcpscope::config::DEFAULT_URL;
use tcpscope::{Client, ClientConfig, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "tcpscope")]
#[command(about = "HTTP throughput tester reporting kernel TCP statistics from both ends", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the diagnostic HTTP server
    Server {
        /// Port of the HTTP listener
        #[arg(short, long, env = "PORT", default_value = "3000")]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Port of the TLS listener
        #[arg(long)]
        tls_port: Option<u16>,

        /// UDP port of the HTTP/3 endpoint; 0 reuses the HTTP port number
        #[arg(long)]
        quic: Option<u16>,

        /// PEM certificate chain for the TLS and QUIC listeners
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key for the TLS and QUIC listeners
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Directory holding generated certificates
        #[arg(long, default_value = ".")]
        cache: PathBuf,

        /// Generate a self-signed certificate when none is cached
        #[arg(long, conflicts_with = "cert")]
        generate_cert: bool,

        /// Serve static files from this directory
        #[arg(long)]
        static_dir: Option<PathBuf>,
    },

    /// Measure download throughput against a server
    Client {
        /// Download URL
        #[arg(short, long, default_value = DEFAULT_URL)]
        url: String,

        /// Number of sequential downloads
        #[arg(short = 'n', long, default_value = "3")]
        iter: usize,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            tls_port,
            quic,
            cert,
            key,
            cache,
            generate_cert,
            static_dir,
        } => {
            let mut config = ServerConfig::new(port);

            if let Some(addr) = bind {
                config = config.with_bind_addr(addr);
            }
            if let Some(tls_port) = tls_port {
                config = config.with_tls_port(tls_port);
            }
            if let Some(quic) = quic {
                config = config.with_quic_port(if quic == 0 { port } else { quic });
            }
            if let (Some(cert), Some(key)) = (cert, key) {
                config = config.with_cert_files(cert, key);
            }
            if generate_cert {
                config = config.with_generated_cert(cache);
            }
            if let Some(dir) = static_dir {
                config = config.with_static_dir(dir);
            }

            let server = Server::new(config);
            let shutdown = server.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    shutdown.cancel();
                }
            });

            server.run().await?;
        }

        Commands::Client { url, iter, json } => {
            let config = ClientConfig::new(url).with_iterations(iter).with_json(json);

            let client = Client::new(config)?;
            client.run().await?;
        }
    }

    Ok(())
}
