//! Standalone relay server binary
//!
//! Run with:
//!   cargo run --bin relay-server -- --port 9440
//!
//! With TLS:
//!   cargo run --bin relay-server -- --port 9443 --cert cert.pem --key key.pem

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn, Level};

use huddle::network::RelayServer;

/// Relay server for huddle match coordination
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Relay server for huddle match coordination")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "9440")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Load TLS certificates from PEM file
fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            rustls_pemfile::Item::Pkcs8Key(key) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            rustls_pemfile::Item::Sec1Key(key) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            _ => continue,
        }
    }

    Err("No private key found in file".into())
}

/// Create TLS acceptor from certificate and key files
fn create_tls_acceptor(
    cert_path: &PathBuf,
    key_path: &PathBuf,
) -> Result<TlsAcceptor, Box<dyn std::error::Error>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    // Create server address
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    // Check TLS configuration
    let tls_acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --cert and --key must be provided for TLS");
            return Err("TLS configuration incomplete".into());
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            warn!("For production, use --cert and --key to enable TLS");
            None
        }
    };

    info!("Relay server starting on {}", addr);
    if tls_acceptor.is_some() {
        info!("Protocol: wss:// (WebSocket Secure)");
    } else {
        info!("Protocol: ws:// (WebSocket)");
    }

    let server = RelayServer::new();
    if let Some(acceptor) = tls_acceptor {
        server.run_tls(&addr.to_string(), acceptor).await?;
    } else {
        server.run(&addr.to_string()).await?;
    }

    Ok(())
}
