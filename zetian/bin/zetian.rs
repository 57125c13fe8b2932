use std::path::PathBuf;

use zetian::{Server, ZetianConfig};
use zetian_common::internal;

fn usage() -> ! {
    eprintln!("usage: zetian [config.ron]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    zetian_common::logging::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        None => ZetianConfig::default(),
        Some(path) if path == "-h" || path == "--help" => usage(),
        Some(path) => ZetianConfig::load(&PathBuf::from(path))?,
    };
    if args.next().is_some() {
        usage();
    }

    let server = Server::new(config);
    let shutdown = server.shutdown_sender();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("signal handler installation");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        internal!(level = INFO, "Shutdown signal received");
        let _ = shutdown.send(zetian_common::Signal::Shutdown);
    });

    server.serve().await
}
