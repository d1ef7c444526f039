use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::server::Server;

/// Binds `addr` and serves connections until accepting fails.
pub async fn run(server: Server, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, server).await
}

/// Serves connections from an already bound listener.
pub async fn serve(listener: TcpListener, server: Server) -> anyhow::Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    let heartbeat = server.start_heartbeat();

    let result = accept_loop(&listener, &server).await;
    heartbeat.abort();
    result
}

async fn accept_loop(listener: &TcpListener, server: &Server) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        info!("Accepted connection from {}", peer);

        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve_connection(socket).await {
                error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
