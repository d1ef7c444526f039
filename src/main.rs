use sentinel_h1::config::Config;
use sentinel_h1::http::request::Method;
use sentinel_h1::http::{Request, Response};
use sentinel_h1::server::{self, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let addr = cfg.listen_addr.clone();
    let server = Server::new(cfg, handle);

    tokio::select! {
        res = server::listener::run(server.clone(), &addr) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            server.shutdown();
        }
    }

    Ok(())
}

/// Echoes request bodies back; answers everything else with a greeting.
async fn handle(mut req: Request, mut res: Response) -> anyhow::Result<()> {
    res.insert_header("Content-Type", "text/plain")?;
    match req.method() {
        Method::POST | Method::PUT => {
            let body = req.body().read_to_end().await?;
            res.set_content_length(Some(body.len() as u64))?;
            res.write(&body).await?;
        }
        _ => res.write(b"Hello from Sentinel\n").await?,
    }
    Ok(())
}
