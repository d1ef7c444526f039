use std::future::Future;
use std::pin::Pin;

use crate::http::request::Request;
use crate::http::response::Response;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// The application side of an exchange.
///
/// Implemented for any `Fn(Request, Response) -> impl Future<Output =
/// anyhow::Result<()>>`, so a plain `async fn` works:
///
/// ```
/// use sentinel_h1::http::{Request, Response};
///
/// async fn hello(_req: Request, mut res: Response) -> anyhow::Result<()> {
///     res.write(b"hello").await?;
///     Ok(())
/// }
/// # fn assert_handler<H: sentinel_h1::http::Handler>(_: H) {}
/// # assert_handler(hello);
/// ```
///
/// Returning an error before any response byte was sent produces a `500`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, response: Response) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(&self, request: Request, response: Response) -> HandlerFuture {
        Box::pin(self(request, response))
    }
}
