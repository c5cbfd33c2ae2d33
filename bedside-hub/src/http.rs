use std::sync::Arc;

use bedside_ble::GattLink;
use embedded_hal::digital::OutputPin;

use crate::routes::App;

pub type HttpResult<E = std::io::Error> = Result<HttpResponse, E>;

pub type HttpResponse =
    hyper::Response<http_body_util::combinators::BoxBody<hyper::body::Bytes, std::io::Error>>;

/// Serve until `shutdown` resolves
pub async fn run_server<L, P, F>(
    listener: tokio::net::TcpListener,
    app: Arc<App<L, P>>,
    shutdown: F,
) -> std::io::Result<()>
where
    L: GattLink + 'static,
    P: OutputPin + Send + 'static,
    F: Future<Output = ()>,
{
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            val = listener.accept() => {
                match val {
                    Ok((stream, _addr)) => {
                        tokio::task::spawn(handle_connection(stream, app.clone()));
                    },
                    Err(e) => {
                        tracing::error!("failed to accept: {e:?}");
                        continue;
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutting down http server");
                return Ok(());
            }
        }
    }
}

async fn handle_connection<L, P>(stream: tokio::net::TcpStream, app: Arc<App<L, P>>)
where
    L: GattLink + 'static,
    P: OutputPin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);

    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::tokio::TokioExecutor::new());
    // hyper does not pipeline http/1.1 requests, so requests on one connection
    // reach the session one at a time anyway; the session lock orders requests
    // across connections.
    let conn = builder.serve_connection(
        io,
        hyper::service::service_fn(|r| handle_request(r, app.clone())),
    );

    if let Err(e) = conn.await {
        tracing::debug!("connection error: {e:?}");
    }
}

async fn handle_request<L, P>(
    r: hyper::Request<hyper::body::Incoming>,
    app: Arc<App<L, P>>,
) -> HttpResult
where
    L: GattLink + 'static,
    P: OutputPin + Send + 'static,
{
    let path = r.uri().path();
    if path == "/" {
        tracing::debug!("{} {path}", r.method());
    } else {
        tracing::info!("{} {path}", r.method());
    }

    let mut resp = app.handle(r.method(), path).await?;
    resp.headers_mut().insert(
        hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        hyper::header::HeaderValue::from_static("*"),
    );
    Ok(resp)
}

pub fn json<T: serde::Serialize>(o: T) -> HttpResult {
    json_with_status(o, hyper::StatusCode::OK)
}

pub fn json_with_status<T: serde::Serialize>(o: T, status: hyper::StatusCode) -> HttpResult {
    let bytes = match serde_json::to_vec(&o) {
        Ok(v) => v,
        Err(e) => return server_error_(format!("failed to serialize json: {e:?}")),
    };
    let mut r = bytes_to_resp(bytes, status)?;
    r.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(r)
}

pub fn server_error_(s: String) -> HttpResult {
    bytes_to_resp(s.into_bytes(), hyper::StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn bytes_to_resp(bytes: Vec<u8>, status: hyper::StatusCode) -> HttpResult {
    use http_body_util::BodyExt;

    let mut r = hyper::Response::new(
        http_body_util::Full::new(hyper::body::Bytes::from(bytes))
            .map_err(|e| match e {})
            .boxed(),
    );
    *r.status_mut() = status;
    Ok(r)
}

pub fn not_found_(m: String) -> HttpResult {
    bytes_to_resp(m.into_bytes(), hyper::StatusCode::NOT_FOUND)
}

#[macro_export]
macro_rules! not_found {
    ($($t:tt)*) => {{
        bedside_hub::http::not_found_(format!($($t)*))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedside_ble::SimulatedBed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: bed\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp.to_lowercase()
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Arc::new(App::simulated(SimulatedBed::new()));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run_server(listener, app, async {
            let _ = stopped.await;
        }));

        let resp = get(addr, "/").await;
        assert!(resp.starts_with("http/1.1 200"), "{resp}");
        assert!(resp.contains("access-control-allow-origin: *"));
        assert!(resp.ends_with("this is my bed controller"));

        let resp = get(addr, "/moveUpper/30").await;
        assert!(resp.starts_with("http/1.1 200"), "{resp}");
        assert!(resp.contains("content-type: application/json"));
        assert!(resp.contains(r#""upper_height":30"#));

        let resp = get(addr, "/nope").await;
        assert!(resp.starts_with("http/1.1 404"), "{resp}");
        assert!(resp.contains("access-control-allow-origin: *"));

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
