//! HTTP/1.x transport.
//!
//! The submitter POSTs an empty body to `http://host:port/` through a pooled
//! client; the server answers `200 OK` to every request and counts one unit
//! per request. Only HTTP/1.x is spoken on either side.

use super::tcp::{bind_target, set_keepalive};
use super::{Connection, Listener, ServeContext, Submitter};
use crate::config::TargetConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use socket2::SockRef;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

/// Issues one request per unit of work.
#[derive(Debug)]
pub struct HttpSubmitter {
    client: Client<HttpConnector, Empty<Bytes>>,
    uri: Uri,
    target: String,
    timeout: Duration,
}

impl HttpSubmitter {
    pub fn new(target: &TargetConfig) -> Result<Self> {
        let url = format!("http://{}/", target.addr());
        let uri: Uri = url.parse().map_err(|e| HarnessError::Connect {
            addr: target.addr(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(target.timeout));
        connector.set_keepalive(target.keep_alive());
        connector.set_nodelay(true);

        let mut builder = Client::builder(TokioExecutor::new());
        if !target.keep_alives {
            builder.pool_max_idle_per_host(0);
        }

        Ok(Self {
            client: builder.build(connector),
            uri,
            target: url,
            timeout: target.timeout,
        })
    }
}

#[async_trait]
impl Submitter for HttpSubmitter {
    async fn submit_once(&self) -> Result<()> {
        let request = Request::post(self.uri.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| HarnessError::Http(Box::new(e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "HTTP request timed out"))?
            .map_err(|e| HarnessError::Http(Box::new(e)))?;

        let status = response.status();
        response
            .into_body()
            .collect()
            .await
            .map_err(|e| HarnessError::Http(Box::new(e)))?;

        if !status.is_success() {
            return Err(HarnessError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }

    fn target(&self) -> &str {
        &self.target
    }
}

/// Accepts HTTP/1.x connections.
#[derive(Debug)]
pub struct HttpListener {
    listener: TcpListener,
    keep_alive: Option<Duration>,
}

impl HttpListener {
    pub async fn bind(target: &TargetConfig) -> Result<Self> {
        Ok(Self {
            listener: bind_target(target).await?,
            keep_alive: target.keep_alive(),
        })
    }
}

#[async_trait]
impl Listener for HttpListener {
    type Conn = HttpConnection;

    async fn accept(&mut self) -> io::Result<HttpConnection> {
        let (stream, peer) = self.listener.accept().await?;
        trace!(peer = %peer, "Accepted HTTP connection");

        if let Err(e) = set_keepalive(SockRef::from(&stream), self.keep_alive) {
            debug!(peer = %peer, error = %e, "Failed to set keep-alive");
        }

        Ok(HttpConnection {
            stream,
            peer,
            keep_alive: self.keep_alive.is_some(),
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// One accepted HTTP/1.x connection, possibly carrying many requests.
#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    keep_alive: bool,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn serve(self, ctx: ServeContext) -> Result<()> {
        let progress = ctx.progress.clone();
        let service = service_fn(move |_request: Request<Incoming>| {
            let progress = progress.clone();
            async move {
                progress.record();
                Ok::<_, Infallible>(Response::new(Empty::<Bytes>::new()))
            }
        });

        let conn = http1::Builder::new()
            .keep_alive(self.keep_alive)
            .serve_connection(TokioIo::new(self.stream), service);
        let mut conn = std::pin::pin!(conn);

        let mut draining = false;
        let result = loop {
            tokio::select! {
                result = conn.as_mut() => break result,
                _ = ctx.shutdown.cancelled(), if !draining => {
                    draining = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        };

        match result {
            Err(e) if e.is_parse() => Err(HarnessError::Http(Box::new(e))),
            Err(e) => {
                // Peers resetting pooled connections is routine
                debug!(peer = %self.peer, error = %e, "HTTP connection ended with error");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}
