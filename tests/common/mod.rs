//! Shared helpers for the integration tests.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use service_foundation::{Listener, Ports, ServiceGlobals, ServiceHandle, ServiceOptions};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// A response read to the end.
#[allow(dead_code)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    #[allow(dead_code)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Exit codes passed to the service's exit function, in call order.
pub type Exits = Arc<Mutex<Vec<i32>>>;

/// Options binding all three listeners to free localhost ports, with a short
/// drain window and an exit function that only records its code.
pub fn test_options() -> (ServiceOptions, Exits) {
    let ports = Ports::ephemeral(Ipv4Addr::LOCALHOST.into());
    let globals = ServiceGlobals {
        app_name: "orders".into(),
        server_name: "test-node".into(),
        deploy_environment: "test".into(),
        version_number: "1.0.0".into(),
        ..Default::default()
    };
    let mut options = ServiceOptions::new(ports, globals);
    options.drain_window = Duration::from_millis(500);

    let exits: Exits = Arc::default();
    let recorded = Arc::clone(&exits);
    options.exit = Arc::new(move |code: i32| recorded.lock().unwrap().push(code));
    (options, exits)
}

/// A cancellation future for [`Service::run`](service_foundation::Service::run)
/// that resolves when the sender fires or is dropped.
#[allow(dead_code)]
pub fn cancellation() -> (oneshot::Sender<()>, impl Future<Output = ()> + Send + 'static) {
    let (tx, rx) = oneshot::channel();
    (tx, async move {
        let _ = rx.await;
    })
}

/// Waits until every listener of `handle` has bound, returning
/// `[public, readiness, internal]`.
#[allow(dead_code)]
pub async fn wait_for_listeners(handle: &ServiceHandle) -> [SocketAddr; 3] {
    for _ in 0..500 {
        let addrs = Listener::ALL.map(|l| handle.local_addr(l));
        if let [Some(public), Some(readiness), Some(internal)] = addrs {
            return [public, readiness, internal];
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("listeners did not bind in time");
}

/// Sends one request over a fresh HTTP/1.1 connection.
pub async fn send(addr: SocketAddr, method: Method, path: &str, headers: &[(&str, &str)]) -> Reply {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut req = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", addr.to_string());
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    let res = sender.send_request(req.body(Empty::<Bytes>::new()).unwrap()).await.unwrap();

    let (parts, body) = res.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Reply { status: parts.status, headers: parts.headers, body }
}

#[allow(dead_code)]
pub async fn get(addr: SocketAddr, path: &str) -> Reply {
    send(addr, Method::GET, path, &[]).await
}
