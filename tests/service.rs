//! End-to-end lifecycle tests over real listeners.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Method, StatusCode};
use service_foundation::{LifecyclePhase, Listener, Middleware, Request, Response, Service, ServiceState, Trigger};
use tokio::net::TcpListener;

mod common;

const STANDARD: &[Middleware] = &[Middleware::PanicTo500, Middleware::NoCaching];

async fn run_until(task: tokio::task::JoinHandle<Trigger>) -> Trigger {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("service did not stop in time")
        .expect("run task panicked")
}

#[tokio::test]
async fn serves_route_with_preflight_and_stops_on_cancel() {
    let (options, exits) = common::test_options();
    let mut service = Service::new("orders", options).unwrap();
    service
        .add_route("do", &["/do"], &[Method::GET], STANDARD, None, |_req: Request| async {
            Response::status(StatusCode::OK)
        })
        .unwrap();
    let handle = service.handle();

    let (cancel, cancelled) = common::cancellation();
    let task = tokio::spawn(service.run(cancelled));
    let [public, readiness, internal] = common::wait_for_listeners(&handle).await;
    assert_eq!(handle.phase(), LifecyclePhase::Running);

    let res = common::get(public, "/do").await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.header("cache-control"), Some("max-age: 0, private"));
    assert!(res.header("expires").is_some());

    let res = common::send(public, Method::OPTIONS, "/do", &[]).await;
    assert_eq!(res.status, StatusCode::OK);
    assert!(res.body.is_empty());

    let res = common::get(public, "/nope").await;
    assert_eq!(res.status, StatusCode::NOT_FOUND);

    let res = common::get(readiness, "/service/readiness").await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body.as_ref(), br#""ok""#);

    let res = common::get(internal, "/healthz").await;
    assert_eq!(res.status, StatusCode::OK);

    let res = common::get(public, "/service/version").await;
    let version: serde_json::Value = serde_json::from_slice(&res.body).unwrap();
    assert_eq!(version["version"], "?");

    cancel.send(()).unwrap();
    assert_eq!(run_until(task).await, Trigger::Cancelled);
    assert_eq!(*exits.lock().unwrap(), [0]);
    assert_eq!(handle.phase(), LifecyclePhase::Stopped);
}

#[tokio::test]
async fn concurrent_triggers_exit_once() {
    let (options, exits) = common::test_options();
    let service = Service::new("orders", options).unwrap();
    let handle = service.handle();

    let (cancel, cancelled) = common::cancellation();
    let task = tokio::spawn(service.run(cancelled));
    common::wait_for_listeners(&handle).await;

    let fired = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.fire(Trigger::Signal) })
    };
    let _ = cancel.send(());
    let quit = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.fire(Trigger::Quit) })
    };

    let trigger = run_until(task).await;
    assert!(matches!(trigger, Trigger::Signal | Trigger::Cancelled | Trigger::Quit));
    fired.await.unwrap();
    quit.await.unwrap();
    assert!(!handle.fire(Trigger::Signal));

    assert_eq!(*exits.lock().unwrap(), [0]);
}

#[tokio::test]
async fn quit_answers_then_shuts_down() {
    let (options, exits) = common::test_options();
    let service = Service::new("orders", options).unwrap();
    let handle = service.handle();

    let task = tokio::spawn(service.run(std::future::pending()));
    let [_, _, internal] = common::wait_for_listeners(&handle).await;

    let res = common::get(internal, "/quit").await;
    assert_eq!(res.status, StatusCode::OK);

    assert_eq!(run_until(task).await, Trigger::Quit);
    assert_eq!(*exits.lock().unwrap(), [0]);
}

#[tokio::test]
async fn bind_failure_shuts_down_with_code_1() {
    let taken = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();

    let (mut options, exits) = common::test_options();
    options.ports.internal = taken.local_addr().unwrap();
    let service = Service::new("orders", options).unwrap();

    let trigger = run_until(tokio::spawn(service.run(std::future::pending()))).await;
    assert_eq!(trigger, Trigger::ListenerExited(Listener::Internal));
    assert_eq!(*exits.lock().unwrap(), [1]);
}

#[tokio::test]
async fn panicking_handler_answers_500_and_listener_survives() {
    let (options, _exits) = common::test_options();
    let mut service = Service::new("orders", options).unwrap();
    service
        .add_route(
            "boom",
            &["/boom"],
            &[Method::GET],
            &[Middleware::Counter, Middleware::RequestLogging, Middleware::PanicTo500],
            None,
            |req: Request| async move {
                if req.query() != Some("safe") {
                    panic!("boom");
                }
                "survived"
            },
        )
        .unwrap();
    let handle = service.handle();

    let (cancel, cancelled) = common::cancellation();
    let task = tokio::spawn(service.run(cancelled));
    let [public, _, internal] = common::wait_for_listeners(&handle).await;

    let res = common::get(public, "/boom").await;
    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(res.body.is_empty());

    let res = common::get(public, "/boom?safe").await;
    assert_eq!(res.body.as_ref(), b"survived");

    let res = common::get(internal, "/metrics").await;
    let text = String::from_utf8(res.body.to_vec()).unwrap();
    assert!(
        text.lines().any(|l| l.starts_with("orders_boom_total{") && l.contains(r#"status="200""#)),
        "{text}"
    );

    cancel.send(()).unwrap();
    assert_eq!(run_until(task).await, Trigger::Cancelled);
}

#[tokio::test]
async fn two_services_run_side_by_side() {
    let (first, _) = common::test_options();
    let (second, _) = common::test_options();
    let first = Service::new("orders", first).unwrap();
    let second = Service::new("billing", second).unwrap();
    let (first_handle, second_handle) = (first.handle(), second.handle());

    let (cancel_first, first_cancelled) = common::cancellation();
    let (cancel_second, second_cancelled) = common::cancellation();
    let first = tokio::spawn(first.run(first_cancelled));
    let second = tokio::spawn(second.run(second_cancelled));

    let a = common::wait_for_listeners(&first_handle).await;
    let b = common::wait_for_listeners(&second_handle).await;
    let distinct: HashSet<SocketAddr> = a.iter().chain(b.iter()).copied().collect();
    assert_eq!(distinct.len(), 6);

    for addr in [a[1], b[1]] {
        assert_eq!(common::get(addr, "/service/readiness").await.status, StatusCode::OK);
    }

    cancel_first.send(()).unwrap();
    cancel_second.send(()).unwrap();
    assert_eq!(run_until(first).await, Trigger::Cancelled);
    assert_eq!(run_until(second).await, Trigger::Cancelled);
}

/// Whether each address still accepts TCP connections.
fn accepting(addrs: &[SocketAddr]) -> Vec<bool> {
    addrs
        .iter()
        .map(|addr| std::net::TcpStream::connect_timeout(addr, Duration::from_millis(200)).is_ok())
        .collect()
}

/// State gate that records its lifecycle calls, and at shutdown whether the
/// listeners were still accepting.
struct RecordingState {
    events: Arc<Mutex<Vec<String>>>,
    addrs: Arc<Mutex<Vec<SocketAddr>>>,
}

impl ServiceState for RecordingState {
    fn is_live(&self) -> bool { true }
    fn is_ready(&self) -> bool { true }
    fn is_healthy(&self) -> bool { true }

    fn warm_up(&self) {
        self.events.lock().unwrap().push("warm_up".to_owned());
    }

    fn shut_down(&self) {
        let open = accepting(&self.addrs.lock().unwrap());
        self.events.lock().unwrap().push(format!("shut_down open={open:?}"));
    }
}

#[tokio::test]
async fn listeners_close_before_state_shutdown_and_exit() {
    let (mut options, _) = common::test_options();
    let events = Arc::new(Mutex::new(Vec::new()));
    let addrs = Arc::new(Mutex::new(Vec::new()));
    options.state = Arc::new(RecordingState { events: Arc::clone(&events), addrs: Arc::clone(&addrs) });
    let (recorded, seen) = (Arc::clone(&events), Arc::clone(&addrs));
    options.exit = Arc::new(move |code: i32| {
        let open = accepting(&seen.lock().unwrap());
        recorded.lock().unwrap().push(format!("exit {code} open={open:?}"));
    });

    let service = Service::new("orders", options).unwrap();
    let handle = service.handle();
    let task = tokio::spawn(service.run(std::future::pending()));

    let bound = common::wait_for_listeners(&handle).await;
    assert_eq!(accepting(&bound), [true, true, true]);
    *addrs.lock().unwrap() = bound.to_vec();

    assert!(handle.fire(Trigger::Signal));
    assert_eq!(run_until(task).await, Trigger::Signal);
    assert_eq!(
        *events.lock().unwrap(),
        [
            "warm_up",
            "shut_down open=[false, false, false]",
            "exit 0 open=[false, false, false]",
        ]
    );
}
