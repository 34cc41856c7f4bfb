//! Service lifecycle: three listeners, one idempotent shutdown.
//!
//! ```text
//! Initialized ──run()──▶ Running ──first trigger──▶ ShuttingDown ──exit──▶ Stopped
//! ```
//!
//! A [`Service`] owns three route tables (public, readiness, internal) and
//! serves each on its own listener task. Shutdown starts on the first of:
//!
//! - an OS termination signal (SIGTERM, Ctrl-C),
//! - the cancellation future passed to [`Service::run`] resolving,
//! - any listener returning while the service is still running,
//! - a request to the quit endpoint.
//!
//! Every source goes through [`ServiceHandle::fire`]. Only the first call
//! records a [`Trigger`]; later calls return `false` and change nothing, so
//! the exit function runs exactly once however many sources race.
//!
//! Once triggered, all listeners are closed through one shared flag, each
//! drains its open connections for at most the drain window, the state
//! gate's `shut_down` hook runs, and finally the exit function is called
//! with the trigger's exit code.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Method;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_DRAIN_WINDOW, DEFAULT_HEADER_READ_TIMEOUT, Ports, ServiceConfig, ServiceGlobals};
use crate::error::Error;
use crate::handler::{Handler, HandlerUtils, MetaFunc, empty_meta};
use crate::handlers::HandlerFactory;
use crate::logging;
use crate::metrics::{Metrics, PrometheusMetrics};
use crate::middleware::{AuthorizationFunc, CorsOptions, Middleware, MiddlewareWrapper};
use crate::router::Router;
use crate::server::{Server, closed, shutdown_signal};
use crate::state::{DefaultServiceState, ServiceState};
use crate::version::{BuildVersion, VersionBuilder};

/// Extra time, on top of the drain window, granted to listener tasks to
/// report back before shutdown moves on without them.
const LISTENER_EXIT_MARGIN: Duration = Duration::from_secs(1);

/// Middleware on every standard route.
const STANDARD_MIDDLEWARE: &[Middleware] = &[Middleware::PanicTo500, Middleware::NoCaching];

/// Called once with the exit code when shutdown completes.
pub type ExitFunc = Arc<dyn Fn(i32) + Send + Sync + 'static>;

fn process_exit(code: i32) {
    std::process::exit(code)
}

// ── Listeners and triggers ────────────────────────────────────────────────────

/// The three listeners of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Listener {
    Public,
    Readiness,
    Internal,
}

impl Listener {
    pub const ALL: [Listener; 3] = [Listener::Public, Listener::Readiness, Listener::Internal];

    /// Subsystem name used in metrics labels and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Readiness => "readiness",
            Self::Internal => "internal",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started the shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// SIGTERM or Ctrl-C.
    Signal,
    /// The cancellation future passed to [`Service::run`] resolved.
    Cancelled,
    /// A listener stopped serving while the service was running.
    ListenerExited(Listener),
    /// The quit endpoint was called.
    Quit,
}

impl Trigger {
    /// `1` when a listener died, `0` for every requested shutdown.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ListenerExited(_) => 1,
            Self::Signal | Self::Cancelled | Self::Quit => 0,
        }
    }
}

/// Where a [`Service`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecyclePhase {
    Initialized = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl LifecyclePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initialized,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

// ── ServiceHandle ─────────────────────────────────────────────────────────────

struct Shared {
    quitting: AtomicBool,
    intent: mpsc::Sender<Trigger>,
    phase: AtomicU8,
    addrs: Mutex<[Option<SocketAddr>; 3]>,
}

/// Cloneable view of a service that outlives [`Service::run`]'s borrow.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<Shared>,
}

impl ServiceHandle {
    /// A handle plus the receiving end of its shutdown intent. The channel
    /// holds one trigger; only the first `fire` ever sends.
    pub(crate) fn new() -> (Self, mpsc::Receiver<Trigger>) {
        let (tx, rx) = mpsc::channel(1);
        let shared = Shared {
            quitting: AtomicBool::new(false),
            intent: tx,
            phase: AtomicU8::new(LifecyclePhase::Initialized as u8),
            addrs: Mutex::new([None; 3]),
        };
        (Self { shared: Arc::new(shared) }, rx)
    }

    /// Requests shutdown. Returns `true` only for the call that actually
    /// started it.
    pub fn fire(&self, trigger: Trigger) -> bool {
        if self.shared.quitting.swap(true, Ordering::AcqRel) {
            debug!(?trigger, "shutdown already requested, ignoring trigger");
            return false;
        }
        if let Err(e) = self.shared.intent.try_send(trigger) {
            // Only reachable once the service has been dropped.
            warn!(?trigger, "shutdown intent not delivered: {e}");
        }
        true
    }

    /// Whether any trigger has fired.
    pub fn is_quitting(&self) -> bool {
        self.shared.quitting.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// The address `listener` is bound to, once it is.
    pub fn local_addr(&self, listener: Listener) -> Option<SocketAddr> {
        self.shared.addrs.lock().ok().and_then(|addrs| addrs[listener.index()])
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        self.shared.phase.store(phase as u8, Ordering::Release);
    }

    fn set_local_addr(&self, listener: Listener, addr: SocketAddr) {
        if let Ok(mut addrs) = self.shared.addrs.lock() {
            addrs[listener.index()] = Some(addr);
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Everything a [`Service`] is built from.
///
/// [`ServiceOptions::new`] fills in the defaults: always-ready state gate,
/// `?` build version, Prometheus metrics namespaced by the app name, exit
/// through [`std::process::exit`].
pub struct ServiceOptions {
    pub ports: Ports,
    pub globals: ServiceGlobals,
    pub cors: CorsOptions,
    /// `None` builds a [`PrometheusMetrics`] for the app name.
    pub metrics: Option<Arc<dyn Metrics>>,
    pub state: Arc<dyn ServiceState>,
    pub version: Arc<dyn VersionBuilder>,
    pub authorize: Option<AuthorizationFunc>,
    pub exit: ExitFunc,
    pub drain_window: Duration,
    pub header_read_timeout: Duration,
}

impl ServiceOptions {
    pub fn new(ports: Ports, globals: ServiceGlobals) -> Self {
        Self {
            ports,
            globals,
            cors: CorsOptions::default(),
            metrics: None,
            state: Arc::new(DefaultServiceState),
            version: Arc::new(BuildVersion::from_lookup(|_| None)),
            authorize: None,
            exit: Arc::new(process_exit),
            drain_window: DEFAULT_DRAIN_WINDOW,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }

    /// Options for `config`, with the build version attached to the globals.
    pub fn from_config(config: &ServiceConfig, version: BuildVersion) -> Self {
        let mut globals = config.globals.clone();
        globals.version_number = version.version_number.clone();
        let mut options = Self::new(config.ports(), globals);
        options.cors.allowed_origins = config.cors_origins.clone();
        options.version = Arc::new(version);
        options
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

struct Listeners<T> {
    public: T,
    readiness: T,
    internal: T,
}

impl<T> Listeners<T> {
    fn get_mut(&mut self, listener: Listener) -> &mut T {
        match listener {
            Listener::Public => &mut self.public,
            Listener::Readiness => &mut self.readiness,
            Listener::Internal => &mut self.internal,
        }
    }
}

/// A runnable service with the standard operational routes registered.
pub struct Service {
    name: String,
    routers: Listeners<Router>,
    wrapper: MiddlewareWrapper,
    handlers: HandlerFactory,
    ports: Ports,
    state: Arc<dyn ServiceState>,
    version: Arc<dyn VersionBuilder>,
    exit: ExitFunc,
    drain_window: Duration,
    header_read_timeout: Duration,
    handle: ServiceHandle,
    intent: mpsc::Receiver<Trigger>,
}

impl Service {
    /// Builds the service and registers the standard routes:
    ///
    /// | Listener | Paths |
    /// |---|---|
    /// | public | `/`, `/service/version`, `/service/liveness`, `/service/readiness` |
    /// | readiness | `/`, `/service/liveness`, `/service/readiness` |
    /// | internal | `/`, `/health_check`, `/healthz`, `/metrics`, `/quit` |
    pub fn new(name: &str, options: ServiceOptions) -> Result<Self, Error> {
        let ServiceOptions {
            ports,
            globals,
            cors,
            metrics,
            state,
            version,
            authorize,
            exit,
            drain_window,
            header_read_timeout,
        } = options;

        let metrics: Arc<dyn Metrics> = match metrics {
            Some(m) => m,
            None => Arc::new(PrometheusMetrics::new(&globals.app_name)?),
        };
        let globals = Arc::new(globals);
        let utils = HandlerUtils::new(empty_meta(), Arc::clone(&metrics), Arc::clone(&globals));

        let (handle, intent) = ServiceHandle::new();
        let handlers = HandlerFactory::new(Arc::clone(&version), Arc::clone(&state), metrics, handle.clone());

        let mut service = Self {
            name: name.to_owned(),
            routers: Listeners {
                public: Router::new(utils.clone()),
                readiness: Router::new(utils.clone()),
                internal: Router::new(utils),
            },
            wrapper: MiddlewareWrapper::new(globals, cors, authorize),
            handlers,
            ports,
            state,
            version,
            exit,
            drain_window,
            header_read_timeout,
            handle,
            intent,
        };
        service.register_standard_routes()?;
        Ok(service)
    }

    /// Reads configuration and build metadata from the environment, installs
    /// the log subscriber and builds the service.
    pub fn from_env(name: &str) -> Result<Self, Error> {
        let config = ServiceConfig::from_env(name);
        logging::init(&config.log_min_filter);
        Self::new(name, ServiceOptions::from_config(&config, BuildVersion::from_env()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// The route table served on `listener`.
    pub fn router(&self, listener: Listener) -> &Router {
        match listener {
            Listener::Public => &self.routers.public,
            Listener::Readiness => &self.routers.readiness,
            Listener::Internal => &self.routers.internal,
        }
    }

    fn register_standard_routes(&mut self) -> Result<(), Error> {
        use Listener::{Internal, Public, Readiness};

        let h = self.handlers.clone();
        let get = &[Method::GET];

        self.register(Public, "root", &["/"], get, STANDARD_MIDDLEWARE, None, h.root())?;
        self.register(Public, "version", &["/service/version"], get, STANDARD_MIDDLEWARE, None, h.version())?;
        self.register(Public, "liveness", &["/service/liveness"], get, STANDARD_MIDDLEWARE, None, h.liveness())?;
        self.register(Public, "readiness", &["/service/readiness"], get, STANDARD_MIDDLEWARE, None, h.readiness())?;

        self.register(Readiness, "root", &["/"], get, STANDARD_MIDDLEWARE, None, h.root())?;
        self.register(Readiness, "liveness", &["/service/liveness"], get, STANDARD_MIDDLEWARE, None, h.liveness())?;
        self.register(Readiness, "readiness", &["/service/readiness"], get, STANDARD_MIDDLEWARE, None, h.readiness())?;

        self.register(Internal, "root", &["/"], get, STANDARD_MIDDLEWARE, None, h.root())?;
        self.register(Internal, "health_check", &["/health_check", "/healthz"], get, STANDARD_MIDDLEWARE, None, h.health())?;
        self.register(Internal, "metrics", &["/metrics"], get, STANDARD_MIDDLEWARE, None, h.metrics())?;
        self.register(Internal, "quit", &["/quit"], get, STANDARD_MIDDLEWARE, None, h.quit())?;
        Ok(())
    }

    /// Registers `handler` on the public listener for every path and method.
    ///
    /// `middlewares` wrap in list order, so the last one runs outermost. When
    /// `methods` lacks `OPTIONS`, a no-op preflight route is added on each
    /// path as well, wrapped with CORS when the route uses it. Preflight
    /// routes never overwrite an `OPTIONS` route that already exists.
    pub fn add_route(
        &mut self,
        name: &str,
        paths: &[&str],
        methods: &[Method],
        middlewares: &[Middleware],
        meta_func: Option<MetaFunc>,
        handler: impl Handler,
    ) -> Result<(), Error> {
        self.register(Listener::Public, name, paths, methods, middlewares, meta_func, handler)
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        listener: Listener,
        name: &str,
        paths: &[&str],
        methods: &[Method],
        middlewares: &[Middleware],
        meta_func: Option<MetaFunc>,
        handler: impl Handler,
    ) -> Result<(), Error> {
        let subsystem = listener.as_str();
        let meta_func = meta_func.unwrap_or_else(empty_meta);
        let wrapped = self
            .wrapper
            .compose(subsystem, name, middlewares, handler.into_boxed_handler(), &meta_func);

        let preflight = (!methods.contains(&Method::OPTIONS)).then(|| {
            let cors: &[Middleware] = if middlewares.contains(&Middleware::Cors) { &[Middleware::Cors] } else { &[] };
            self.wrapper
                .compose(subsystem, name, cors, self.handlers.preflight().into_boxed_handler(), &meta_func)
        });

        let router = self.routers.get_mut(listener);
        for path in paths {
            for method in methods {
                router.handle(method.clone(), path, Arc::clone(&meta_func), Arc::clone(&wrapped))?;
            }
            if let Some(preflight) = &preflight {
                if router.contains(&Method::OPTIONS, path) {
                    continue;
                }
                router.handle(Method::OPTIONS, path, Arc::clone(&meta_func), Arc::clone(preflight))?;
            }
        }
        Ok(())
    }

    /// Serves all three listeners until the first shutdown trigger, then
    /// shuts down and calls the exit function. Returns the trigger that won.
    ///
    /// `cancel` stops the service when it resolves; pass
    /// [`std::future::pending`] to rely on signals and `/quit` alone.
    /// With the default exit function the process ends inside this call.
    pub async fn run<F>(self, cancel: F) -> Trigger
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            name,
            routers,
            ports,
            state,
            version,
            exit,
            drain_window,
            header_read_timeout,
            handle,
            mut intent,
            ..
        } = self;

        info!(service = %name, "{name}: {}", version.to_display());
        state.warm_up();
        handle.set_phase(LifecyclePhase::Running);

        let (close, closing) = watch::channel(false);
        let mut listeners = JoinSet::new();
        let Listeners { public, readiness, internal } = routers;
        for (listener, router, addr) in [
            (Listener::Public, public, ports.public),
            (Listener::Readiness, readiness, ports.readiness),
            (Listener::Internal, internal, ports.internal),
        ] {
            let handle = handle.clone();
            let closing = closing.clone();
            listeners.spawn(async move {
                let result = match Server::bind(listener.as_str(), addr).await {
                    Ok(server) => {
                        handle.set_local_addr(listener, server.local_addr());
                        server
                            .header_read_timeout(header_read_timeout)
                            .drain_window(drain_window)
                            .serve(router, closing.clone())
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    error!(%listener, "listener failed: {e}");
                }
                if !*closing.borrow() {
                    handle.fire(Trigger::ListenerExited(listener));
                }
            });
        }

        let sources = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown_signal() => {
                        debug!("termination signal received");
                        handle.fire(Trigger::Signal);
                    }
                    () = cancel => {
                        debug!("run cancelled by caller");
                        handle.fire(Trigger::Cancelled);
                    }
                    () = closed(closing) => {}
                }
            })
        };

        // The sender lives in `handle`, so the channel cannot close here.
        let trigger = intent.recv().await.unwrap_or(Trigger::Cancelled);
        info!(service = %name, ?trigger, "shutting down");
        handle.set_phase(LifecyclePhase::ShuttingDown);

        close.send_replace(true);
        let drained = tokio::time::timeout(drain_window + LISTENER_EXIT_MARGIN, async {
            while listeners.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(service = %name, "listeners did not stop within the drain window");
            listeners.abort_all();
        }
        sources.abort();

        state.shut_down();
        let code = trigger.exit_code();
        debug!(service = %name, code, "performing service exit");
        handle.set_phase(LifecyclePhase::Stopped);
        exit(code);
        trigger
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn service() -> Service {
        let ports = Ports::ephemeral(Ipv4Addr::LOCALHOST.into());
        let mut options = ServiceOptions::new(ports, ServiceGlobals { app_name: "orders".into(), ..Default::default() });
        options.exit = Arc::new(|_: i32| {});
        Service::new("orders", options).unwrap()
    }

    fn registered(s: &Service, listener: Listener) -> Vec<(Method, String)> {
        s.router(listener).routes().to_vec()
    }

    #[test]
    fn standard_routes_per_listener() {
        let s = service();
        let internal = registered(&s, Listener::Internal);
        for path in ["/", "/health_check", "/healthz", "/metrics", "/quit"] {
            assert!(internal.contains(&(Method::GET, path.to_owned())), "{path}");
            assert!(internal.contains(&(Method::OPTIONS, path.to_owned())), "{path}");
        }
        let readiness = registered(&s, Listener::Readiness);
        assert!(readiness.contains(&(Method::GET, "/service/readiness".to_owned())));
        assert!(!readiness.contains(&(Method::GET, "/service/version".to_owned())));
        let public = registered(&s, Listener::Public);
        assert!(public.contains(&(Method::GET, "/service/version".to_owned())));
    }

    #[test]
    fn get_only_route_gains_preflight() {
        let mut s = service();
        s.add_route("do", &["/do"], &[Method::GET], STANDARD_MIDDLEWARE, None, |_req: crate::Request| async { "done" })
            .unwrap();
        let public = registered(&s, Listener::Public);
        assert!(public.contains(&(Method::GET, "/do".to_owned())));
        assert!(public.contains(&(Method::OPTIONS, "/do".to_owned())));
    }

    #[test]
    fn explicit_options_is_not_duplicated() {
        let mut s = service();
        s.add_route(
            "do",
            &["/do"],
            &[Method::GET, Method::OPTIONS],
            &[],
            None,
            |_req: crate::Request| async { "done" },
        )
        .unwrap();
        let options = s
            .router(Listener::Public)
            .routes()
            .iter()
            .filter(|(m, p)| *m == Method::OPTIONS && p == "/do")
            .count();
        assert_eq!(options, 1);
    }

    #[test]
    fn preflight_skips_existing_options_route() {
        let mut s = service();
        s.add_route("a", &["/shared"], &[Method::OPTIONS], &[], None, |_req: crate::Request| async { "a" })
            .unwrap();
        s.add_route("b", &["/shared"], &[Method::GET], &[], None, |_req: crate::Request| async { "b" })
            .unwrap();
        assert_eq!(registered(&s, Listener::Public).len(), registered(&service(), Listener::Public).len() + 2);
    }

    #[test]
    fn conflicting_route_is_an_error() {
        let mut s = service();
        let err = s
            .add_route("dup", &["/service/version"], &[Method::GET], &[], None, |_req: crate::Request| async { "x" })
            .unwrap_err();
        assert!(matches!(err, Error::Route { .. }));
    }

    #[test]
    fn first_trigger_wins() {
        let (handle, mut rx) = ServiceHandle::new();
        assert!(handle.fire(Trigger::Cancelled));
        assert!(!handle.fire(Trigger::Signal));
        assert!(!handle.fire(Trigger::ListenerExited(Listener::Public)));
        assert_eq!(rx.try_recv().unwrap(), Trigger::Cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Trigger::Signal.exit_code(), 0);
        assert_eq!(Trigger::Quit.exit_code(), 0);
        assert_eq!(Trigger::ListenerExited(Listener::Internal).exit_code(), 1);
    }
}
