//! Assembles and runs a complete load balancer from a configuration.

use crate::admin::{AdminConsole, ConsoleContext};
use crate::backend::algorithms::{build_algorithm, AlgorithmChain, AlgorithmContext};
use crate::backend::{Dispatcher, DispatcherHandle, TargetRegistry};
use crate::config::Config;
use crate::frontend::FrontendListener;
use crate::health::{build_probe, HealthChecker};
use crate::metrics::{MetricsCollector, MetricsServer};
use crate::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

/// Errors that prevent the balancer from starting.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind {what} on {address}: {source}")]
    Bind {
        what: &'static str,
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// A running load balancer.
///
/// Created with [`Balancer::start`]; stopped with [`Balancer::shutdown`].
pub struct Balancer {
    registry: Arc<TargetRegistry>,
    chain: AlgorithmChain,
    dispatcher: DispatcherHandle,
    metrics: MetricsCollector,
    shutdown: ShutdownSignal,
    listen_addr: SocketAddr,
    control_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Balancer {
    /// Build every component and start its tasks. Must run inside a tokio
    /// runtime.
    pub async fn start(config: Config) -> Result<Self, StartError> {
        let shutdown = ShutdownSignal::new();
        let metrics = MetricsCollector::new();

        // Targets need the chain before the algorithms, which need the targets.
        let chain = AlgorithmChain::new();
        let registry = Arc::new(TargetRegistry::from_config(&config, chain.clone()));
        let (dispatcher, dispatcher_handle) = Dispatcher::new(chain.clone(), metrics.clone());

        let ctx = AlgorithmContext {
            registry: Arc::clone(&registry),
            dispatcher: dispatcher_handle.clone(),
            connect_timeout: config.connect_timeout,
            metrics: metrics.clone(),
        };
        let algorithms: Vec<_> = config
            .algorithms
            .iter()
            .map(|algorithm| build_algorithm(algorithm, &ctx))
            .collect();
        chain.set(algorithms.clone());
        for algorithm in algorithms {
            info!(algorithm = algorithm.name(), "starting distribution algorithm");
            algorithm.start(&shutdown);
        }

        let mut tasks = vec![tokio::spawn(dispatcher.run(shutdown.subscribe()))];

        let listener = FrontendListener::bind(config.listen, dispatcher_handle.clone())
            .await
            .map_err(|source| StartError::Bind {
                what: "listen socket",
                address: config.listen,
                source,
            })?;
        let listen_addr = listener.local_addr().map_err(|source| StartError::Bind {
            what: "listen socket",
            address: config.listen,
            source,
        })?;
        tasks.push(tokio::spawn(listener.run(shutdown.subscribe())));

        if let Some(health) = &config.health_check {
            let checker = HealthChecker::new(
                Arc::clone(&registry),
                build_probe(health),
                health.interval,
                health.timeout,
                metrics.clone(),
            );
            tasks.push(tokio::spawn(checker.run(shutdown.subscribe())));
        }

        let mut control_addr = None;
        if let Some(control) = config.control.as_ref().filter(|c| c.enabled) {
            let console = AdminConsole::bind(
                control.address,
                ConsoleContext {
                    registry: Arc::clone(&registry),
                    chain: chain.clone(),
                    dispatcher: dispatcher_handle.clone(),
                },
            )
            .await
            .map_err(|source| StartError::Bind {
                what: "admin console",
                address: control.address,
                source,
            })?;
            control_addr = console.local_addr().ok();
            tasks.push(tokio::spawn(console.run(shutdown.subscribe())));
        }

        let mut metrics_addr = None;
        let metrics_config = &config.global.metrics;
        if metrics_config.enabled {
            let server = MetricsServer::bind(
                metrics_config.address,
                metrics_config.path.clone(),
                metrics.clone(),
                Arc::clone(&registry),
            )
            .await
            .map_err(|source| StartError::Bind {
                what: "metrics server",
                address: metrics_config.address,
                source,
            })?;
            metrics_addr = server.local_addr().ok();
            tasks.push(tokio::spawn(server.run(shutdown.subscribe())));
        }

        info!(
            listen = %listen_addr,
            groups = registry.group_count(),
            targets = registry.targets().len(),
            algorithms = chain.len(),
            "tcplb is running"
        );

        Ok(Self {
            registry,
            chain,
            dispatcher: dispatcher_handle,
            metrics,
            shutdown,
            listen_addr,
            control_addr,
            metrics_addr,
            tasks,
        })
    }

    /// Address clients connect to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn chain(&self) -> &AlgorithmChain {
        &self.chain
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Stop accepting clients and wait for the long-lived tasks to exit.
    pub async fn shutdown(self) {
        self.shutdown.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("tcplb shut down complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = parse_config(
            r#"
listen: "127.0.0.1:0"
target_groups:
  - targets: ["127.0.0.1:9001", "127.0.0.1:9002"]
  - targets: ["127.0.0.1:9003"]
algorithms:
  - type: sticky_hash
  - type: round_robin
control:
  address: "127.0.0.1:0"
"#,
        )
        .unwrap();

        let balancer = Balancer::start(config).await.unwrap();
        assert_ne!(balancer.listen_addr().port(), 0);
        assert!(balancer.control_addr().is_some());
        assert!(balancer.metrics_addr().is_none());
        assert_eq!(balancer.chain().len(), 2);
        assert_eq!(balancer.registry().targets().len(), 3);

        balancer.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = parse_config(&format!(
            "listen: \"{}\"\ntarget_groups:\n  - targets: [\"127.0.0.1:9001\"]\n",
            taken.local_addr().unwrap()
        ))
        .unwrap();

        let error = Balancer::start(config).await.err().unwrap();
        assert!(matches!(error, StartError::Bind { what: "listen socket", .. }));
    }
}
