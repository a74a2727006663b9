use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use common::config::Configuration;
use common::{CatalogConnector, CatalogHandle};
use retention::{DatasetConnector, RetentionRunner};
use scheduler::ScheduleRegistry;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::connection::handle_connection;
use crate::controller::ControllerLink;
use crate::jobs::RetentionLauncher;
use crate::router::Router;

/// The storage service: a TCP endpoint for the controller plus the
/// scheduler and retention runner behind it.
pub struct StoragerAgent {
    config: Configuration,
    router: Arc<Router>,
    link: Arc<ControllerLink>,
    registry: Arc<ScheduleRegistry>,
}

impl StoragerAgent {
    pub fn new(
        config: Configuration,
        catalog: Arc<CatalogHandle>,
        connector: Arc<dyn CatalogConnector>,
        datasets: Arc<dyn DatasetConnector>,
    ) -> Result<Self> {
        let timezone = Tz::from_str(&config.schedule.timezone)
            .map_err(|e| anyhow!("Invalid schedule timezone: {e}"))?;

        let link = Arc::new(ControllerLink::new());
        let runner = Arc::new(RetentionRunner::new(catalog.clone(), datasets));
        let launcher = Arc::new(RetentionLauncher::new(runner, link.clone()));
        let registry = Arc::new(ScheduleRegistry::new(launcher, timezone));
        let router = Arc::new(Router::new(
            registry.clone(),
            catalog,
            connector,
            config.database.clone(),
            config.service.version.clone(),
        ));

        Ok(Self {
            config,
            router,
            link,
            registry,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = format!("{}:{}", self.config.service.bind, self.config.service.port);
        TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to listen on {address}"))
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept controller connections until TERMINATE or Ctrl-C.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        info!(
            context = %self.config.service.context,
            "Storage service listening on {local}"
        );

        let shutdown = self.router.shutdown_signal();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, addr) = accepted.context("Listener failed")?;
                    info!("Controller connected from {addr}");
                    let router = self.router.clone();
                    let link = self.link.clone();
                    let max_frame_bytes = self.config.service.max_frame_bytes;
                    tokio::spawn(async move {
                        let served =
                            handle_connection(socket, addr, router, link, max_frame_bytes).await;
                        if let Err(e) = served {
                            error!("Error handling connection from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.notified() => {
                    info!("Terminate requested, stopping");
                    break;
                }
                _ = &mut ctrl_c => {
                    info!("Received shutdown signal, stopping");
                    break;
                }
            }
        }

        self.registry.shutdown();
        info!("Storage service stopped");
        Ok(())
    }
}
