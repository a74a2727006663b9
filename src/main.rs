use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use common::catalog::{Catalog, PgCatalog, PgCatalogConnector};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::CatalogHandle;
use retention::PgDatasetConnector;
use storager::StoragerAgent;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - retention and archival service for geospatial data series")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Deployment context name
    context: Option<String>,

    #[arg(long, help = "Controller protocol port")]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<StrataCommands>,
}

#[derive(Subcommand)]
enum StrataCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for StrataCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let mut config = utils::load_config(cli.common.config.as_ref())?;
    if let Some(context) = cli.context {
        config.service.context = context;
    }
    if let Some(port) = cli.port {
        config.service.port = port;
    }

    let command = cli.command.unwrap_or_default();
    let StrataCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config)? {
        return Ok(());
    }
    utils::validate_config(&config)?;

    info!(context = %config.service.context, "Starting Strata storage service");

    // the controller may still send working credentials through UPDATE_SERVICE
    let catalog: Option<Arc<dyn Catalog>> = match PgCatalog::connect(&config.database).await {
        Ok(catalog) => Some(Arc::new(catalog)),
        Err(e) => {
            warn!("Catalog unavailable at startup, waiting for credentials: {e}");
            None
        }
    };

    let datasets = PgDatasetConnector::new(
        config.database.max_connections,
        config.database.connect_timeout,
    );
    let agent = StoragerAgent::new(
        config,
        Arc::new(CatalogHandle::new(catalog)),
        Arc::new(PgCatalogConnector),
        Arc::new(datasets),
    )?;

    match agent.run().await {
        Ok(()) => {
            info!("Strata storage service stopped");
            Ok(())
        }
        Err(e) => {
            error!("Strata storage service failed: {e:#}");
            Err(e)
        }
    }
}
