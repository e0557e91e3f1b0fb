use spmd_collectives::distributed::{GroupIdentity, NcclModule, ResourceTracker};
use spmd_collectives::utils::config::RuntimeConfig;
use spmd_collectives::utils::logging::{self, LogFormat};
use spmd_collectives::utils::metrics::CollectiveMetrics;
use spmd_collectives::Result;
use std::sync::Arc;
use tracing::{error, info};

const USAGE: &str = "usage: spmd-collectives [--config <file.json>] <unique-id | entry-points | serve-metrics <port>>";

fn load_config(path: Option<&str>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file_with_env(path)?,
        None => RuntimeConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn run(args: &[String]) -> Result<()> {
    let (config_path, rest) = match args {
        [flag, path, rest @ ..] if flag == "--config" => (Some(path.as_str()), rest),
        rest => (None, rest),
    };
    let config = load_config(config_path)?;
    logging::init_logging_with_format(LogFormat::parse(&config.logging.format).unwrap_or(LogFormat::Pretty));

    let metrics = Arc::new(CollectiveMetrics::new()?);
    let module = NcclModule::new(
        config.build_backend()?,
        Arc::new(ResourceTracker::new()),
        Some(metrics.clone()),
    );

    match rest {
        // Rank 0 prints a fresh identity for the launcher to hand to every participant.
        [cmd] if cmd == "unique-id" => {
            let bytes = module.get_communicator_unique_id()?;
            if bytes.is_empty() {
                info!("Collective support is disabled; no group identity generated");
            } else {
                println!("{}", GroupIdentity::from_bytes(&bytes)?.to_hex());
            }
        }
        [cmd] if cmd == "entry-points" => {
            module.register_device_dependent_methods(
                config.topology.world_size,
                config.topology.rank,
                &config.unique_id_bytes()?,
            )?;
            module.register_collective_ops();
            for name in module.names() {
                println!("{}", name);
            }
        }
        #[cfg(feature = "metrics-server")]
        [cmd, port] if cmd == "serve-metrics" => {
            let port: u16 = port
                .parse()
                .map_err(|_| spmd_collectives::CommError::Config(format!("bad port: {}", port)))?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(spmd_collectives::utils::metrics::serve_metrics(metrics, port))?;
        }
        _ => println!("{}", USAGE),
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        logging::init_logging();
        error!(error = %e, code = e.code(), "spmd-collectives failed");
        std::process::exit(1);
    }
}
