use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sitesync_core::{
    EventSink, JobStatus, SiteConfigProvider, SiteConfiguration, SyncEngine, Workspace,
};
use sitesync_local::config::{Command, Config};
use sitesync_local::{builtin_registries, JsonFileConfigProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let provider = JsonFileConfigProvider::new(&config.config);

    let (providers, publishers) = builtin_registries()?;
    info!(
        "Sources: {}; publishers: {}",
        providers.types().join(", "),
        publishers.types().join(", ")
    );

    let (events, mut event_rx) = EventSink::channel(config.event_buffer);
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!(
                "[{}] {:<8} {}",
                event.site_key,
                format!("{:?}", event.phase).to_lowercase(),
                event.message
            );
        }
    });

    let engine = SyncEngine::new(
        Arc::new(providers),
        Arc::new(publishers),
        events,
        config.retry_policy(),
    );

    let result = run(&engine, &provider, &config).await;

    engine.close_all().await;
    drop(engine);
    let _ = printer.await;

    result
}

async fn run(
    engine: &SyncEngine,
    provider: &JsonFileConfigProvider,
    config: &Config,
) -> anyhow::Result<()> {
    match &config.command {
        Command::List { site: None } => {
            for site in provider.sites().await? {
                let targets: Vec<&str> = site.publish.iter().map(|t| t.effective_key()).collect();
                println!(
                    "{}\t{} {}\t-> {}",
                    site.key,
                    site.source.source_type,
                    site.source.location,
                    targets.join(", ")
                );
            }
        }
        Command::List { site: Some(site) } => {
            let (_, workspaces) = open(engine, provider, site).await?;
            for workspace in &workspaces {
                print_workspace(workspace);
            }
        }
        Command::Mount { site, workspace } => {
            let (_, workspaces) = open(engine, provider, site).await?;
            let key = match workspace {
                Some(key) => key.clone(),
                None => first_key(site, &workspaces)?,
            };
            let mounted = engine
                .mount_workspace(site, &key, config.deadline())
                .await?;
            print_workspace(&mounted);
        }
        Command::Update { site, workspace } => {
            open(engine, provider, site).await?;
            engine
                .mount_workspace(site, workspace, config.deadline())
                .await?;
            let updated = engine
                .update_workspace(site, workspace, config.deadline())
                .await?;
            print_workspace(&updated);
        }
        Command::Publish {
            site,
            target,
            workspace,
        } => {
            let (site_config, workspaces) = open(engine, provider, site).await?;
            let mut target = site_config
                .target(target)
                .cloned()
                .ok_or_else(|| anyhow!("site '{}' has no publish target '{}'", site, target))?;
            if workspace.is_some() {
                target.workspace = workspace.clone();
            }

            let key = match &target.workspace {
                Some(key) => key.clone(),
                None => first_key(site, &workspaces)?,
            };
            engine
                .mount_workspace(site, &key, config.deadline())
                .await?;
            target.workspace = Some(key);

            let handle = engine.request_publish(site, &target)?;
            let job_id = handle.id();
            let mut shutdown_rx = create_shutdown_signal();

            let job = tokio::select! {
                job = handle.wait() => job,
                _ = shutdown_rx.wait_for(|&v| v) => {
                    warn!("Cancelling publish job {}", job_id);
                    engine.cancel_job(job_id)?;
                    wait_terminal(engine, job_id).await?
                }
            };

            match job.status {
                JobStatus::Succeeded => {
                    let outcome = job.outcome.unwrap_or_default();
                    println!(
                        "Published {} to {}: {} file(s) changed, {} byte(s) in {} attempt(s)",
                        site,
                        job.target_key,
                        outcome.files_changed,
                        outcome.bytes_transferred,
                        job.attempt_count
                    );
                }
                status => {
                    let cause = job
                        .last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no error recorded".to_string());
                    return Err(anyhow!(
                        "publish {} ended as {:?} after {} attempt(s): {}",
                        job.id,
                        status,
                        job.attempt_count,
                        cause
                    ));
                }
            }
        }
    }
    Ok(())
}

async fn open(
    engine: &SyncEngine,
    provider: &JsonFileConfigProvider,
    site: &str,
) -> anyhow::Result<(SiteConfiguration, Vec<Workspace>)> {
    let site_config = provider
        .site(site)
        .await?
        .ok_or_else(|| anyhow!("site '{}' is not configured in {}", site, provider.path().display()))?;
    let workspaces = engine
        .open_site(site_config.clone())
        .await
        .with_context(|| format!("Failed to open site '{}'", site))?;
    Ok((site_config, workspaces))
}

fn first_key(site: &str, workspaces: &[Workspace]) -> anyhow::Result<String> {
    workspaces
        .first()
        .map(|w| w.key.clone())
        .ok_or_else(|| anyhow!("site '{}' has no workspaces", site))
}

fn print_workspace(workspace: &Workspace) {
    println!(
        "{}\t{:?}\t{}\t{}",
        workspace.key,
        workspace.state,
        workspace
            .content_root()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| workspace.location_handle.clone()),
        workspace
            .content
            .as_ref()
            .and_then(|c| c.revision.as_deref())
            .unwrap_or("-")
    );
}

/// Poll a cancelled job until it is terminal.
async fn wait_terminal(
    engine: &SyncEngine,
    job_id: uuid::Uuid,
) -> anyhow::Result<sitesync_core::PublishJob> {
    loop {
        let job = engine
            .job(job_id)
            .ok_or_else(|| anyhow!("publish job {} disappeared", job_id))?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, cancelling"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, cancelling");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
