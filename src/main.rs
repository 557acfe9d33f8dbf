use std::time::Duration;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use kvmprov::cli::{Cli, Command};
use kvmprov::client::ApiClient;
use kvmprov::config::{self, Config};
use kvmprov::error::ProvError;
use kvmprov::model::{ProvisionRequest, VmRecord};
use kvmprov::orchestrator::Orchestrator;
use kvmprov::vm_state::VmState;
use kvmprov::{api, backend, logging, paths};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_TIMEOUT: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("kvmprov=debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("kvmprov=info".parse().into_diagnostic()?)
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: captures kvmprov=debug once `serve` activates it
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("kvmprov=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let config = config::load_or_default(cli.config.as_deref())?;

    match &cli.command {
        Command::Serve => {
            let log_path = paths::logs_dir(&config.state_dir()).join("kvmprov.log");
            if let Err(e) = file_handle.set_file(&log_path) {
                tracing::warn!(path = %log_path.display(), error = %e, "file logging disabled");
            }
            return run_serve(&config).await;
        }
        Command::CheckConfig => {
            print_config(&config, cli.json)?;
            return Ok(());
        }
        _ => {}
    }

    let server = match &cli.server {
        Some(server) => server.clone(),
        None => config.server.listen.clone(),
    };
    let client = ApiClient::new(&server)?;

    if let Some(request) = cli.command.provision_request() {
        let wait = matches!(cli.command, Command::Create { wait: true, .. });
        return run_create(&client, request, wait, cli.json).await;
    }

    match cli.command {
        Command::Serve | Command::CheckConfig | Command::Create { .. } => unreachable!(),
        Command::Status { name } => {
            let record = client
                .get(&name)
                .await?
                .ok_or(ProvError::NotFound { name })?;
            show_record(&record, cli.json)?;
        }
        Command::List => {
            let records = client.list().await?;
            if cli.json {
                print_json(&records)?;
            } else if records.is_empty() {
                println!("No VMs.");
            } else {
                for record in &records {
                    let marker = if record.in_progress { " *" } else { "" };
                    println!(
                        "{:<24} {:<16} attempt {}{marker}",
                        record.name,
                        record.state.to_string(),
                        record.attempt
                    );
                }
            }
        }
        Command::Stop { name, force } => {
            let record = client.stop(&name, force).await?;
            report(&record, "stopping", cli.json)?;
        }
        Command::Start { name } => {
            let record = client.start(&name).await?;
            report(&record, "starting", cli.json)?;
        }
        Command::Cancel { name } => {
            let record = client.cancel(&name).await?;
            report(&record, "cancelling", cli.json)?;
        }
        Command::Delete { name, wait } => {
            let record = client.delete(&name).await?;
            if !wait {
                report(&record, "deleting", cli.json)?;
                return Ok(());
            }
            match client.wait_settled(&name, POLL_INTERVAL, WAIT_TIMEOUT).await? {
                None => println!("VM '{name}' deleted."),
                Some(record) => {
                    show_record(&record, cli.json)?;
                    miette::bail!(
                        "deleting '{name}' did not complete: {}",
                        record.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
        Command::Log { name } => {
            print!("{}", client.log(&name).await?);
        }
    }

    Ok(())
}

async fn run_create(
    client: &ApiClient,
    request: ProvisionRequest,
    wait: bool,
    json: bool,
) -> miette::Result<()> {
    let name = request.name.clone();
    let (started, accepted) = client.submit(&request).await?;
    if !wait {
        if json {
            print_json(&accepted)?;
        } else if started {
            println!("VM '{name}' accepted ({})", accepted.state);
        } else {
            println!("VM '{name}' already exists ({})", accepted.state);
        }
        return Ok(());
    }

    let record = client
        .wait_settled(&name, POLL_INTERVAL, WAIT_TIMEOUT)
        .await?
        .ok_or(ProvError::NotFound { name })?;
    show_record(&record, json)?;
    if record.state == VmState::Failed {
        miette::bail!(
            "provisioning '{}' failed: {}",
            record.name,
            record.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn run_serve(config: &Config) -> miette::Result<()> {
    let addr = config.listen_addr()?;
    let backend = backend::create_backend(config)?;
    let orchestrator = Orchestrator::from_config(config, backend)?;
    tracing::info!(
        state_dir = %config.state_dir().display(),
        image_dir = %config.image_dir().display(),
        backend = %config.libvirt.backend,
        "starting"
    );

    match orchestrator.reconcile().await {
        Ok(report) => tracing::info!(
            checked = report.checked,
            missing = report.missing.len(),
            shut_off = report.shut_off.len(),
            "reconciled inventory"
        ),
        Err(e) => tracing::warn!(error = %e, "reconcile skipped"),
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| ProvError::Io {
            context: "registering SIGTERM handler".into(),
            source: e,
        })?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    };

    api::serve(orchestrator, addr, shutdown).await?;
    tracing::info!("stopped");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> miette::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn report(record: &VmRecord, action: &str, json: bool) -> miette::Result<()> {
    if json {
        return print_json(record);
    }
    println!("VM '{}': {action} ({})", record.name, record.state);
    Ok(())
}

fn show_record(record: &VmRecord, json: bool) -> miette::Result<()> {
    if json {
        return print_json(record);
    }
    let req = &record.request;
    println!("VM '{}': {} (attempt {})", record.name, record.state, record.attempt);
    println!(
        "  Request: {} MiB, {} vCPU, {} GiB root, {:?} network",
        req.memory_mib, req.vcpu_count, req.disk_size_gib, req.network_mode
    );
    if let Some(op) = record.operation {
        println!("  In progress: {op:?}");
    }
    if let Some(domain) = &record.domain {
        println!("  Domain: {} ({})", domain.name, domain.uuid);
    }
    for disk in record.disks() {
        println!("  Disk {}: {} ({} GiB)", disk.target, disk.path.display(), disk.size_gib);
    }
    if let Some(err) = &record.last_error {
        println!("  Last error: {err}");
    }
    if record.rollback_incomplete {
        println!("  Rollback incomplete: run `kvmprov delete {}`", record.name);
    }
    Ok(())
}

fn print_config(config: &Config, json: bool) -> miette::Result<()> {
    if json {
        let summary = serde_json::json!({
            "listen": config.server.listen,
            "backend": config.libvirt.backend,
            "uri": config.libvirt.uri,
            "imageDir": config.image_dir(),
            "stateDir": config.state_dir(),
            "retry": {
                "maxAttempts": config.retry.max_attempts,
                "initialBackoffMs": config.retry.initial_backoff_ms,
                "maxBackoffMs": config.retry.max_backoff_ms,
                "callTimeoutS": config.retry.call_timeout_s,
            },
        });
        return print_json(&summary);
    }
    println!("Config OK");
    println!("  Listen:    {}", config.server.listen);
    println!("  Backend:   {} ({})", config.libvirt.backend, config.libvirt.uri);
    println!("  Images:    {}", config.image_dir().display());
    println!("  State:     {}", config.state_dir().display());
    println!(
        "  Retry:     {} attempts, {}..{} ms backoff, {} s per call",
        config.retry.max_attempts,
        config.retry.initial_backoff_ms,
        config.retry.max_backoff_ms,
        config.retry.call_timeout_s
    );
    Ok(())
}
