mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use jobline::config::EngineConfig;
use jobline::events::EventBus;
use jobline::scheduler::JobQueue;
use jobline::service::ServiceRegistry;
use jobline::simulated::default_services;
use jobline::state_machine::{JobReport, JobStatus, Params};
use jobline::store::{FileJobStore, JobFilter, JobStore, MemoryJobStore};
use jobline::template::TemplateRegistry;
use jobline::{CreateJob, Engine, JobController};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max_retries) = cli.max_retries {
        config.default_max_retries = max_retries;
    }
    config.validate()?;

    match cli.command {
        Command::Templates => {
            list_templates(&load_templates(&config)?);
            Ok(())
        }
        Command::Run {
            template,
            params,
            priority,
        } => {
            let request = CreateJob {
                template_id: template,
                params: params.into_iter().collect(),
                priority,
                max_retries: None,
            };
            run(&config, request).await
        }
        Command::Batch {
            template,
            inputs,
            priority,
        } => {
            let contents = std::fs::read_to_string(&inputs)
                .with_context(|| format!("cannot read {}", inputs.display()))?;
            let inputs: Vec<Params> = serde_json::from_str(&contents)
                .with_context(|| format!("{} must hold a JSON array of objects", inputs.display()))?;
            batch(&config, &template, inputs, priority).await
        }
        Command::Retry { job_id } => retry(&config, &job_id).await,
        Command::Status {
            job_id,
            status,
            template,
        } => show_status(&config, job_id, status, template),
        Command::Demo => demo(&config).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "jobline=debug" } else { "jobline=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_templates(config: &EngineConfig) -> Result<TemplateRegistry> {
    let registry = match &config.templates_path {
        Some(path) => TemplateRegistry::load(path)
            .with_context(|| format!("cannot load templates from {}", path.display()))?,
        None => TemplateRegistry::builtin()?,
    };
    Ok(registry)
}

fn open_store(config: &EngineConfig) -> Result<Arc<dyn JobStore>> {
    let store = FileJobStore::open(&config.store_dir)
        .with_context(|| format!("cannot open job store at {}", config.store_dir.display()))?;
    Ok(Arc::new(store))
}

fn simulated_services() -> ServiceRegistry {
    default_services(Duration::from_millis(200))
}

fn start_engine(
    config: &EngineConfig,
    store: Arc<dyn JobStore>,
    services: ServiceRegistry,
) -> Result<Engine> {
    Ok(Engine::start(config, load_templates(config)?, services, store)?)
}

fn list_templates(registry: &TemplateRegistry) {
    for template in registry.list() {
        println!(
            "{:<20} {} ({} steps, ~{}ms)",
            template.id,
            template.name,
            template.steps.len(),
            template.estimated_duration_ms
        );
        if !template.description.is_empty() {
            println!("{:<20} {}", "", template.description);
        }
    }
}

async fn run(config: &EngineConfig, request: CreateJob) -> Result<()> {
    let engine = start_engine(config, open_store(config)?, simulated_services())?;
    let controller = Arc::clone(engine.controller());

    let events = controller.subscribe();
    let job = controller.create_job(request)?;
    let finished = ui::follow(&controller, events, std::slice::from_ref(&job)).await?;
    for job in &finished {
        ui::print_report(&JobReport::from_job(job));
    }

    engine.shutdown().await;
    Ok(())
}

async fn batch(
    config: &EngineConfig,
    template: &str,
    inputs: Vec<Params>,
    priority: Option<i32>,
) -> Result<()> {
    let engine = start_engine(config, open_store(config)?, simulated_services())?;
    let controller = Arc::clone(engine.controller());

    let events = controller.subscribe();
    let batch = controller.create_batch(template, inputs, priority, None)?;
    println!("batch {} ({} jobs)", batch.id, batch.job_ids.len());
    let jobs = batch
        .job_ids
        .iter()
        .map(|id| controller.get_job(id))
        .collect::<Result<Vec<_>, _>>()?;

    let finished = ui::follow(&controller, events, &jobs).await?;
    let failed = finished
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .count();
    println!("{} completed, {failed} failed", finished.len() - failed);

    engine.shutdown().await;
    Ok(())
}

async fn retry(config: &EngineConfig, job_id: &str) -> Result<()> {
    let engine = start_engine(config, open_store(config)?, simulated_services())?;
    let controller = Arc::clone(engine.controller());

    let events = controller.subscribe();
    controller.retry_job(job_id)?;
    let job = controller.get_job(job_id)?;
    let finished = ui::follow(&controller, events, std::slice::from_ref(&job)).await?;
    for job in &finished {
        ui::print_report(&JobReport::from_job(job));
    }

    engine.shutdown().await;
    Ok(())
}

/// Reads the store without starting workers, so queued jobs stay queued.
/// The queue length shown is the number of jobs stored as `Queued`.
fn show_status(
    config: &EngineConfig,
    job_id: Option<String>,
    status: Option<JobStatus>,
    template: Option<String>,
) -> Result<()> {
    let store = open_store(config)?;
    if let Some(job_id) = job_id {
        let job = store.get(&job_id)?;
        ui::print_report(&JobReport::from_job(&job));
        return Ok(());
    }

    let controller = JobController::new(
        Arc::new(load_templates(config)?),
        store,
        Arc::new(JobQueue::new(config.max_queue_length)),
        Arc::new(EventBus::default()),
    );
    let filter = JobFilter {
        status,
        template_id: template,
        batch_id: None,
    };
    for job in controller.list_jobs(&filter)? {
        ui::print_job_line(&job);
    }

    let stats = controller.stats()?.with_stored_queue_length();
    println!();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn demo(config: &EngineConfig) -> Result<()> {
    let demo_config = EngineConfig {
        templates_path: None,
        ..config.clone()
    };
    let engine = start_engine(
        &demo_config,
        Arc::new(MemoryJobStore::new()),
        default_services(Duration::from_millis(50)),
    )?;
    let controller = Arc::clone(engine.controller());

    let demo_params: Value = json!({
        "topic": "async runtimes in Rust",
        "publish_at": "2026-10-19T09:00:00Z",
        "platform": "youtube",
    });
    let params = demo_params.as_object().cloned().unwrap_or_default();

    let events = controller.subscribe();
    let mut jobs = Vec::new();
    for (priority, template) in controller.templates().list().into_iter().enumerate() {
        let request = CreateJob::new(template.id.clone())
            .with_params(params.clone())
            .with_priority(priority as i32);
        jobs.push(controller.create_job(request)?);
    }

    let finished = ui::follow(&controller, events, &jobs).await?;
    for job in &finished {
        ui::print_report(&JobReport::from_job(job));
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&controller.stats()?)?);

    engine.shutdown().await;
    Ok(())
}
