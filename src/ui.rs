//! Interface de terminal do jobline: barras de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para as barras de progresso e `console` para
//! estilização com cores. Cada [`JobProgress`] acompanha um job e avança
//! conforme os eventos publicados pelos workers.

use std::collections::HashMap;
use std::time::Duration;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};

use jobline::JobController;
use jobline::events::{JobEvent, JobEventKind};
use jobline::state_machine::{Job, JobReport, JobStatus, StepStatus};

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// Exibe uma barra com um passo por unidade e mensagens coloridas para
/// sucesso (verde), falha (vermelho) e retentativa (amarelo).
pub struct JobProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Cria a barra do job dentro de `multi` e retorna a instância de progresso.
    pub fn start(multi: &MultiProgress, job: &Job) -> Self {
        let pb = multi.add(ProgressBar::new(job.steps.len() as u64));
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold} [{bar:24.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        pb.set_style(style);
        pb.set_prefix(format!("{} {}", job.template_id, short_id(&job.id)));
        pb.set_message("queued");
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a barra a partir de um evento do job.
    pub fn apply(&self, event: &JobEvent) {
        match &event.kind {
            JobEventKind::Started => self.pb.set_message("running"),
            JobEventKind::StepStarted { step_id, attempt } if *attempt > 1 => {
                self.pb.set_message(format!("{step_id} (attempt {attempt})"));
            }
            JobEventKind::StepStarted { step_id, .. } => self.pb.set_message(step_id.clone()),
            JobEventKind::StepCompleted { .. } => self.pb.inc(1),
            JobEventKind::StepRetrying {
                step_id,
                attempt,
                delay_ms,
                reason,
            } => {
                self.pb.println(format!(
                    "  {} {step_id} attempt {attempt}: {reason} (retrying in {delay_ms}ms)",
                    self.yellow.apply_to("↻")
                ));
            }
            _ => {}
        }
    }

    /// Finaliza a barra e exibe o resultado final do job.
    pub fn complete(&self, job: &Job) {
        let completed = job
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.pb.set_position(completed as u64);
        match job.status {
            JobStatus::Completed => self
                .pb
                .finish_with_message(format!("{}", self.green.apply_to("✓ completed"))),
            JobStatus::Failed => {
                let reason = job
                    .failed_step()
                    .and_then(|s| s.error.as_ref().map(|e| format!("{}: {e}", s.step_id)))
                    .unwrap_or_default();
                self.pb
                    .abandon_with_message(format!("{} {reason}", self.red.apply_to("✗ failed")));
            }
            status => self
                .pb
                .abandon_with_message(format!("{}", self.yellow.apply_to(status))),
        }
    }
}

/// Acompanha `jobs` até que todos cheguem a um estado terminal e retorna
/// os registros finais, na mesma ordem.
///
/// `events` deve ter sido inscrito antes da criação dos jobs.
pub async fn follow(
    controller: &JobController,
    mut events: broadcast::Receiver<JobEvent>,
    jobs: &[Job],
) -> anyhow::Result<Vec<Job>> {
    let multi = MultiProgress::new();
    let bars: HashMap<&str, JobProgress> = jobs
        .iter()
        .map(|job| (job.id.as_str(), JobProgress::start(&multi, job)))
        .collect();
    let mut pending: Vec<&str> = jobs.iter().map(|job| job.id.as_str()).collect();

    while !pending.is_empty() {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(event)) => {
                if let Some(bar) = bars.get(event.job_id.as_str()) {
                    bar.apply(&event);
                }
                if event.terminal_status().is_none() {
                    continue;
                }
            }
            Ok(Err(RecvError::Closed)) => break,
            // Missed events or quiet period: fall back to the store.
            Ok(Err(RecvError::Lagged(_))) | Err(_) => {}
        }

        let mut still_pending = Vec::with_capacity(pending.len());
        for job_id in pending {
            let job = controller.get_job(job_id)?;
            if job.is_terminal() {
                if let Some(bar) = bars.get(job_id) {
                    bar.complete(&job);
                }
            } else {
                still_pending.push(job_id);
            }
        }
        pending = still_pending;
    }

    jobs.iter()
        .map(|job| controller.get_job(&job.id).map_err(anyhow::Error::from))
        .collect()
}

/// Imprime o relatório do job formatado em JSON com estilo colorido.
pub fn print_report(report: &JobReport) {
    let status_style = match report.status {
        JobStatus::Completed => Style::new().green().bold(),
        JobStatus::Failed => Style::new().red().bold(),
        _ => Style::new().yellow(),
    };
    println!();
    println!(
        "{}",
        status_style.apply_to(format!("─── Job {} ───", report.job_id))
    );
    println!(
        "{}",
        serde_json::to_string_pretty(report).unwrap_or_default()
    );
}

/// Linha de resumo usada por `status`.
pub fn print_job_line(job: &Job) {
    let style = match job.status {
        JobStatus::Completed => Style::new().green(),
        JobStatus::Failed => Style::new().red(),
        JobStatus::Running => Style::new().cyan(),
        _ => Style::new().yellow(),
    };
    println!(
        "{}  {:<10} {:<20} {:>3}%  p{}  {}",
        short_id(&job.id),
        style.apply_to(job.status),
        job.template_id,
        job.progress.percentage,
        job.priority,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
    );
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
