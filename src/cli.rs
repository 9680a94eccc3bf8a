//! Interface de linha de comando do jobline baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (templates, run,
//! batch, retry, status, demo) e flags globais (--config, --workers,
//! --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jobline::state_machine::JobStatus;
use serde_json::Value;

/// jobline, motor de pipelines baseado em templates.
#[derive(Debug, Parser)]
#[command(name = "jobline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `jobline.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número de workers concorrentes.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Número máximo de retentativas de job após uma falha.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Lista os templates disponíveis.
    Templates,

    /// Cria um job a partir de um template e acompanha sua execução.
    Run {
        /// Id do template.
        template: String,

        /// Parâmetro do job no formato `chave=valor` (valor JSON ou texto).
        #[arg(long = "param", short = 'p', value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Prioridade do job; maior é atendido primeiro.
        #[arg(long, allow_negative_numbers = true)]
        priority: Option<i32>,
    },

    /// Cria um lote de jobs, um por entrada de um arquivo JSON.
    Batch {
        /// Id do template.
        template: String,

        /// Arquivo JSON com um array de objetos de parâmetros.
        #[arg(long)]
        inputs: PathBuf,

        #[arg(long, allow_negative_numbers = true)]
        priority: Option<i32>,
    },

    /// Reenfileira um job falho a partir do passo que falhou.
    Retry {
        job_id: String,
    },

    /// Mostra um job, ou a lista de jobs e as estatísticas do motor.
    Status {
        job_id: Option<String>,

        /// Filtra a lista por status (queued, running, completed, failed, cancelled).
        #[arg(long)]
        status: Option<JobStatus>,

        /// Filtra a lista por template.
        #[arg(long)]
        template: Option<String>,
    },

    /// Executa os templates embutidos contra serviços simulados.
    Demo,
}

/// Interpreta `chave=valor`; o valor é lido como JSON e, se não for JSON
/// válido, como texto.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected `key=value`, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
