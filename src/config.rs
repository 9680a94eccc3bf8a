//! Configuração do motor carregada a partir de `jobline.toml`.
//!
//! A struct [`EngineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `JOBLINE_WORKERS` tem precedência sobre o arquivo.

use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::admission::AdmissionConfig;

/// Arquivo lido quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "jobline.toml";

/// Configuração de nível superior carregada de `jobline.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Número de workers concorrentes no pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Comprimento máximo da fila; ausente significa fila sem limite.
    #[serde(default)]
    pub max_queue_length: Option<usize>,

    /// Prioridade usada quando o chamador não informa uma.
    #[serde(default)]
    pub default_priority: i32,

    /// Retentativas de job permitidas quando o chamador não informa.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Arquivo TOML de templates; ausente usa os templates embutidos.
    #[serde(default)]
    pub templates_path: Option<PathBuf>,

    /// Diretório onde os registros de job são persistidos.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Políticas de admissão avaliadas antes de criar um job.
    #[serde(default)]
    pub admission: AdmissionConfig,
}

// Valor padrão para o tamanho do pool: 4 workers.
fn default_workers() -> usize {
    4
}

// Valor padrão para retentativas de job: 3.
fn default_max_retries() -> u32 {
    3
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".jobline/jobs")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_queue_length: None,
            default_priority: 0,
            default_max_retries: default_max_retries(),
            templates_path: None,
            store_dir: default_store_dir(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `path`, ou de `jobline.toml` no diretório
    /// atual. Usa valores padrão se o arquivo padrão não existir; um caminho
    /// explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(workers) = std::env::var("JOBLINE_WORKERS")
            && !workers.is_empty()
        {
            config.workers = workers
                .parse()
                .map_err(|e| anyhow::anyhow!("JOBLINE_WORKERS=`{workers}` is not a number: {e}"))?;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        Ok(toml::from_str::<EngineConfig>(&contents)?)
    }

    /// Rejeita combinações que deixariam o motor sem capacidade.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.max_queue_length == Some(0) {
            bail!("max_queue_length must be at least 1 when set");
        }
        Ok(())
    }
}
