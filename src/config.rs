use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::acquire;
use crate::aggregator;
use crate::domain::FilterSet;
use crate::error::HarvestError;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Validated configuration: `threads` drives the download pool, `workers`
/// the aggregation pool.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub output_dir: Utf8PathBuf,
    pub threads: usize,
    pub workers: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl ResolvedConfig {
    pub fn filters(&self) -> FilterSet {
        FilterSet::new(self.include.clone(), self.exclude.clone())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("medharvest.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let output_dir = config
            .output_dir
            .filter(|dir| !dir.trim().is_empty())
            .ok_or_else(|| HarvestError::ConfigParse("output_dir is required".to_string()))?;

        let threads = config.threads.unwrap_or(acquire::DEFAULT_THREADS);
        let workers = config.workers.unwrap_or(aggregator::DEFAULT_WORKERS);
        if threads == 0 || workers == 0 {
            return Err(HarvestError::ConfigParse(
                "threads and workers must be positive".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            output_dir: Utf8PathBuf::from(output_dir),
            threads,
            workers,
            include: config.include,
            exclude: config.exclude,
        })
    }
}
