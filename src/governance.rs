//! Model governance checks.
//!
//! Compares the deployment (storage region, embedding model, assistant
//! model) against the allow-lists in `[governance]`. An empty list allows
//! everything. Violations are advisory: they are reported by `govkb check`
//! and `GET /health` and logged at startup, but never block a query.

use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernanceStatus {
    pub ok: bool,
    pub violations: Vec<String>,
}

impl GovernanceStatus {
    pub fn message(&self) -> String {
        if self.ok {
            "OK".to_string()
        } else {
            self.violations.join("; ")
        }
    }
}

/// Region the deployment runs in: the storage region, else `AWS_REGION`.
fn deployment_region(config: &Config) -> String {
    config
        .storage
        .as_ref()
        .map(|s| s.region.clone())
        .or_else(|| std::env::var("AWS_REGION").ok())
        .unwrap_or_else(|| "us-east-1".to_string())
}

pub fn check(config: &Config) -> GovernanceStatus {
    let gov = &config.governance;
    let mut violations = Vec::new();

    if !gov.allow_regions.is_empty() {
        let region = deployment_region(config);
        if !gov.allow_regions.contains(&region) {
            violations.push(format!("Region {} not allowed", region));
        }
    }

    if !gov.allow_models.is_empty() {
        let mut models = Vec::new();
        if config.embedding.is_enabled() {
            if let Some(ref m) = config.embedding.model {
                models.push(m.clone());
            }
        }
        if let Some(m) = config.assistant.as_ref().and_then(|a| a.model.clone()) {
            models.push(m);
        }
        for model in models {
            if !gov.allow_models.contains(&model) {
                violations.push(format!("Model {} not allowed", model));
            }
        }
    }

    GovernanceStatus {
        ok: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssistantConfig, StorageConfig};

    fn config() -> Config {
        let mut cfg = Config::minimal();
        cfg.storage = Some(StorageConfig {
            bucket: "b".into(),
            region: "eu-west-1".into(),
            endpoint_url: None,
        });
        cfg.embedding.provider = "openai".into();
        cfg.embedding.model = Some("text-embedding-3-small".into());
        cfg.assistant = Some(AssistantConfig {
            host: "h".into(),
            name: "n".into(),
            model: Some("gpt-4o".into()),
        });
        cfg
    }

    #[test]
    fn test_empty_lists_allow_everything() {
        assert!(check(&config()).ok);
    }

    #[test]
    fn test_region_and_model_violations() {
        let mut cfg = config();
        cfg.governance.allow_regions = vec!["us-east-1".into()];
        cfg.governance.allow_models = vec!["text-embedding-3-small".into()];
        let status = check(&cfg);
        assert!(!status.ok);
        assert_eq!(
            status.violations,
            vec!["Region eu-west-1 not allowed", "Model gpt-4o not allowed"]
        );
        assert!(status.message().contains("; "));
    }
}
