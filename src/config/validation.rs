use crate::config::types::{
    Config, DatasetConfig, ExtractConfig, FetchConfig, IdentityConfig, LoggingConfig, RetryConfig,
    UnitsConfig,
};
use crate::ConfigError;
use scraper::Selector;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_fetch_config(&config.fetch)?;
    validate_retry_config(&config.retry)?;
    validate_identity_config(&config.identity)?;
    validate_worker_count(config.workers.worker_count)?;
    validate_dataset_config(&config.dataset)?;
    validate_paths(config)?;
    validate_units_config(&config.units)?;
    validate_logging_config(&config.logging)?;
    if let Some(extract) = &config.extract {
        validate_extract_config(extract)?;
    }
    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if !config.requests_per_second.is_finite() || config.requests_per_second <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "requests_per_second must be a positive number, got {}",
            config.requests_per_second
        )));
    }

    if config.burst_size < 1 {
        return Err(ConfigError::Validation(
            "burst_size must be >= 1".to_string(),
        ));
    }

    if config.timeout_seconds < 1 || config.timeout_seconds > 600 {
        return Err(ConfigError::Validation(format!(
            "timeout_seconds must be between 1 and 600, got {}",
            config.timeout_seconds
        )));
    }

    for status in &config.block_statuses {
        if !(100..=599).contains(status) {
            return Err(ConfigError::Validation(format!(
                "block_statuses contains invalid HTTP status {}",
                status
            )));
        }
    }

    if config.block_markers.iter().any(|m| m.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "block_markers cannot contain empty strings".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_retries < 1 || config.max_retries > 50 {
        return Err(ConfigError::Validation(format!(
            "max_retries must be between 1 and 50, got {}",
            config.max_retries
        )));
    }

    if !config.base_delay_seconds.is_finite() || config.base_delay_seconds < 0.0 {
        return Err(ConfigError::Validation(format!(
            "base_delay_seconds must be >= 0, got {}",
            config.base_delay_seconds
        )));
    }

    if !config.max_delay_seconds.is_finite() || config.max_delay_seconds < config.base_delay_seconds
    {
        return Err(ConfigError::Validation(format!(
            "max_delay_seconds ({}) must be >= base_delay_seconds ({})",
            config.max_delay_seconds, config.base_delay_seconds
        )));
    }

    if !(0.0..1.0).contains(&config.jitter) {
        return Err(ConfigError::Validation(format!(
            "jitter must be in [0, 1), got {}",
            config.jitter
        )));
    }

    Ok(())
}

fn validate_identity_config(config: &IdentityConfig) -> Result<(), ConfigError> {
    for proxy in &config.proxies {
        let url = Url::parse(proxy)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy '{}': {}", proxy, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "Proxy '{}' must use http or https",
                proxy
            )));
        }
    }

    if config.user_agents.iter().any(|ua| ua.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "user_agents cannot contain empty strings".to_string(),
        ));
    }

    Ok(())
}

fn validate_worker_count(worker_count: usize) -> Result<(), ConfigError> {
    if worker_count < 1 || worker_count > 256 {
        return Err(ConfigError::Validation(format!(
            "worker_count must be between 1 and 256, got {}",
            worker_count
        )));
    }
    Ok(())
}

fn validate_dataset_config(config: &DatasetConfig) -> Result<(), ConfigError> {
    if config.key_field.trim().is_empty() {
        return Err(ConfigError::Validation(
            "key_field cannot be empty".to_string(),
        ));
    }

    if config.tie_break_field.as_deref() == Some(config.key_field.as_str()) {
        return Err(ConfigError::Validation(
            "tie_break_field must differ from key_field".to_string(),
        ));
    }

    if let Some(timeout) = config.lock_timeout_seconds {
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "lock_timeout_seconds must be positive, got {}",
                timeout
            )));
        }
    }

    Ok(())
}

fn validate_paths(config: &Config) -> Result<(), ConfigError> {
    if config.dataset.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "dataset path cannot be empty".to_string(),
        ));
    }

    if config.checkpoint.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "checkpoint path cannot be empty".to_string(),
        ));
    }

    if config.checkpoint.path == config.dataset.path {
        return Err(ConfigError::Validation(
            "checkpoint path must differ from dataset path".to_string(),
        ));
    }

    if config.metrics.timer_window < 1 {
        return Err(ConfigError::Validation(
            "timer_window must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_units_config(config: &UnitsConfig) -> Result<(), ConfigError> {
    match (&config.url_template, &config.targets_file) {
        (Some(_), Some(_)) => Err(ConfigError::Validation(
            "units must set either url_template or targets_file, not both".to_string(),
        )),
        (None, None) => Err(ConfigError::Validation(
            "units must set url_template or targets_file".to_string(),
        )),
        (Some(template), None) => {
            if !template.contains("{page}") {
                return Err(ConfigError::Validation(format!(
                    "url_template '{}' must contain a {{page}} placeholder",
                    template
                )));
            }

            let sample = template.replace("{page}", &config.first_page.to_string());
            Url::parse(&sample).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid url_template '{}': {}", template, e))
            })?;

            match config.last_page {
                Some(last) if last >= config.first_page => Ok(()),
                Some(last) => Err(ConfigError::Validation(format!(
                    "last_page ({}) must be >= first_page ({})",
                    last, config.first_page
                ))),
                None => Err(ConfigError::Validation(
                    "url_template requires last_page".to_string(),
                )),
            }
        }
        (None, Some(_)) => {
            if config.url_column.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "url_column cannot be empty".to_string(),
                ));
            }
            Ok(())
        }
    }
}

fn validate_logging_config(config: &LoggingConfig) -> Result<(), ConfigError> {
    if config
        .directory
        .as_ref()
        .is_some_and(|dir| dir.as_os_str().is_empty())
    {
        return Err(ConfigError::Validation(
            "logging directory cannot be empty".to_string(),
        ));
    }

    let prefix = config.file_prefix.trim();
    if prefix.is_empty() || prefix.contains(['/', '\\']) {
        return Err(ConfigError::Validation(format!(
            "logging file-prefix must be a plain file name, got '{}'",
            config.file_prefix
        )));
    }

    Ok(())
}

fn validate_extract_config(config: &ExtractConfig) -> Result<(), ConfigError> {
    validate_selector(&config.item_selector)?;

    if config.fields.is_empty() {
        return Err(ConfigError::Validation(
            "extract must define at least one field".to_string(),
        ));
    }

    for (name, rule) in &config.fields {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "extract field names cannot be empty".to_string(),
            ));
        }
        if let Some(selector) = &rule.selector {
            validate_selector(selector)?;
        }
    }

    Ok(())
}

fn validate_selector(selector: &str) -> Result<(), ConfigError> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidSelector(format!("'{}': {:?}", selector, e)))
}
