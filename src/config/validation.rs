use crate::config::types::{CacheConfig, Config, FetchConfig, OutputConfig, ProbeConfig};
use crate::protocol::Protocol;
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_fetch_config(&config.fetch)?;
    validate_probe_config(&config.probe)?;
    validate_cache_config(&config.cache)?;
    validate_output_config(&config.output)?;
    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.concurrency < 1 || config.concurrency > 500 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and 500, got {}",
            config.concurrency
        )));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout-secs must be greater than 0".to_string(),
        ));
    }

    if config.retry_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "retry-attempts must be >= 1, got {}",
            config.retry_attempts
        )));
    }

    if config.retry_max_delay_ms < config.retry_base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry-max-delay-ms ({}) must be >= retry-base-delay-ms ({})",
            config.retry_max_delay_ms, config.retry_base_delay_ms
        )));
    }

    if config.max_lines_per_source == 0 {
        return Err(ConfigError::Validation(
            "max-lines-per-source must be greater than 0".to_string(),
        ));
    }

    if config.min_line_length > config.max_line_length {
        return Err(ConfigError::Validation(format!(
            "min-line-length ({}) must be <= max-line-length ({})",
            config.min_line_length, config.max_line_length
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_probe_config(config: &ProbeConfig) -> Result<(), ConfigError> {
    if config.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "probe timeout-ms must be greater than 0".to_string(),
        ));
    }

    if config.concurrency == 0 {
        return Err(ConfigError::Validation(
            "probe concurrency must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache_config(config: &CacheConfig) -> Result<(), ConfigError> {
    if config.l1_capacity == 0 {
        return Err(ConfigError::Validation(
            "l1-capacity must be greater than 0".to_string(),
        ));
    }

    if config.breaker_threshold == 0 {
        return Err(ConfigError::Validation(
            "breaker-threshold must be greater than 0".to_string(),
        ));
    }

    if let Some(redis_url) = &config.redis_url {
        let url = Url::parse(redis_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid redis-url: {}", e)))?;

        if !matches!(url.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
            return Err(ConfigError::InvalidUrl(format!(
                "redis-url must use a redis scheme, got '{}'",
                url.scheme()
            )));
        }
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&config.min_score) {
        return Err(ConfigError::Validation(format!(
            "min-score must be between 0 and 100, got {}",
            config.min_score
        )));
    }

    for tag in config
        .include_protocols
        .iter()
        .chain(config.exclude_protocols.iter())
    {
        if Protocol::from_tag(tag).is_none() {
            return Err(ConfigError::Validation(format!(
                "Unknown protocol tag '{}'",
                tag
            )));
        }
    }

    for tag in &config.include_protocols {
        let protocol = Protocol::from_tag(tag);
        if config
            .exclude_protocols
            .iter()
            .any(|other| Protocol::from_tag(other) == protocol)
        {
            return Err(ConfigError::Validation(format!(
                "Protocol '{}' is both included and excluded",
                tag
            )));
        }
    }

    Ok(())
}
