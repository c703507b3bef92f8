//! Configuration validation.

use crate::config::Config;
use crate::probe::{Pattern, WIDEST_DERIVED_HOST, render_request};
use crate::store::CheckType;
use crate::upstream::Module;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - At least one upstream, with unique names per module
/// - At least one server per upstream
/// - HTTP checks only on HTTP upstreams
/// - Thresholds, keep-alive and worker counts of at least 1
/// - Requests that fit the probe buffer
/// - Response patterns that compile
/// - A persistence directory for persistent upstreams
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing the problem.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.upstreams.is_empty() {
        errors.push("at least one upstream must be defined".to_string());
    }

    if config.global.workers == 0 {
        errors.push("workers must be >= 1".to_string());
    }

    if config.global.tick.is_zero() {
        errors.push("tick must be greater than zero".to_string());
    }

    let defaults = &config.healthcheck;
    if defaults.buffer_size == 0 {
        errors.push("buffer_size must be greater than zero".to_string());
    }

    let mut names = HashSet::new();
    for upstream in &config.upstreams {
        if upstream.name.is_empty() {
            errors.push("upstream name cannot be empty".to_string());
        }

        if !names.insert((upstream.module, upstream.name.as_str())) {
            errors.push(format!(
                "duplicate upstream name: {} ({})",
                upstream.name, upstream.module
            ));
        }

        if upstream.servers.is_empty() {
            errors.push(format!(
                "upstream '{}' must have at least one server",
                upstream.name
            ));
        }

        for server in &upstream.servers {
            if server.server.is_empty() {
                errors.push(format!(
                    "upstream '{}' has a server with an empty address",
                    upstream.name
                ));
            }
        }

        let opts = upstream.check_options(defaults);

        if opts.check_type == Some(CheckType::Http) && upstream.module != Module::Http {
            errors.push(format!(
                "upstream '{}' is a {} upstream and cannot use http checks",
                upstream.name, upstream.module
            ));
        }

        for (field, value) in [
            ("fall", opts.fall),
            ("rise", opts.rise),
            ("keepalive", opts.keepalive),
        ] {
            if value == 0 {
                errors.push(format!(
                    "upstream '{}' has {} 0 (must be >= 1)",
                    upstream.name, field
                ));
            }
        }

        let request_len = if opts.check_type == Some(CheckType::Http) && !opts.request.uri.is_empty() {
            render_request(&opts, WIDEST_DERIVED_HOST, 0).len()
        } else {
            opts.request.body.len()
        };
        if request_len > opts.buffer_size {
            errors.push(format!(
                "upstream '{}' request of {} bytes is larger than buffer_size {}",
                upstream.name, request_len, opts.buffer_size
            ));
        }

        if let Err(e) = Pattern::optional(&opts.expected.body) {
            errors.push(format!(
                "upstream '{}' has an invalid response pattern: {}",
                upstream.name, e
            ));
        }

        if upstream.check.persistent && config.global.persist_dir.is_none() {
            errors.push(format!(
                "upstream '{}' is persistent but no persist_dir is set",
                upstream.name
            ));
        }
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
