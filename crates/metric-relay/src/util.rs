// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Naming helpers shared by the extractor and the batcher.

use std::env;
use tracing::warn;

/// Get the local hostname, used as the default instance.
///
/// `RELAY_HOSTNAME` wins over `HOSTNAME`, which wins over the system hostname.
/// Falls back to `"unknown"` rather than failing.
#[must_use]
pub fn get_hostname() -> String {
    for var in ["RELAY_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str() {
                if !hostname.is_empty() {
                    return hostname.to_string();
                }
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}

/// The hostname up to its first `.`.
#[must_use]
pub fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Underscores become `.`, colons become `-`. A device is prepended as `device_instance`,
/// the underscore being the only one left in the result.
#[must_use]
pub fn make_safe_instance_string(instance: &str, device: Option<&str>) -> String {
    let safe = instance.replace('_', ".").replace(':', "-");
    match device {
        Some(device) if !device.is_empty() => {
            format!("{}_{}", make_safe_instance_string(device, None), safe)
        }
        _ => safe,
    }
}

/// Brackets are reserved for the `field[instance]` suffix and `.` for nesting, so
/// `[` becomes `(`, `]` becomes `)` and `.` becomes `/`.
#[must_use]
pub fn make_safe_metric_key(metric: &str) -> String {
    metric
        .chars()
        .map(|c| match c {
            '[' => '(',
            ']' => ')',
            '.' => '/',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_instance_string() {
        assert_eq!(make_safe_instance_string("web_1:8080", None), "web.1-8080");
        assert_eq!(
            make_safe_instance_string("web_1", Some("disk_a")),
            "disk.a_web.1"
        );
        assert_eq!(make_safe_instance_string("web", Some("")), "web");
    }

    #[test]
    fn test_safe_metric_key() {
        assert_eq!(make_safe_metric_key("cpu[0].user"), "cpu(0)/user");
        assert_eq!(make_safe_metric_key("req_count"), "req_count");
    }

    #[test]
    fn test_short_hostname() {
        assert_eq!(short_hostname("ip-10-0-0-1.ec2.internal"), "ip-10-0-0-1");
        assert_eq!(short_hostname("web"), "web");
    }

    #[test]
    fn test_hostname_is_never_empty() {
        assert!(!get_hostname().is_empty());
    }
}
