use log::Level;

/// Keys whose values never reach a log line.
const SECRET_KEYS: [&str; 3] = ["PWD", "PASSWORD", "ACCESSTOKEN"];

/// Replaces secret values in an ODBC connection string with `***`.
pub fn redact_connection_string(connection_string: &str) -> String {
    connection_string
        .split(';')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_ascii_uppercase().as_str()) => {
                format!("{}=***", key)
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub struct StructuredLogger {
    enabled: bool,
}

impl StructuredLogger {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn log_job(&self, level: Level, kind: &str, origin: &str, metadata: &[(&str, String)]) {
        if !self.enabled {
            return;
        }

        let mut message = format!("Job {} at {}", kind, origin);
        for (key, value) in metadata {
            message.push_str(&format!(", {}={}", key, value));
        }

        log::log!(level, "{}", message);
    }

    pub fn log_connection(&self, level: Level, connection_string: &str, action: &str) {
        if !self.enabled {
            return;
        }

        log::log!(
            level,
            "Connection {}: {}",
            action,
            redact_connection_string(connection_string)
        );
    }

    pub fn log_error(&self, error: &str, metadata: &[(&str, String)]) {
        if !self.enabled {
            return;
        }

        let mut message = format!("Error: {}", error);
        for (key, value) in metadata {
            message.push_str(&format!(", {}={}", key, value));
        }

        log::error!("{}", message);
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(true)
    }
}
