//! Subscriber setup for the binary, plus the redaction used whenever a
//! bearer or refresh token would otherwise reach a log line.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Characters of a token kept in the clear, enough to tell two tokens apart.
const VISIBLE_TOKEN_PREFIX: usize = 6;

/// Human-readable output. `RUST_LOG` wins over `verbose` when set.
pub fn init_cli_logger(verbose: bool) {
    let default_filter = if verbose {
        "sheet_agent=debug,info"
    } else {
        "sheet_agent=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// JSON lines, for when a front end or log collector consumes the output.
pub fn init_json_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sheet_agent=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .json(),
        )
        .init();
}

/// `ya29.a0AfB_byC...` -> `ya29.a***`. Short tokens are masked entirely.
pub fn redact(token: &str) -> String {
    let token = token.trim();
    if token.chars().count() <= VISIBLE_TOKEN_PREFIX * 2 {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(VISIBLE_TOKEN_PREFIX).collect();
    format!("{}***", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_keeps_only_a_prefix() {
        let token = "ya29.a0AfB_byCsecretsecretsecret";
        let redacted = redact(token);
        assert_eq!(redacted, "ya29.a***");
        assert!(!redacted.contains("secret"));
    }

    #[test]
    fn test_redact_masks_short_tokens() {
        assert_eq!(redact(""), "***");
        assert_eq!(redact("  abc  "), "***");
        assert_eq!(redact("1//refresh"), "***");
    }
}
