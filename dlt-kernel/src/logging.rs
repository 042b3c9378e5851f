use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "DLT_LOG";

/// Filtre : DLT_LOG, sinon RUST_LOG, sinon "info"
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Idempotent : un second appel (tests, binaire) ne fait rien
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging();
        init_logging();
        tracing::info!("logging initialised");
    }
}
