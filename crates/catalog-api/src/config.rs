//! Environment-driven configuration (`SPEC_FULL.md` §6 ambient additions),
//! mirroring `everruns-worker::runner::RunnerConfig::from_env`'s
//! associated-function style rather than a config-file format.

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Bearer tokens allowed to call operator-only endpoints (bundle
    /// publish, stale marking). Loaded from `APPHUB_OPERATOR_TOKENS`
    /// (comma-separated) or `APPHUB_OPERATOR_TOKENS_PATH` (one per line).
    pub operator_tokens: Vec<String>,
    /// Secret used to sign bundle-download tokens
    /// (`APPHUB_BUNDLE_DOWNLOAD_SECRET`); a fresh random secret per process
    /// if unset, which only works with a single `catalog-api` replica.
    pub download_signing_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))?;
        let bind_addr = std::env::var("APPHUB_API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());
        let operator_tokens = load_operator_tokens();
        let download_signing_secret = std::env::var("APPHUB_BUNDLE_DOWNLOAD_SECRET")
            .unwrap_or_else(|_| generate_process_secret());
        Ok(Self {
            bind_addr,
            database_url,
            operator_tokens,
            download_signing_secret,
        })
    }

    pub fn is_operator_token(&self, token: &str) -> bool {
        self.operator_tokens.iter().any(|t| t == token)
    }
}

fn generate_process_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn load_operator_tokens() -> Vec<String> {
    if let Ok(raw) = std::env::var("APPHUB_OPERATOR_TOKENS") {
        return raw
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }
    if let Ok(path) = std::env::var("APPHUB_OPERATOR_TOKENS_PATH") {
        if let Ok(contents) = std::fs::read_to_string(path) {
            return contents
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
        }
    }
    Vec::new()
}
