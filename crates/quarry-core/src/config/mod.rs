mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;

use anyhow::Context;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make indexing or prompting impossible.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.index.chunk_max_size == 0 {
            anyhow::bail!("index.chunk_max_size must be greater than zero");
        }
        if self.index.chunk_overlap >= self.index.chunk_max_size {
            anyhow::bail!("index.chunk_overlap must be smaller than index.chunk_max_size");
        }
        if self.chat.reserve_tokens >= self.chat.max_prompt_tokens {
            anyhow::bail!("chat.reserve_tokens must be smaller than chat.max_prompt_tokens");
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_score) {
            anyhow::bail!("retrieval.min_score must be within 0.0..=1.0");
        }
        Ok(())
    }
}
