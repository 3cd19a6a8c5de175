//! API keys for the two external providers.
//!
//! Both keys are entered, remembered and forgotten together. The store
//! persists them as JSON next to the binary using an atomic write.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credentials {
    pub llm_api_key: String,
    pub tts_api_key: String,
}

impl Credentials {
    pub fn new(llm_api_key: impl Into<String>, tts_api_key: impl Into<String>) -> Self {
        Credentials {
            llm_api_key: llm_api_key.into().trim().to_string(),
            tts_api_key: tts_api_key.into().trim().to_string(),
        }
    }

    /// Both keys present.
    pub fn is_complete(&self) -> bool {
        !self.llm_api_key.is_empty() && !self.tts_api_key.is_empty()
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("llm_api_key", &redact(&self.llm_api_key))
            .field("tts_api_key", &redact(&self.tts_api_key))
            .finish()
    }
}

fn redact(key: &str) -> &'static str {
    if key.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

#[derive(Clone, Debug)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// Remembered credentials, if a complete pair was saved before.
    pub async fn load(&self) -> Option<Credentials> {
        let res = tokio::fs::read(&self.path).await;

        match res {
            Ok(res) => match serde_json::from_slice::<Credentials>(&res) {
                Ok(credentials) if credentials.is_complete() => Some(credentials),
                Ok(_) => None,
                Err(e) => {
                    warn!("Ignoring unreadable credentials file: {:?}", e);
                    None
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Error while reading credentials: {:?}", e);
                }
                None
            }
        }
    }

    /// Writes to a temp file first, then renames over the real one.
    pub async fn save(&self, credentials: &Credentials) -> Result<()> {
        let json = serde_json::to_string_pretty(credentials)?;
        let tmp = self.tmp_path();

        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    /// Forgets both keys.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}
