//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (for generating URLs)
    pub host: Option<String>,

    /// Server port
    pub port: u16,

    /// Database URL (PostgreSQL) or path (SQLite)
    pub database_url: String,

    /// JWT secret for token verification
    pub jwt_secret: String,

    /// Path to the metadata definition file consumed by the graph provider
    pub metadata_path: String,

    /// How long a built entity graph stays fresh before a lazy rebuild
    pub graph_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        #[cfg(not(feature = "postgres"))]
        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "sqlite:trellis.db".to_string());

        #[cfg(feature = "postgres")]
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;

        // JWT_SECRET is always required - generate a random one if not provided in dev
        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};
            let mut hasher = DefaultHasher::new();
            std::time::SystemTime::now().hash(&mut hasher);
            format!("dev-secret-{}", hasher.finish())
        });

        Ok(Self {
            host: env::var("HOST").ok(),

            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("Invalid PORT")?,

            database_url,

            jwt_secret,

            metadata_path: env::var("METADATA_PATH")
                .unwrap_or_else(|_| "./data/metadata.json".to_string()),

            graph_ttl: Duration::from_secs(
                env::var("GRAPH_TTL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("Invalid GRAPH_TTL_SECS")?,
            ),
        })
    }
}
