//! avatarlink CLI: interactive avatar sessions and backend diagnostics.

#![forbid(unsafe_code)]

mod interactive;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::debug;

use avatarlink_client::config::{
    DEFAULT_BACKEND_BASE, DEFAULT_PROVIDER_API_BASE, DEFAULT_SESSION_PATH,
};
use avatarlink_client::knowledge::DEFAULT_ENROLLMENT_LIMIT;
use avatarlink_client::{
    classify, AvatarQuality, BackendClient, ClientConfig, EnrollmentQuery, KnowledgeRouter,
    MediaSinks, SessionController, SessionRequestClient,
};

#[derive(Parser, Debug)]
#[command(name = "avatarlink")]
#[command(about = "Talking-avatar session client")]
struct Args {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct BackendArgs {
    /// Backend base URL (session endpoint, provider proxy, knowledge API)
    #[arg(long, global = true, env = "AVATARLINK_BACKEND", default_value = DEFAULT_BACKEND_BASE)]
    backend: String,

    /// Backend admin key, sent as X-Admin-Key
    #[arg(long, global = true, env = "AVATARLINK_ADMIN_KEY", hide_env_values = true)]
    admin_key: Option<String>,

    /// Session-creation path on the backend
    #[arg(long, global = true, env = "AVATARLINK_SESSION_PATH", default_value = DEFAULT_SESSION_PATH)]
    session_path: String,

    /// Provider API prefix rerouted through the backend proxy
    #[arg(long, global = true, env = "AVATARLINK_PROVIDER_API", default_value = DEFAULT_PROVIDER_API_BASE)]
    provider_api: String,

    /// Seconds to wait for the session endpoint
    #[arg(long, global = true, default_value_t = 12)]
    acquire_timeout_secs: u64,

    /// Seconds to wait for any other backend call
    #[arg(long, global = true, default_value_t = 12)]
    request_timeout_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an avatar session and type utterances for it to speak
    Session {
        /// Avatar to request for token sessions
        #[arg(long, env = "AVATARLINK_AVATAR_ID")]
        avatar_id: Option<String>,

        /// Rendering quality: low, medium or high
        #[arg(long, env = "AVATARLINK_QUALITY", default_value = "high")]
        quality: AvatarQuality,

        /// STUN/TURN server for direct peer sessions (repeatable)
        #[arg(long = "ice-server")]
        ice_servers: Vec<String>,

        /// Send a local microphone track on direct peer sessions
        #[arg(long, default_value_t = false)]
        microphone: bool,

        /// Seconds to wait for remote media after acquisition
        #[arg(long, default_value_t = 30)]
        media_timeout_secs: u64,
    },

    /// Request a session and show which transport it selects
    Acquire {
        /// Print the raw response as well
        #[arg(long, default_value_t = false)]
        raw: bool,
    },

    /// Ask the knowledge backend a question
    Ask {
        /// Question text
        question: Vec<String>,
    },

    /// List recent enrollments (uses the admin key when set)
    Enrollments {
        /// How many to fetch
        #[arg(long, default_value_t = DEFAULT_ENROLLMENT_LIMIT)]
        limit: u32,

        /// Only enrollments from this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Create an enrollment from a JSON object
    Enroll {
        /// Enrollment payload, e.g. '{"full_name":"Ada","program_code":"DS-12"}'
        payload: String,
    },

    /// Check backend health
    Health,

    /// Show version information
    Version,
}

impl BackendArgs {
    fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_backend(&self.backend);
        config.admin_key = self.admin_key.clone().filter(|k| !k.trim().is_empty());
        config.session_path = self.session_path.clone();
        config.provider_api_base = self.provider_api.clone();
        config.acquire_timeout = Duration::from_secs(self.acquire_timeout_secs);
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    avatarlink_common::init_tracing();

    let args = Args::parse();
    let mut config = args.backend.config();

    match args.command {
        Command::Session {
            avatar_id,
            quality,
            ice_servers,
            microphone,
            media_timeout_secs,
        } => {
            if let Some(avatar_id) = avatar_id {
                config.avatar.avatar_id = avatar_id;
            }
            config.avatar.quality = quality;
            if !ice_servers.is_empty() {
                config.ice_servers = ice_servers;
            }
            config.attach_microphone = microphone;
            config.media_timeout = Duration::from_secs(media_timeout_secs);
            debug!(?config, "session configuration");

            let controller = SessionController::from_config(&config, MediaSinks::headless(), None)
                .context("invalid configuration")?;
            let knowledge = KnowledgeRouter::new(BackendClient::new(&config)?, config.request_timeout);
            interactive::run(controller, knowledge).await?;
        }
        Command::Acquire { raw } => {
            config.validate()?;
            let http = BackendClient::new(&config)?;
            let client = SessionRequestClient::new(http, &config);
            println!("POST {}", client.session_url());

            let payload = client.fetch_raw().await?;
            if raw {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            let descriptor = classify(&payload)?;
            println!("transport:  {}", descriptor.transport_kind());
            println!("session id: {}", descriptor.session_id().unwrap_or("-"));
            println!("{descriptor:?}");
        }
        Command::Ask { question } => {
            let question = question.join(" ");
            anyhow::ensure!(!question.trim().is_empty(), "question is empty");
            config.validate()?;
            let router = KnowledgeRouter::new(BackendClient::new(&config)?, config.request_timeout);
            println!("{}", router.ask(&question).await?);
        }
        Command::Enrollments { limit, source } => {
            config.validate()?;
            let router = KnowledgeRouter::new(BackendClient::new(&config)?, config.request_timeout);
            let query = EnrollmentQuery {
                limit: Some(limit),
                source,
            };
            println!("{}", router.recent_enrollments_text(&query).await);
        }
        Command::Enroll { payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("enrollment payload is not valid JSON")?;
            anyhow::ensure!(payload.is_object(), "enrollment payload must be a JSON object");
            config.validate()?;
            let router = KnowledgeRouter::new(BackendClient::new(&config)?, config.request_timeout);
            let created = router.enroll(&payload).await?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
        Command::Health => {
            config.validate()?;
            let router = KnowledgeRouter::new(BackendClient::new(&config)?, config.request_timeout);
            let health = router.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Version => {
            println!("avatarlink {}", env!("CARGO_PKG_VERSION"));
            println!(
                "room transport: {}",
                if cfg!(feature = "livekit") {
                    "livekit"
                } else {
                    "unavailable"
                }
            );
        }
    }

    Ok(())
}
