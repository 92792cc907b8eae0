// Broker configuration document (YAML). Unset keys fall back to defaults,
// so a minimal file only names what it changes.
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use loom_router::{
    message_chunk_queue_for, ChunkFullBehavior, PartitionFullBehavior, QueueType, RouterConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Quic,
    H3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Disabled,
    Token,
    Mtls,
    Both,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: Transport,
    pub server: ServerSection,
    pub admin: AdminSection,
    pub auth: AuthSection,
    pub router: RouterSection,
    pub rooms: Vec<RoomOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Quic,
            server: ServerSection::default(),
            admin: AdminSection::default(),
            auth: AuthSection::default(),
            router: RouterSection::default(),
            rooms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub addr: String,
    pub tls: TlsSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: ":4242".to_string(),
            tls: TlsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub client_ca_file: Option<PathBuf>,
    pub require_client_cert: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    // Empty string disables the admin endpoint.
    pub addr: String,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            addr: ":9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub mode: AuthMode,
    pub tokens: Vec<TokenRuleConfig>,
    pub certs: Vec<CertRuleConfig>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            mode: AuthMode::Disabled,
            tokens: Vec::new(),
            certs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenRuleConfig {
    pub token: String,
    pub principal: String,
    pub rooms: Vec<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CertRuleConfig {
    pub principal: String,
    pub rooms: Vec<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub partition_count: u64,
    pub max_name_bytes: usize,
    pub max_room_bytes: usize,
    pub max_token_bytes: usize,
    pub max_key_bytes: usize,
    pub max_chunk_bytes: usize,
    pub max_message_bytes: u64,
    #[serde(rename = "max_backlog_depth")]
    pub consumer_queue_depth: usize,
    pub partition_full_behavior: String,
    pub chunk_full_behavior: String,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            partition_count: 64,
            max_name_bytes: 128,
            max_room_bytes: 128,
            max_token_bytes: 1024,
            max_key_bytes: 256,
            max_chunk_bytes: 64 << 10,
            max_message_bytes: 256 << 20,
            consumer_queue_depth: 128,
            partition_full_behavior: "drop_newest".to_string(),
            chunk_full_behavior: "drop".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoomOverride {
    pub name: String,
    pub max_backlog_depth: Option<usize>,
    pub partition_full_behavior: Option<String>,
    pub queue_type: Option<String>,
}

/// Load and validate a configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut config: Config =
        serde_yaml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Validate limits and enum values. Normalizes the legacy
    /// `partition_full_behavior: drop` spelling to `drop_newest`.
    pub fn validate(&mut self) -> Result<()> {
        if self.router.max_name_bytes == 0 {
            bail!("config: router.max_name_bytes must be > 0");
        }
        if self.router.max_room_bytes == 0 {
            bail!("config: router.max_room_bytes must be > 0");
        }
        if self.router.max_token_bytes == 0 {
            bail!("config: router.max_token_bytes must be > 0");
        }
        if self.router.max_key_bytes == 0 {
            bail!("config: router.max_key_bytes must be > 0");
        }
        if self.router.max_chunk_bytes == 0 {
            bail!("config: router.max_chunk_bytes must be > 0");
        }
        if self.router.max_message_bytes == 0 {
            bail!("config: router.max_message_bytes must be > 0");
        }
        if self.router.consumer_queue_depth == 0 {
            bail!("config: router.max_backlog_depth must be > 0");
        }
        if self.router.partition_count == 0 {
            bail!("config: router.partition_count must be > 0");
        }
        if self.router.partition_full_behavior == "drop" {
            self.router.partition_full_behavior = "drop_newest".to_string();
        }
        if PartitionFullBehavior::parse(&self.router.partition_full_behavior).is_none() {
            bail!(
                "config: unknown router.partition_full_behavior {:?}",
                self.router.partition_full_behavior
            );
        }
        if ChunkFullBehavior::parse(&self.router.chunk_full_behavior).is_none() {
            bail!(
                "config: unknown router.chunk_full_behavior {:?}",
                self.router.chunk_full_behavior
            );
        }
        for room in &mut self.rooms {
            if room.name.is_empty() {
                bail!("config: rooms entries need a name");
            }
            if let Some(behavior) = &mut room.partition_full_behavior {
                if behavior == "drop" {
                    *behavior = "drop_newest".to_string();
                }
                if PartitionFullBehavior::parse(behavior).is_none() {
                    bail!(
                        "config: unknown partition_full_behavior {:?} for room {:?}",
                        behavior,
                        room.name
                    );
                }
            }
            if let Some(queue_type) = &room.queue_type {
                if QueueType::parse(queue_type).is_none() {
                    bail!(
                        "config: unknown queue_type {:?} for room {:?}",
                        queue_type,
                        room.name
                    );
                }
            }
        }

        if self.server.addr.is_empty() {
            bail!("config: server.addr is required");
        }
        if self.server.tls.cert_file.is_some() != self.server.tls.key_file.is_some() {
            bail!("config: server.tls cert_file and key_file must be set together");
        }
        let wants_client_certs = matches!(self.auth.mode, AuthMode::Mtls | AuthMode::Both)
            || self.server.tls.require_client_cert;
        if wants_client_certs && self.server.tls.client_ca_file.is_none() {
            bail!("config: server.tls.client_ca_file is required for mTLS");
        }
        if self.auth.mode == AuthMode::Both {
            self.server.tls.require_client_cert = true;
        }
        Ok(())
    }

    /// Base routing configuration for every room without an override.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            partition_count: self.router.partition_count,
            max_name_bytes: self.router.max_name_bytes,
            max_room_bytes: self.router.max_room_bytes,
            max_token_bytes: self.router.max_token_bytes,
            max_key_bytes: self.router.max_key_bytes,
            max_chunk_bytes: self.router.max_chunk_bytes,
            max_message_bytes: self.router.max_message_bytes,
            consumer_queue_depth: self.router.consumer_queue_depth,
            message_chunk_queue: message_chunk_queue_for(self.router.max_chunk_bytes),
            partition_full_behavior: PartitionFullBehavior::parse(
                &self.router.partition_full_behavior,
            )
            .unwrap_or(PartitionFullBehavior::DropNewest),
            chunk_full_behavior: ChunkFullBehavior::parse(&self.router.chunk_full_behavior)
                .unwrap_or(ChunkFullBehavior::Drop),
            queue_type: QueueType::Partitioned,
        }
    }

    /// Per-room configurations, each the base with that room's overrides
    /// applied.
    pub fn room_overrides(&self, base: &RouterConfig) -> HashMap<String, RouterConfig> {
        let mut overrides = HashMap::new();
        for room in &self.rooms {
            let mut cfg = base.clone();
            if let Some(depth) = room.max_backlog_depth {
                if depth > 0 {
                    cfg.consumer_queue_depth = depth;
                }
            }
            if let Some(behavior) = room
                .partition_full_behavior
                .as_deref()
                .and_then(PartitionFullBehavior::parse)
            {
                cfg.partition_full_behavior = behavior;
            }
            if let Some(queue_type) = room.queue_type.as_deref().and_then(QueueType::parse) {
                cfg.queue_type = queue_type;
            }
            overrides.insert(room.name.clone(), cfg);
        }
        overrides
    }

    /// Bind address for the stream listener. The `:4242` shorthand binds
    /// every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.server.addr).context("parse server.addr")
    }

    /// Bind address for the admin endpoint, `None` when disabled.
    pub fn admin_addr(&self) -> Result<Option<SocketAddr>> {
        if self.admin.addr.is_empty() {
            return Ok(None);
        }
        parse_addr(&self.admin.addr).context("parse admin.addr").map(Some)
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid address {addr:?}"))
}
