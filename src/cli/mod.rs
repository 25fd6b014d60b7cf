//! Command-line interface for hubsync
//!
//! This module defines the CLI structure using clap derive macros.
//! Each command group is implemented in its own submodule.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use crate::config::{self, Config};
use crate::connection::StaticConnection;
use crate::error::{Error, Result};
use crate::hub::HubApiClient;
use crate::output::OutputOptions;
use crate::queue::{HandlerRegistry, QueueOptions, SyncQueue};
use crate::repository::TaskRepository;
use crate::store::LocalTaskStore;

mod device;
mod queue;
mod task;

/// hubsync - local-first tasks mirrored to a Hub
///
/// Tasks are written to the local store first and mirrored to the Hub in the
/// background. Writes that cannot reach the Hub wait in a durable queue.
#[derive(Parser, Debug)]
#[command(name = "hubsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true, env = "HUBSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the durable sync queue
    #[arg(long, global = true, env = "HUBSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Hub base URL (overrides hub.url)
    #[arg(long, global = true, env = "HUBSYNC_HUB_URL")]
    pub hub_url: Option<String>,

    /// Hub bearer token (overrides hub.token)
    #[arg(long, global = true, env = "HUBSYNC_HUB_TOKEN", hide_env_values = true)]
    pub hub_token: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Task management
    #[command(subcommand)]
    Task(TaskCommands),

    /// Durable sync queue
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Device registration with the Hub
    #[command(subcommand)]
    Device(DeviceCommands),
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// List tasks
    List {
        /// Only this project
        #[arg(long)]
        project: Option<String>,
    },

    /// Show one task
    Show {
        /// Project id
        project: String,
        /// Task id
        task_id: String,
    },

    /// Create a task
    Create {
        /// Project id
        #[arg(long)]
        project: String,
        /// Task title
        #[arg(long)]
        title: String,
        /// Task description
        #[arg(long, default_value = "")]
        description: String,
        /// Priority: low, medium, high, urgent
        #[arg(long)]
        priority: Option<String>,
    },

    /// Update task fields
    Update {
        task_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
    },

    /// Change task status (either vocabulary)
    Status { task_id: String, status: String },

    /// Delete a task
    Delete { task_id: String },

    /// Start execution on the Hub
    Execute { task_id: String },

    /// Cancel execution on the Hub
    Cancel { task_id: String },

    /// Append a line to the task log
    Log { task_id: String, line: String },

    /// Record execution progress
    Progress {
        task_id: String,
        /// Percent complete (0-100)
        percent: u8,
        #[arg(long)]
        phase: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show queue size and Hub availability
    Status,

    /// List pending mutations in order
    List,

    /// Queue a mutation for the Hub
    Add {
        /// Entity: tasks, projects, captures, planner_events, settings
        entity: String,
        /// Action: create, update, delete
        action: String,
        /// JSON payload
        data: String,
    },

    /// Replay pending mutations now
    Sync,

    /// Drop every pending mutation
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum DeviceCommands {
    /// Register this device
    Register {
        /// Human-readable device name
        #[arg(long)]
        name: Option<String>,
    },

    /// Send a heartbeat
    Heartbeat,
}

/// Everything a command needs, built once from config and flags.
pub(crate) struct Context {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub hub: Arc<HubApiClient>,
    pub connection: Arc<StaticConnection>,
    pub queue_path: PathBuf,
    pub output: OutputOptions,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => Some(path.clone()),
            None => config::default_config_path(),
        };
        let mut config = match &config_path {
            Some(path) => Config::load_or_default(path)?,
            None => Config::default(),
        };
        if let Some(url) = &cli.hub_url {
            config.hub.url = Some(url.clone());
        }
        if let Some(token) = &cli.hub_token {
            config.hub.token = Some(token.clone());
        }
        config.validate()?;

        let hub = Arc::new(HubApiClient::new(&config.hub)?);
        let connection = Arc::new(StaticConnection::new(Arc::clone(&hub)));
        let queue_path = config.queue_file(cli.data_dir.as_deref())?;

        Ok(Self {
            config,
            config_path,
            hub,
            connection,
            queue_path,
            output: OutputOptions {
                json: cli.json,
                quiet: cli.quiet,
            },
        })
    }

    pub fn queue(&self) -> Arc<SyncQueue> {
        Arc::new(SyncQueue::open(
            self.queue_path.clone(),
            self.connection.clone(),
            HandlerRegistry::with_defaults(),
            QueueOptions {
                max_attempts: self.config.sync.max_attempts,
            },
        ))
    }

    pub fn repository(&self) -> TaskRepository {
        let store = Arc::new(LocalTaskStore::new(self.config.projects.clone()));
        TaskRepository::new(store, Arc::clone(&self.hub), self.connection.clone())
            .with_queue(self.queue())
    }

    pub fn device_id(&self) -> Result<String> {
        self.config
            .hub
            .device_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig("hub.device_id is not set".to_string()))
    }

    /// The configured device id, or a fresh one written back to the config
    /// file. Flag and env overrides are not persisted.
    pub fn ensure_device_id(&self) -> Result<String> {
        if let Ok(device_id) = self.device_id() {
            return Ok(device_id);
        }
        let device_id = format!("device-{}", Uuid::new_v4());
        if let Some(path) = &self.config_path {
            let mut on_disk = Config::load_or_default(path)?;
            on_disk.hub.device_id = Some(device_id.clone());
            on_disk.save(path)?;
            info!(path = %path.display(), device_id = %device_id, "saved new device id");
        }
        Ok(device_id)
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        let ctx = Context::load(&self)?;
        match self.command {
            Commands::Task(cmd) => task::run(&ctx, cmd).await,
            Commands::Queue(cmd) => queue::run(&ctx, cmd).await,
            Commands::Device(cmd) => device::run(&ctx, cmd).await,
        }
    }
}
