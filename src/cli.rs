//! Command line surface and dispatch.

use crate::{
    config::Config,
    container::{
        self, exec, init, ops,
        runner::{Runner, EXIT_EXEC_FAILURE},
        ContainerConfig, ContainerConfigBuilder,
    },
    error::Error,
    image::{import, pull, reference, store::ImageStore},
    logs::{logs, LogOptions},
    network::NetworkMode,
    state::{ContainerState, StateStore},
    volume::{Mount, VolumeStore},
};
use anyhow::{bail, Context, Result};
use clap::{ArgEnum, Args, Parser, Subcommand};
use log::debug;
use std::{
    env,
    fs::File,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

#[derive(Parser)]
#[clap(
    name = "vessel",
    version,
    about = "Minimal Linux container runtime",
    propagate_version = true
)]
/// vessel - run commands in isolated Linux containers
pub struct Cli {
    #[clap(flatten)]
    config: Config,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command in a new container
    Run(RunArgs),
    /// Run a command in a running container
    Exec(ExecArgs),
    /// Stop running containers
    Stop(StopArgs),
    /// Send a signal to running containers
    Kill(KillArgs),
    /// Remove containers
    Rm(RmArgs),
    /// List containers
    Ps(PsArgs),
    /// Fetch the logs of a container
    Logs(LogsArgs),
    /// Show low-level information on containers
    Inspect(InspectArgs),
    /// List images
    Images(ImagesArgs),
    /// Remove images
    Rmi(RmiArgs),
    /// Load an image from an OCI layout tar archive
    Load(LoadArgs),
    /// Pull an image from a registry
    Pull(PullArgs),
    /// Manage volumes
    #[clap(subcommand)]
    Volume(VolumeCommand),
}

#[derive(ArgEnum, Clone, Copy, Debug, Eq, PartialEq)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Args)]
#[clap(trailing_var_arg = true)]
struct RunArgs {
    /// Run the container in the background and print its ID
    #[clap(short = 'd', long)]
    detach: bool,

    /// Allocate a pseudo TTY
    #[clap(short = 't', long)]
    tty: bool,

    /// Keep stdin open
    #[clap(short = 'i', long)]
    interactive: bool,

    /// Use a prepared rootfs directory instead of an image
    #[clap(long, value_name("PATH"))]
    rootfs: Option<PathBuf>,

    /// Container hostname (defaults to the short ID)
    #[clap(long, value_name("NAME"))]
    hostname: Option<String>,

    /// Memory limit (e.g. 512m, 1g)
    #[clap(short = 'm', long = "memory", value_name("SIZE"))]
    memory: Option<String>,

    /// Memory plus swap limit; -1 for unlimited swap
    #[clap(long, value_name("SIZE"))]
    memory_swap: Option<String>,

    /// Number of CPUs (fractional allowed)
    #[clap(long, value_name("COUNT"), conflicts_with("cpu-quota"))]
    cpus: Option<f64>,

    /// CPU quota in microseconds per period
    #[clap(long, value_name("US"))]
    cpu_quota: Option<i64>,

    /// CPU period in microseconds
    #[clap(long, value_name("US"), default_value("100000"))]
    cpu_period: i64,

    /// Maximum number of processes
    #[clap(long, value_name("N"))]
    pids_limit: Option<i64>,

    /// Network mode: bridge, host or none
    #[clap(long, value_name("MODE"), default_value("bridge"))]
    network: NetworkMode,

    /// Publish container ports ([IP:]HOST:CONTAINER[/PROTO])
    #[clap(short = 'p', long = "publish", value_name("SPEC"))]
    publish: Vec<crate::network::port::PortMapping>,

    /// Bind or volume mounts (SRC:DST[:ro])
    #[clap(short = 'v', long = "volume", value_name("SPEC"))]
    volumes: Vec<String>,

    /// Environment variables for the command (KEY=VALUE)
    #[clap(short = 'e', long = "env", value_name("KV"))]
    env: Vec<String>,

    /// IMAGE CMD [ARG...] (or CMD [ARG...] with --rootfs)
    #[clap(required = true, value_name("IMAGE|CMD"), allow_hyphen_values = true)]
    image_and_command: Vec<String>,
}

#[derive(Args)]
#[clap(trailing_var_arg = true)]
struct ExecArgs {
    /// Allocate a pseudo TTY
    #[clap(short = 't', long)]
    tty: bool,

    /// Keep stdin open
    #[clap(short = 'i', long)]
    interactive: bool,

    /// Container ID or unique prefix
    container: String,

    /// Command and arguments
    #[clap(required = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct StopArgs {
    /// Seconds to wait before killing the container
    #[clap(short = 't', long = "time", value_name("SECS"), default_value("10"))]
    time: u64,

    /// Containers to stop
    #[clap(required = true)]
    containers: Vec<String>,
}

#[derive(Args)]
struct KillArgs {
    /// Signal to send (name or number)
    #[clap(short = 's', long = "signal", value_name("SIGNAL"), default_value("KILL"))]
    signal: String,

    /// Containers to signal
    #[clap(required = true)]
    containers: Vec<String>,
}

#[derive(Args)]
struct RmArgs {
    /// Kill a running container before removing it
    #[clap(short = 'f', long)]
    force: bool,

    /// Containers to remove
    #[clap(required = true)]
    containers: Vec<String>,
}

#[derive(Args)]
struct PsArgs {
    /// Include stopped containers
    #[clap(short = 'a', long)]
    all: bool,

    /// Only print container IDs
    #[clap(short = 'q', long)]
    quiet: bool,

    /// Output format
    #[clap(long, arg_enum, default_value("table"))]
    format: OutputFormat,

    /// Do not truncate IDs
    #[clap(long)]
    no_trunc: bool,
}

#[derive(Args)]
struct LogsArgs {
    /// Keep streaming until the container stops
    #[clap(short = 'f', long)]
    follow: bool,

    /// Number of lines from the end (or "all")
    #[clap(long, value_name("N|all"), default_value("all"))]
    tail: String,

    /// Only stdout
    #[clap(long)]
    stdout: bool,

    /// Only stderr
    #[clap(long)]
    stderr: bool,

    /// Container ID or unique prefix
    container: String,
}

#[derive(Args)]
struct InspectArgs {
    /// Containers to inspect
    #[clap(required = true)]
    containers: Vec<String>,
}

#[derive(Args)]
struct ImagesArgs {
    /// Only print image IDs
    #[clap(short = 'q', long)]
    quiet: bool,

    /// Do not truncate digests
    #[clap(long)]
    no_trunc: bool,

    /// Output format
    #[clap(long, arg_enum, default_value("table"))]
    format: OutputFormat,
}

#[derive(Args)]
struct RmiArgs {
    /// Remove even when containers reference the image
    #[clap(short = 'f', long)]
    force: bool,

    /// Images (tag or digest references)
    #[clap(required = true)]
    images: Vec<String>,
}

#[derive(Args)]
struct LoadArgs {
    /// Archive to read
    #[clap(short = 'i', long = "input", value_name("FILE"))]
    input: PathBuf,

    /// Tag to apply to the loaded image
    #[clap(short = 't', long = "tag", value_name("TAG"))]
    tag: Option<String>,
}

#[derive(Args)]
struct PullArgs {
    /// Suppress progress output
    #[clap(short = 'q', long)]
    quiet: bool,

    /// Platform to select from multi-platform images
    #[clap(long, value_name("OS/ARCH"), default_value("linux/amd64"))]
    platform: String,

    /// Image reference
    image: String,
}

#[derive(Subcommand)]
enum VolumeCommand {
    /// Create a volume
    Create {
        /// Volume name
        name: String,
    },
    /// List volumes
    Ls {
        /// Only print names
        #[clap(short = 'q', long)]
        quiet: bool,
    },
    /// Remove volumes
    Rm {
        /// Volumes to remove
        #[clap(required = true)]
        names: Vec<String>,
    },
}

impl Cli {
    /// Parse the process arguments.
    pub fn from_args() -> Self {
        <Self as Parser>::parse()
    }

    /// Run the selected subcommand; returns the process exit code.
    pub async fn dispatch(self) -> i32 {
        if let Err(e) = self.init_logging() {
            eprintln!("Error: {:#}", e);
            return 1;
        }

        let exec_failure = matches!(self.command, Command::Exec(_));
        match self.run_command().await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                if exec_failure && Error::is_not_found(&e) {
                    EXIT_EXEC_FAILURE
                } else {
                    1
                }
            }
        }
    }

    /// Initialize the logger and set the verbosity to the configured
    /// level.
    fn init_logging(&self) -> Result<()> {
        if env::var_os("RUST_LOG").is_none() {
            env::set_var(
                "RUST_LOG",
                format!("{}={}", clap::crate_name!(), self.config.log_level()),
            );
        }
        env_logger::try_init().context("init env logger")
    }

    async fn run_command(self) -> Result<i32> {
        let config = self.config;
        match self.command {
            Command::Run(args) => run(config, args).await,
            Command::Exec(args) => {
                let store = StateStore::new(config.containers_dir())?;
                exec::exec(
                    &store,
                    &args.container,
                    &args.command,
                    args.tty,
                    args.interactive,
                )
                .await
            }
            Command::Stop(args) => {
                let store = StateStore::new(config.containers_dir())?;
                for container in &args.containers {
                    ops::stop(&store, container, Duration::from_secs(args.time)).await?;
                    println!("{}", container);
                }
                Ok(0)
            }
            Command::Kill(args) => {
                let store = StateStore::new(config.containers_dir())?;
                let signal = ops::parse_signal(&args.signal)?;
                for container in &args.containers {
                    ops::kill_container(&store, container, signal)?;
                    println!("{}", container);
                }
                Ok(0)
            }
            Command::Rm(args) => {
                let store = StateStore::new(config.containers_dir())?;
                for container in &args.containers {
                    ops::remove(&config, &store, container, args.force).await?;
                    println!("{}", container);
                }
                Ok(0)
            }
            Command::Ps(args) => ps(&config, args),
            Command::Logs(args) => {
                let store = StateStore::new(config.containers_dir())?;
                let options = LogOptions {
                    follow: args.follow,
                    tail: parse_tail(&args.tail)?,
                    // Neither flag selects both streams.
                    stdout: args.stdout || !args.stderr,
                    stderr: args.stderr || !args.stdout,
                };
                let container = args.container.clone();
                tokio::task::spawn_blocking(move || {
                    logs(&store, &container, options, &mut std::io::stdout())
                })
                .await
                .context("join log task")??;
                Ok(0)
            }
            Command::Inspect(args) => inspect(&config, args),
            Command::Images(args) => images(&config, args),
            Command::Rmi(args) => {
                let store = ImageStore::new(config.images_dir())?;
                for image in &args.images {
                    // Removing by digest drops every tag at once; require
                    // force when more than one would disappear.
                    if !args.force {
                        if let Some(digest) = reference::digest_of(image) {
                            let tags = store.tags_of(digest)?;
                            if tags.len() > 1 {
                                bail!(
                                    "image {} is referenced by {} tags, use force to remove",
                                    image,
                                    tags.len()
                                );
                            }
                        }
                    }
                    let removed = store.remove(image)?;
                    for tag in removed.untagged() {
                        println!("Untagged: {}", tag);
                    }
                    if let Some(digest) = removed.deleted() {
                        println!("Deleted: {}", digest);
                    }
                }
                Ok(0)
            }
            Command::Load(args) => {
                let store = ImageStore::new(config.images_dir())?;
                let file = File::open(&args.input)
                    .with_context(|| format!("open archive {}", args.input.display()))?;
                let digest = import::import(&store, file, args.tag.as_deref())?;
                println!("Loaded image: {}", digest);
                Ok(0)
            }
            Command::Pull(args) => {
                let store = ImageStore::new(config.images_dir())?;
                let (os, arch) = parse_platform(&args.platform)?;
                if !args.quiet {
                    println!("Pulling {} ({}/{})", args.image, os, arch);
                }
                let client = pull::DefaultRegistryClient::default();
                let digest = pull::pull(&store, &client, &args.image, &os, &arch).await?;
                println!("{}", digest);
                Ok(0)
            }
            Command::Volume(command) => volume(&config, command).await,
        }
    }
}

async fn run(config: Config, args: RunArgs) -> Result<i32> {
    let (image_ref, command) = if args.rootfs.is_some() {
        (None, args.image_and_command.clone())
    } else {
        let (image, rest) = args
            .image_and_command
            .split_first()
            .context("missing image reference")?;
        (Some(image.clone()), rest.to_vec())
    };

    let images = ImageStore::new(config.images_dir())?;
    let command = if command.is_empty() {
        // Fall back to the image's configured entrypoint and cmd.
        let image_ref = image_ref.as_ref().context("no command given")?;
        let digest = images.resolve(image_ref)?;
        let manifest = images.manifest(&digest)?;
        let image_config = images.image_config(&manifest)?;
        image_config
            .config
            .map(|c| {
                let mut argv = c.entrypoint.unwrap_or_default();
                argv.extend(c.cmd.unwrap_or_default());
                argv
            })
            .unwrap_or_default()
    } else {
        command
    };
    let (binary, arguments) = command
        .split_first()
        .map(|(b, a)| (b.clone(), a.to_vec()))
        .context("no command to run")?;

    if args.cpus.is_some() && args.cpu_quota.is_some() {
        return Err(
            Error::InvalidConfig("--cpus and --cpu-quota are mutually exclusive".into()).into(),
        );
    }
    let cpu_quota = match (args.cpus, args.cpu_quota) {
        (Some(cpus), _) => {
            if cpus <= 0.0 {
                return Err(Error::InvalidConfig("--cpus must be positive".into()).into());
            }
            Some((cpus * args.cpu_period as f64) as i64)
        }
        (None, quota) => quota,
    };

    let mounts = args
        .volumes
        .iter()
        .map(|spec| Mount::parse(spec))
        .collect::<Result<Vec<_>>>()?;

    let id = container::generate_id();
    let hostname = args
        .hostname
        .clone()
        .unwrap_or_else(|| container::short_id(&id).to_string());

    let container_config: ContainerConfig = ContainerConfigBuilder::default()
        .id(id.clone())
        .command(binary)
        .args(arguments)
        .hostname(hostname)
        .rootfs_path(args.rootfs.clone())
        .image_ref(image_ref)
        .tty(args.tty)
        .interactive(args.interactive)
        .detached(args.detach)
        .memory_bytes(args.memory.as_deref().map(parse_memory).transpose()?)
        .memory_swap_bytes(args.memory_swap.as_deref().map(parse_memory).transpose()?)
        .cpu_quota_us(cpu_quota)
        .cpu_period_us(args.cpu_period)
        .pids_limit(args.pids_limit)
        .network(args.network)
        .port_mappings(args.publish.clone())
        .mounts(mounts)
        .env(args.env.clone())
        .build()
        .context("build container configuration")?;

    let runner = Runner::new(config.clone())?;
    if args.detach {
        let dir = runner.store().create(&container_config)?;
        spawn_shim(&config, &dir)?;
        println!("{}", id);
        return Ok(0);
    }

    runner.run(&container_config, true).await
}

/// Start the detached supervisor: the own binary re-executed behind the
/// shim sentinel, fully disconnected from this terminal.
fn spawn_shim(config: &Config, container_dir: &std::path::Path) -> Result<()> {
    debug!("Spawning shim for {}", container_dir.display());
    std::process::Command::new("/proc/self/exe")
        .env(init::ENV_SHIM_DIR, container_dir)
        .env("VESSEL_ROOT", config.root())
        .env("VESSEL_LOG_LEVEL", config.log_level().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn shim process")?;
    Ok(())
}

fn ps(config: &Config, args: PsArgs) -> Result<i32> {
    let store = StateStore::new(config.containers_dir())?;
    let states = store.list(args.all)?;

    if args.quiet {
        for state in &states {
            println!("{}", format_id(&state.id, args.no_trunc));
        }
        return Ok(0);
    }

    if args.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(0);
    }

    println!(
        "{:<14} {:<24} {:<24} {:<10} {:<8}",
        "CONTAINER ID", "IMAGE", "COMMAND", "STATUS", "EXIT"
    );
    for state in &states {
        let command = store
            .config(&state.id)
            .map(|c| c.argv().join(" "))
            .unwrap_or_default();
        println!(
            "{:<14} {:<24} {:<24} {:<10} {:<8}",
            format_id(&state.id, args.no_trunc),
            state.image_ref.clone().unwrap_or_else(|| "-".into()),
            truncate(&command, 24),
            format!("{:?}", state.status).to_lowercase(),
            state
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(0)
}

fn inspect(config: &Config, args: InspectArgs) -> Result<i32> {
    let store = StateStore::new(config.containers_dir())?;

    #[derive(serde::Serialize)]
    struct Inspected {
        #[serde(flatten)]
        state: ContainerState,
        config: ContainerConfig,
    }

    let mut result = vec![];
    for container in &args.containers {
        let state = store.get(container)?;
        let config = store.config(&state.id)?;
        result.push(Inspected { state, config });
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn images(config: &Config, args: ImagesArgs) -> Result<i32> {
    let store = ImageStore::new(config.images_dir())?;
    let repositories = store.repositories()?;

    if args.quiet {
        let mut seen = std::collections::BTreeSet::new();
        for digest in repositories.values() {
            if seen.insert(digest.clone()) {
                println!("{}", format_digest(digest, args.no_trunc));
            }
        }
        return Ok(0);
    }

    #[derive(serde::Serialize)]
    struct ImageRow {
        reference: String,
        digest: String,
        size: i64,
    }

    let mut rows = vec![];
    for (reference, digest) in &repositories {
        let size = store.manifest(digest).map(|m| m.blob_size()).unwrap_or(0);
        rows.push(ImageRow {
            reference: reference.clone(),
            digest: digest.clone(),
            size,
        });
    }

    if args.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    println!("{:<40} {:<16} {:>10}", "REPOSITORY:TAG", "IMAGE ID", "SIZE");
    for row in rows {
        println!(
            "{:<40} {:<16} {:>10}",
            row.reference,
            format_digest(&row.digest, args.no_trunc),
            format_size(row.size)
        );
    }
    Ok(0)
}

async fn volume(config: &Config, command: VolumeCommand) -> Result<i32> {
    let store = VolumeStore::new(config.volumes_dir(), config.containers_dir())?;
    match command {
        VolumeCommand::Create { name } => {
            store.create(&name).await?;
            println!("{}", name);
        }
        VolumeCommand::Ls { quiet } => {
            if !quiet {
                println!("{:<32} {}", "VOLUME NAME", "CREATED");
            }
            for volume in store.list().await? {
                if quiet {
                    println!("{}", volume.name());
                } else {
                    println!("{:<32} {}", volume.name(), volume.created_at());
                }
            }
        }
        VolumeCommand::Rm { names } => {
            for name in names {
                store.delete(&name).await?;
                println!("{}", name);
            }
        }
    }
    Ok(0)
}

/// Parse memory size strings: optional `b/k/kb/m/mb/g/gb` suffix, case
/// insensitive, decimal values allowed. `-1` passes through for
/// "unlimited swap".
pub fn parse_memory(input: &str) -> Result<i64> {
    let s = input.trim().to_lowercase();
    if s == "-1" {
        return Ok(-1);
    }

    let (number, multiplier): (&str, i64) = if let Some(n) = s.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("gb") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid memory size: {}", input)))?;
    if value < 0.0 {
        return Err(Error::InvalidConfig(format!("invalid memory size: {}", input)).into());
    }
    Ok((value * multiplier as f64) as i64)
}

/// Parse `os/arch` platform strings.
fn parse_platform(platform: &str) -> Result<(String, String)> {
    match platform.split_once('/') {
        Some((os, arch)) if !os.is_empty() && !arch.is_empty() => {
            Ok((os.to_string(), arch.to_string()))
        }
        _ => Err(Error::InvalidConfig(format!("invalid platform: {}", platform)).into()),
    }
}

fn parse_tail(tail: &str) -> Result<Option<usize>> {
    if tail == "all" {
        return Ok(None);
    }
    tail.parse()
        .map(Some)
        .map_err(|_| Error::InvalidConfig(format!("invalid tail value: {}", tail)).into())
}

fn format_id(id: &str, no_trunc: bool) -> String {
    if no_trunc {
        id.into()
    } else {
        container::short_id(id).into()
    }
}

fn format_digest(digest: &str, no_trunc: bool) -> String {
    if no_trunc {
        digest.into()
    } else {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        hex.chars().take(12).collect()
    }
}

fn format_size(size: i64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", size, UNITS[unit])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.into()
    } else {
        format!("{}…", s.chars().take(max - 1).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sizes() -> Result<()> {
        assert_eq!(parse_memory("1024")?, 1024);
        assert_eq!(parse_memory("1024b")?, 1024);
        assert_eq!(parse_memory("1k")?, 1024);
        assert_eq!(parse_memory("1kb")?, 1024);
        assert_eq!(parse_memory("512m")?, 512 * 1024 * 1024);
        assert_eq!(parse_memory("512MB")?, 512 * 1024 * 1024);
        assert_eq!(parse_memory("2g")?, 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1.5g")?, (1.5 * 1024.0 * 1024.0 * 1024.0) as i64);
        assert_eq!(parse_memory("-1")?, -1);

        assert!(parse_memory("").is_err());
        assert!(parse_memory("abc").is_err());
        assert!(parse_memory("-2g").is_err());
        assert!(parse_memory("1x").is_err());
        Ok(())
    }

    #[test]
    fn platform_parsing() -> Result<()> {
        assert_eq!(
            parse_platform("linux/amd64")?,
            ("linux".to_string(), "amd64".to_string())
        );
        assert!(parse_platform("linux").is_err());
        assert!(parse_platform("/amd64").is_err());
        Ok(())
    }

    #[test]
    fn tail_parsing() -> Result<()> {
        assert_eq!(parse_tail("all")?, None);
        assert_eq!(parse_tail("10")?, Some(10));
        assert!(parse_tail("ten").is_err());
        Ok(())
    }

    #[test]
    fn id_and_digest_formatting() {
        let id = "0123456789abcdef0123456789abcdef";
        assert_eq!(format_id(id, false), "0123456789ab");
        assert_eq!(format_id(id, true), id);

        let digest = format!("sha256:{}", "f".repeat(64));
        assert_eq!(format_digest(&digest, false), "ffffffffffff");
        assert_eq!(format_digest(&digest, true), digest);
    }

    #[test]
    fn sizes_format_human_readable() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0kB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0MB");
    }

    #[test]
    fn cli_parses_run_command() -> Result<()> {
        let cli = Cli::try_parse_from([
            "vessel", "run", "-d", "-m", "512m", "--network", "none", "-p", "8080:80",
            "-v", "/data:/data:ro", "alpine", "/bin/sh", "-c", "echo hi",
        ])?;

        match cli.command {
            Command::Run(args) => {
                assert!(args.detach);
                assert_eq!(args.memory.as_deref(), Some("512m"));
                assert_eq!(args.network, NetworkMode::None);
                assert_eq!(args.publish.len(), 1);
                assert_eq!(args.volumes, vec!["/data:/data:ro"]);
                // Hyphenated values after the image belong to the command.
                assert_eq!(
                    args.image_and_command,
                    vec!["alpine", "/bin/sh", "-c", "echo hi"]
                );
            }
            _ => panic!("expected run command"),
        }
        Ok(())
    }

    #[test]
    fn cli_parses_exec_with_flags() -> Result<()> {
        let cli = Cli::try_parse_from(["vessel", "exec", "-t", "abc123", "ls", "-la"])?;
        match cli.command {
            Command::Exec(args) => {
                assert!(args.tty);
                assert_eq!(args.container, "abc123");
                assert_eq!(args.command, vec!["ls", "-la"]);
            }
            _ => panic!("expected exec command"),
        }
        Ok(())
    }

    #[test]
    fn cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["vessel"]).is_err());
    }
}
