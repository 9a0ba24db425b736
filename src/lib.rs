pub mod config;
pub mod deploy;
pub mod device;
pub mod logging;
pub mod repl;
pub mod sync;
pub mod version_gate;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use config::{
    DEFAULT_CONTROL_PORT, DEFAULT_DEPLOY_PATH, DEFAULT_HOST, DEFAULT_SSH_USER, DeviceEndpoint,
    Settings, ShellCredentials,
};
use deploy::{DeployOptions, Deployer, PluginSource};
use device::{RemoteControlClient, SshConnector};
use repl::ReplSession;
use sync::SkipRules;
use version_gate::{GateOutcome, PluginInstaller, REPL_MODULE, VersionGate, parse_version};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "kopl",
    version,
    about = "Deploy, install and live-debug KOReader plugins"
)]
pub struct Cli {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Debug logging (same as DEBUG=1)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// How to reach the device.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Device address running the HTTP inspector plugin
    #[arg(long, short = 'H', env = "KOREADER_INSPECTOR_HOST", default_value = DEFAULT_HOST, global = true)]
    pub host: String,

    /// HTTP inspector port
    #[arg(long, short = 'p', env = "KOREADER_INSPECTOR_PORT", default_value_t = DEFAULT_CONTROL_PORT, global = true)]
    pub port: u16,

    /// SSH port; when omitted SSH is started through the inspector
    #[arg(long, short = 's', global = true)]
    pub ssh_port: Option<u16>,

    #[arg(long, short = 'u', default_value = DEFAULT_SSH_USER, global = true)]
    pub ssh_user: String,

    #[arg(long, short = 'P', global = true)]
    pub ssh_password: Option<String>,

    /// Private key to offer before the ones found in ~/.ssh
    #[arg(long, short = 'i', global = true)]
    pub ssh_identity: Option<PathBuf>,

    /// Remote directory plugins are uploaded into
    #[arg(long, short = 'd', default_value = DEFAULT_DEPLOY_PATH, global = true)]
    pub deploy_path: String,

    /// Extra glob of file or directory names to leave out (repeatable)
    #[arg(long = "exclude", value_name = "GLOB", global = true)]
    pub excludes: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a plugin directory and restart KOReader
    Deploy {
        /// Plugin directory (defaults to the current directory)
        path: Option<PathBuf>,
    },
    /// Clone a plugin repository and deploy it
    Install {
        /// `owner/name` on GitHub, a clone URL, or a local directory
        repo: String,
    },
    /// Interactive Lua REPL inside the running KOReader
    Repl {
        /// Do not check or install the companion REPL plugin
        #[arg(long)]
        no_version_check: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let settings = Settings::from_env();

    match cli.command {
        Commands::Deploy { path } => {
            let path = match path {
                Some(path) => path,
                None => std::env::current_dir().context("failed to read current directory")?,
            };
            run_deploy(&cli.device, &settings, &PluginSource::Local(path))
        }
        Commands::Install { repo } => {
            run_deploy(&cli.device, &settings, &PluginSource::parse(&repo))
        }
        Commands::Repl { no_version_check } => {
            run_repl(&cli.device, &settings, no_version_check || settings.skip_version_check)
        }
    }
}

fn endpoint(args: &DeviceArgs) -> DeviceEndpoint {
    DeviceEndpoint::new(&args.host, args.port)
}

fn credentials(args: &DeviceArgs, settings: &Settings) -> Result<ShellCredentials> {
    let mut creds = ShellCredentials::new(&args.ssh_user)
        .with_password(args.ssh_password.clone())
        .with_transport_port(args.ssh_port);
    if let Some(identity) = &args.ssh_identity {
        creds = creds
            .with_identity_file(identity)
            .with_context(|| format!("failed to load SSH identity {}", identity.display()))?;
    }
    Ok(creds.with_discovered_identities(settings.key_dir.as_deref()))
}

fn deploy_options(args: &DeviceArgs) -> Result<DeployOptions> {
    let rules = args
        .excludes
        .iter()
        .try_fold(SkipRules::default(), |rules, pattern| {
            rules
                .with_pattern(pattern)
                .with_context(|| format!("invalid --exclude pattern {pattern:?}"))
        })?;
    Ok(DeployOptions {
        deploy_path: args.deploy_path.clone(),
        rules,
    })
}

fn deployer<'a>(
    client: &'a RemoteControlClient,
    args: &DeviceArgs,
    settings: &Settings,
) -> Result<Deployer<'a, device::HttpTransport, SshConnector>> {
    Ok(Deployer::new(
        client,
        SshConnector::new(settings.ssh_timeout),
        &args.host,
        credentials(args, settings)?,
        deploy_options(args)?,
    ))
}

/// Sets up SSH credentials only once the version gate asks for an install.
struct DeferredInstaller<'a> {
    client: &'a RemoteControlClient,
    args: &'a DeviceArgs,
    settings: &'a Settings,
}

impl PluginInstaller for DeferredInstaller<'_> {
    fn install(&mut self, source: &PluginSource) -> Result<()> {
        deployer(self.client, self.args, self.settings)?.install(source)
    }
}

fn run_deploy(args: &DeviceArgs, settings: &Settings, source: &PluginSource) -> Result<()> {
    let client = RemoteControlClient::connect(&endpoint(args), settings.http_timeout)?;
    let mut deployer = deployer(&client, args, settings)?;
    let report = deployer.deploy_source(source)?;

    println!(
        "Deployed {} files ({} bytes) to {}",
        report.files_transferred(),
        report.bytes_transferred,
        report.remote_root
    );
    for warning in &report.permission_warnings {
        println!("  {} {}: {}", "warning:".yellow(), warning.remote_path, warning.message);
    }
    println!("KOReader is restarting.");
    Ok(())
}

fn run_repl(args: &DeviceArgs, settings: &Settings, skip_version_check: bool) -> Result<()> {
    let client = RemoteControlClient::connect(&endpoint(args), settings.http_timeout)?;

    if !skip_version_check {
        let minimum = parse_version(&settings.repl_min_version).with_context(|| {
            format!("invalid minimum REPL plugin version {:?}", settings.repl_min_version)
        })?;
        let source = PluginSource::parse(&settings.repl_plugin_source);
        let mut installer = DeferredInstaller {
            client: &client,
            args,
            settings,
        };
        let outcome = VersionGate::new(&client).ensure_minimum_version(
            REPL_MODULE,
            &minimum,
            &source,
            &mut installer,
        )?;
        if let GateOutcome::Installed { previous } = outcome {
            println!(
                "Installed the REPL plugin (was {previous}). KOReader is restarting; run `kopl repl` again once it is back."
            );
            return Ok(());
        }
    }

    let mut session = ReplSession::new(&client);
    session
        .reset()
        .context("failed to clear the remote REPL state")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(
        out,
        "{} on {}. Type `exit` or `quit` to leave.",
        "KOReader Lua REPL".bold(),
        args.host
    )?;

    let mut lines = repl::stdin_lines();
    repl::run_loop(&mut session, lines.as_mut(), &mut out, &mut io::stderr())?;
    Ok(())
}
