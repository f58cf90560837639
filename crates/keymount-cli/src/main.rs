//! keymount command-line interface: mount and unmount login volumes
//! outside of a login session, and sanity-check the configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keymount_core::{logging, Config, Mounter, Volume, DEFAULT_CONFIG_PATH};
use keymount_ehd::DmcryptEngine;
use log::warn;
use std::io::Read;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "keymount",
    version,
    about = "Mount per-user volumes (local, network, encrypted containers) with login credentials."
)]
struct Cli {
    /// Path to the keymount configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log debug chatter to stderr.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mount the volumes configured for a user.
    Mount {
        /// Target user.
        user: String,

        /// Restrict to the volume with this mountpoint.
        #[arg(long)]
        mountpoint: Option<String>,

        /// Read the password from stdin instead of prompting.
        #[arg(long)]
        stdin: bool,
    },

    /// Unmount the volumes configured for a user.
    Unmount {
        /// Target user.
        user: String,

        /// Restrict to the volume with this mountpoint.
        #[arg(long)]
        mountpoint: Option<String>,
    },

    /// Validate the configuration and report problems.
    ConfigCheck,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    logging::init(if cli.debug || config.debug {
        "debug"
    } else {
        "warn"
    });

    match cli.command {
        Commands::Mount {
            user,
            mountpoint,
            stdin,
        } => cmd_mount(&config, &user, mountpoint.as_deref(), stdin),
        Commands::Unmount { user, mountpoint } => {
            cmd_unmount(&config, &user, mountpoint.as_deref())
        }
        Commands::ConfigCheck => cmd_config_check(&config),
    }
}

fn selected_volumes(config: &Config, user: &str, mountpoint: Option<&str>) -> Result<Vec<Volume>> {
    let volumes: Vec<Volume> = config
        .volumes_for(user)
        .into_iter()
        .filter(|vol| mountpoint.map_or(true, |mp| vol.mountpoint == mp))
        .cloned()
        .collect();

    if volumes.is_empty() {
        match mountpoint {
            Some(mp) => bail!("no volume configured for user {user} at {mp}"),
            None => bail!("no volumes configured for user {user}"),
        }
    }
    Ok(volumes)
}

fn read_password(from_stdin: bool) -> Result<Zeroizing<String>> {
    if from_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading password from stdin")?;
        let trimmed = buf.trim_end_matches('\n').to_string();
        Ok(Zeroizing::new(trimmed))
    } else {
        rpassword::prompt_password("Password: ")
            .map(Zeroizing::new)
            .context("reading password")
    }
}

fn cmd_mount(config: &Config, user: &str, mountpoint: Option<&str>, stdin: bool) -> Result<()> {
    let mut volumes = selected_volumes(config, user, mountpoint)?;
    let password = read_password(stdin)?;

    let engine = DmcryptEngine::new().context("locating cryptsetup")?;
    let mounter = Mounter::new(config, &engine);

    let mut failures = 0usize;
    for vol in &mut volumes {
        if let Err(e) = mounter.mount(vol, &password) {
            warn!("mount of {} failed: {e}", vol.volume);
            failures += 1;
        } else {
            println!("mounted {} at {}", vol.volume, vol.mountpoint);
        }
    }

    if failures > 0 {
        bail!("{failures} of {} volumes failed to mount", volumes.len());
    }
    Ok(())
}

fn cmd_unmount(config: &Config, user: &str, mountpoint: Option<&str>) -> Result<()> {
    let volumes = selected_volumes(config, user, mountpoint)?;

    let engine = DmcryptEngine::new().context("locating cryptsetup")?;
    let mounter = Mounter::new(config, &engine);

    let mut failures = 0usize;
    for vol in &volumes {
        if let Err(e) = mounter.unmount(vol) {
            warn!("unmount of {} failed: {e}", vol.mountpoint);
            failures += 1;
        } else {
            println!("unmounted {}", vol.mountpoint);
        }
    }

    if failures > 0 {
        bail!("{failures} of {} volumes failed to unmount", volumes.len());
    }
    Ok(())
}

fn cmd_config_check(config: &Config) -> Result<()> {
    let issues = config.validate();
    if issues.is_empty() {
        println!(
            "configuration OK ({} volume(s) defined)",
            config.volumes.len()
        );
        return Ok(());
    }
    for issue in &issues {
        eprintln!("issue: {issue}");
    }
    bail!("{} configuration issue(s) found", issues.len());
}
