use anyhow::Context;
use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use hornet_fuzzer::{arch, boot, config::Config};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hornet-fuzzer", version, about = "In-VM fuzzer worker")]
struct Settings {
    /// Unique worker name, assigned by the manager.
    #[arg(long, short = 'n')]
    name: String,
    /// Target architecture.
    #[arg(long, default_value = arch::TARGET_ARCH)]
    arch: String,
    /// Manager RPC address.
    #[arg(long, short = 'm', default_value = "")]
    manager: String,
    /// Number of parallel procs.
    #[arg(long, short = 'p', default_value_t = 1)]
    procs: usize,
    /// Enable kmemleak-based periodic leak scanning.
    #[arg(long)]
    leak: bool,
    /// Write executed programs to none/stdout/dmesg/file.
    #[arg(long, short = 'o', default_value = "stdout")]
    output: String,
    /// Path to the native executor binary.
    #[arg(long, short = 'e', default_value = "./hornet-executor")]
    executor: PathBuf,
    /// One-shot image smoke test; bypasses the fuzz loop.
    #[arg(long)]
    test: bool,
    /// Keep executor stderr for debugging.
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("HORNET_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();
    log::info!("fuzzer started");

    let output = settings
        .output
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("config error")?;

    let config = Config {
        name: settings.name,
        arch: settings.arch,
        manager: settings.manager,
        procs: settings.procs,
        leak: settings.leak,
        output,
        executor: settings.executor,
        test: settings.test,
        debug: settings.debug,
    };
    boot(config)
}
