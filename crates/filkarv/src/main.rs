//! Implements the CLI for filkarv

mod cli;

use clap::Parser;
use cli::Cli;
use cli::Commands;
use eyre::WrapErr;
use filkarv_core::config::ScanEnvironment;
use filkarv_core::meta_directory::MetaDirectory;
use proc_exit::Code;
use proc_exit::Exit;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn main() -> eyre::Result<Exit> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // Set up logging with tracing
    let default_level = match cli.verbose {
        0 => tracing::level_filters::LevelFilter::WARN,
        1 => tracing::level_filters::LevelFilter::INFO,
        _ => tracing::level_filters::LevelFilter::DEBUG,
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env()?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Scan {
            path,
            unpack_directory,
            temporary_directory,
            workers,
            job_wait_time,
            tlsh_maximum,
        } => {
            let mut builder = ScanEnvironment::builder();
            builder
                .unpack_directory(unpack_directory)
                .temporary_directory(temporary_directory.unwrap_or_else(|| {
                    std::env::temp_dir().join("filkarv")
                }))
                .verbose(cli.verbose > 0);
            if let Some(workers) = workers {
                builder.workers(workers);
            }
            if let Some(seconds) = job_wait_time {
                builder.job_wait_time(Duration::from_secs(seconds));
            }
            if let Some(tlsh_maximum) = tlsh_maximum {
                builder.tlsh_maximum(tlsh_maximum);
            }
            let env = builder.build().wrap_err("Invalid scan configuration")?;

            let report = filkarv_core::scan(Arc::new(env), &path)?;
            println!(
                "Scanned {} file(s) into {:?} ({} job(s) failed)",
                report.jobs, report.root, report.failed_jobs
            );
            // Partial parse errors never fail a completed scan
            Ok(Exit::new(Code::SUCCESS))
        }
        Commands::Show { md_path, json } => {
            show(&md_path, json)?;
            Ok(Exit::new(Code::SUCCESS))
        }
    }
}

fn show(md_path: &Path, json: bool) -> eyre::Result<()> {
    let name = md_path
        .file_name()
        .ok_or_else(|| eyre::eyre!("{md_path:?} is not a meta-directory"))?
        .to_string_lossy();
    let unpack_root = md_path
        .parent()
        .ok_or_else(|| eyre::eyre!("{md_path:?} has no parent directory"))?;
    let md = MetaDirectory::open(unpack_root, &name)
        .wrap_err_with(|| format!("Failed to load meta-directory {md_path:?}"))?;
    let info = md.info();

    if json {
        println!("{}", serde_json::to_string_pretty(info)?);
        return Ok(());
    }

    println!("Path: {:?}", md.file_path());
    if let Some(size) = info.size {
        println!("Size: {size}");
    }
    let labels: Vec<_> = info.labels.iter().map(|l| l.as_str()).collect();
    println!("Labels: {}", labels.join(", "));
    if let Some(hashes) = &info.hashes {
        println!("SHA-256: {}", faster_hex::hex_string(&hashes.sha256));
        println!("SHA-1: {}", faster_hex::hex_string(&hashes.sha1));
        println!("MD5: {}", faster_hex::hex_string(&hashes.md5));
        if let Some(tlsh) = &hashes.tlsh {
            println!("TLSH: {tlsh}");
        }
    }
    if !info.metadata.is_empty() {
        println!("Metadata: {}", serde_json::to_string_pretty(&info.metadata)?);
    }
    if !info.unpacked_relative_files.is_empty() {
        println!("Unpacked files:");
        for (path, child) in &info.unpacked_relative_files {
            println!("  {path} -> {child}");
        }
    }
    if !info.unpacked_absolute_files.is_empty() {
        println!("Unpacked files (absolute):");
        for (path, child) in &info.unpacked_absolute_files {
            println!("  {path} -> {child}");
        }
    }
    if !info.extracted_files.is_empty() {
        println!("Extracted regions:");
        for (span, child) in &info.extracted_files {
            println!("  {span} -> {child}");
        }
    }
    Ok(())
}
