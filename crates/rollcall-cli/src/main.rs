use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{load_gallery, rebuild_gallery, Gallery, Ledger, OnnxAnalyzer};
use rollcall_hw::Camera;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the known-faces gallery cache
    Gallery {
        #[command(subcommand)]
        action: GalleryAction,
    },
    /// Show attendance recorded on a day
    Attendance {
        /// Day to report, YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
        #[arg(long, env = "ROLLCALL_LEDGER_PATH", default_value = "attendance.csv")]
        ledger: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(clap::Args)]
struct GalleryPaths {
    #[arg(long, env = "ROLLCALL_KNOWN_FACES_DIR", default_value = "known_faces")]
    known_faces: PathBuf,
    #[arg(long, env = "ROLLCALL_GALLERY_CACHE", default_value = "encodings.msgpack")]
    cache: PathBuf,
    #[arg(long, env = "ROLLCALL_MODEL_DIR", default_value = "models")]
    models: PathBuf,
}

#[derive(Subcommand)]
enum GalleryAction {
    /// Scan the known-faces directory and write the cache
    Build {
        /// Rescan even if a cache exists
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        paths: GalleryPaths,
    },
    /// List people in the cached gallery
    List {
        #[arg(long, env = "ROLLCALL_GALLERY_CACHE", default_value = "encodings.msgpack")]
        cache: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gallery { action } => match action {
            GalleryAction::Build { force, paths } => build_gallery(&paths, force),
            GalleryAction::List { cache } => list_gallery(&cache),
        },
        Commands::Attendance { date, json, ledger } => {
            let day = date.unwrap_or_else(|| Local::now().date_naive());
            show_attendance(&Ledger::new(ledger), day, json)
        }
        Commands::Devices => {
            list_devices();
            Ok(())
        }
    }
}

fn build_gallery(paths: &GalleryPaths, force: bool) -> Result<()> {
    let mut analyzer = OnnxAnalyzer::load(&paths.models)
        .with_context(|| format!("failed to load models from {}", paths.models.display()))?;

    tracing::info!(
        known_faces = %paths.known_faces.display(),
        cache = %paths.cache.display(),
        force,
        "building gallery"
    );
    let gallery = if force {
        rebuild_gallery(&paths.cache, &paths.known_faces, &mut analyzer)?
    } else {
        let (gallery, source) = load_gallery(&paths.cache, &paths.known_faces, &mut analyzer)?;
        println!("Gallery loaded from {source:?}");
        gallery
    };

    print_gallery(&gallery);
    println!("Cache: {}", paths.cache.display());
    Ok(())
}

fn list_gallery(cache: &Path) -> Result<()> {
    match Gallery::read_cache(cache)? {
        Some(gallery) => print_gallery(&gallery),
        None => println!(
            "No gallery cache at {}. Run `rollcall gallery build` first.",
            cache.display()
        ),
    }
    Ok(())
}

fn print_gallery(gallery: &Gallery) {
    if gallery.is_empty() {
        println!("Gallery is empty");
        return;
    }
    println!("{:<24} {:>6}", "NAME", "PHOTOS");
    for (name, count) in gallery.person_counts() {
        println!("{name:<24} {count:>6}");
    }
    println!("{} embeddings total", gallery.len());
}

fn show_attendance(ledger: &Ledger, day: NaiveDate, json: bool) -> Result<()> {
    let records = ledger.records_on(day)?;
    tracing::debug!(
        ledger = %ledger.path().display(),
        %day,
        count = records.len(),
        "attendance read"
    );

    if json {
        let rows: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "timestamp": r.timestamp.format(rollcall_core::ledger::TIMESTAMP_FORMAT).to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No attendance recorded on {day}");
        return Ok(());
    }
    println!("{:<24} TIME", "NAME");
    for record in &records {
        println!("{:<24} {}", record.name, record.timestamp.format("%H:%M:%S"));
    }
    println!("{} present on {day}", records.len());
    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for device in devices {
        println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
}
