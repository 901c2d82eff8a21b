use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use bkp::backup::BackupDriver;
use bkp::labels::LABEL_ID_ALLOCATE;
use bkp::library::BackupOptions;
use bkp::plan::BackupPlan;
use bkp::records::BackupType;
use bkp::restore::{RestoreDriver, VerifyDriver};

#[derive(Parser)]
#[command(name = "bkp", version, about = "Chunked, deduplicating backup volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up files into a volume series
    Backup {
        /// Library path, e.g. /backups/home.0.bkp
        #[arg(short, long, required_unless_present = "plan")]
        output: Option<PathBuf>,
        /// Backup type: full, incremental, differential
        #[arg(short = 't', long, default_value = "full")]
        backup_type: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Compress chunks with zlib when it saves space
        #[arg(short, long)]
        compress: bool,
        /// Split into volumes of this many MB (0 = one big volume)
        #[arg(long, default_value = "0")]
        split_size_mb: u64,
        /// Back up under this label id (0 allocates when --label-name is new)
        #[arg(long, default_value = "0")]
        label_id: u64,
        #[arg(long, default_value = "")]
        label_name: String,
        /// Run a saved plan instead of flags
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Write the configuration to a plan file instead of running
        #[arg(long)]
        save_plan: Option<PathBuf>,
        /// Paths to back up
        input: Vec<PathBuf>,
    },
    /// Restore a snapshot to a directory
    Restore {
        /// Any volume of the source library
        source: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(long, default_value = "1")]
        label_id: u64,
        /// 0 = newest snapshot of the label
        #[arg(long, default_value = "0")]
        snapshot: usize,
        /// Restore only these stored paths (default: everything)
        paths: Vec<String>,
    },
    /// Compare a snapshot against the filesystem
    Verify {
        source: PathBuf,
        /// Filesystem prefix the stored paths are compared under
        #[arg(long, default_value = "/")]
        compare_prefix: PathBuf,
        #[arg(long, default_value = "1")]
        label_id: u64,
        #[arg(long, default_value = "0")]
        snapshot: usize,
        paths: Vec<String>,
    },
    /// List the snapshots of a label
    List {
        source: PathBuf,
        #[arg(long, default_value = "1")]
        label_id: u64,
        /// Walk past the most recent full backup
        #[arg(long)]
        all: bool,
    },
    /// List the labels in a library
    Labels {
        source: PathBuf,
    },
    /// Show a saved backup plan
    Plan {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {

        // ── Backup ───────────────────────────────────────────────────────────
        Commands::Backup {
            output, backup_type, description, compress, split_size_mb,
            label_id, label_name, plan, save_plan, input,
        } => {
            let (options, destination, paths) = if let Some(plan_path) = plan {
                let plan = BackupPlan::load(&plan_path)?;
                println!("Running plan: {}", plan_path.display());
                (plan.to_backup_options(), plan.destination.clone(), plan.paths.checked.clone())
            } else {
                let destination = output
                    .ok_or("an --output library path is required")?
                    .to_string_lossy()
                    .into_owned();
                let options = BackupOptions {
                    description,
                    backup_type: parse_backup_type(&backup_type)?,
                    enable_compression: compress,
                    max_volume_size_mb: split_size_mb,
                    label_id,
                    label_name,
                };
                let paths: Vec<String> = input
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                (options, destination, paths)
            };
            if paths.is_empty() {
                return Err("nothing to back up".into());
            }

            if let Some(plan_path) = save_plan {
                let plan = plan_from_options(&options, &destination, &paths);
                plan.save(&plan_path)?;
                println!("Saved plan: {}", plan_path.display());
                return Ok(());
            }

            let mut driver = BackupDriver::new(paths, destination, options);
            driver.set_volume_change_callback(Box::new(prompt_for_volume));
            let mut progress = progress_printer("Backup");
            let committed = driver.perform_backup(Some(&mut progress))?;
            println!();
            if committed {
                println!("Backup complete.");
            } else {
                println!("Backup cancelled.");
            }
        }

        // ── Restore ──────────────────────────────────────────────────────────
        Commands::Restore { source, output_dir, label_id, snapshot, paths } => {
            let mut driver = RestoreDriver::new(
                source.to_string_lossy(),
                output_dir.to_string_lossy(),
                label_id,
                snapshot,
                paths.into_iter().collect::<BTreeSet<String>>(),
            );
            driver.set_volume_change_callback(Box::new(prompt_for_volume));
            let mut progress = progress_printer("Restore");
            driver.perform_restore(Some(&mut progress))?;
            println!();
            println!("Restored to: {}", output_dir.display());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { source, compare_prefix, label_id, snapshot, paths } => {
            let mut driver = VerifyDriver::new(
                source.to_string_lossy(),
                compare_prefix.to_string_lossy(),
                label_id,
                snapshot,
                paths.into_iter().collect::<BTreeSet<String>>(),
            );
            driver.set_volume_change_callback(Box::new(prompt_for_volume));
            let mut progress = progress_printer("Verify");
            let report = driver.perform_verify(Some(&mut progress))?;
            println!();
            println!("{}", report.summary());
            for file in &report.different_files {
                println!("  different: {file}");
            }
            if !report.is_clean() {
                std::process::exit(1);
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { source, label_id, all } => {
            let mut library = open_library(&source)?;
            let snapshots = library.load_snapshots(label_id, all)?;
            println!("{:<20} {:<14} {:>6} {:>12} {:>12}  Description",
                     "Date", "Type", "Files", "Size", "Unique");
            for fileset in &snapshots {
                let date = chrono::DateTime::from_timestamp(fileset.date as i64, 0)
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<14} {:>6} {:>12} {:>12}  {}",
                    date,
                    fileset.backup_type().name(),
                    fileset.num_files(),
                    fileset.unencoded_size,
                    fileset.deduplicated_size,
                    fileset.description());
            }
            println!("{} snapshot(s)", snapshots.len());
        }

        // ── Labels ───────────────────────────────────────────────────────────
        Commands::Labels { source } => {
            let labels = BackupDriver::get_labels(&source.to_string_lossy())?;
            println!("{:<6} {:<24} Last snapshot", "Id", "Name");
            for label in &labels {
                println!("{:<6} {:<24} volume {} @ {:#x}",
                    label.id, label.name,
                    label.last_backup_volume, label.last_backup_offset);
            }
        }

        // ── Plan ─────────────────────────────────────────────────────────────
        Commands::Plan { input } => {
            let plan = BackupPlan::load(&input)?;
            println!("── Backup plan ─────────────────────────────────────────");
            println!("  Type            {}", plan.backup_type().name());
            println!("  Description     {}", plan.description);
            println!("  Destination     {}", plan.destination);
            println!("  Compression     {}", plan.enable_compression);
            println!("  Split volumes   {}", plan.split);
            println!("  Volume size     {} MB", plan.max_volume_size_mb());
            if plan.use_default_label {
                println!("  Label           Default");
            } else {
                println!("  Label           {} (id {})", plan.label_name, plan.label_id);
            }
            println!("  Paths ({} checked, {} unchecked):",
                     plan.paths.checked.len(), plan.paths.unchecked.len());
            for path in &plan.paths.checked {
                println!("    [x] {path}");
            }
            for path in &plan.paths.unchecked {
                println!("    [ ] {path}");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_backup_type(s: &str) -> Result<BackupType, String> {
    match s.to_lowercase().as_str() {
        "full" => Ok(BackupType::Full),
        "incremental" => Ok(BackupType::Incremental),
        "differential" => Ok(BackupType::Differential),
        _ => Err(format!("unknown backup type '{s}'")),
    }
}

fn open_library(source: &PathBuf) -> Result<bkp::BackupLibrary, bkp::Error> {
    let mut library = bkp::BackupLibrary::new(
        source.to_string_lossy(),
        Box::new(bkp::Md5Generator),
        Box::new(bkp::ZlibEncoder),
        Box::new(bkp::DiskVolumeFactory),
    );
    library.set_volume_change_callback(Box::new(prompt_for_volume));
    library.init()?;
    Ok(library)
}

/// Interactive media change: ask the user where the missing volume is.
fn prompt_for_volume(wanted: &str) -> Option<String> {
    eprintln!("Cannot find volume: {wanted}");
    eprint!("Enter its path (empty to cancel): ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

fn progress_printer(operation: &'static str) -> impl FnMut(u64, u64) {
    move |completed, total| {
        if total > 0 {
            let pct = completed as f64 / total as f64 * 100.0;
            eprint!("\r{operation} in progress... {pct:5.1}% ({completed}/{total} bytes)");
            std::io::stderr().flush().ok();
        }
    }
}

fn plan_from_options(options: &BackupOptions, destination: &str, paths: &[String]) -> BackupPlan {
    let volume_size_index = bkp::plan::VOLUME_SIZES_MB
        .iter()
        .position(|&mb| mb >= options.max_volume_size_mb)
        .unwrap_or(0) as u32;
    BackupPlan {
        backup_type: match options.backup_type {
            BackupType::Full => 1,
            BackupType::Incremental => 2,
            BackupType::Differential => 3,
            BackupType::Invalid => 0,
        },
        description: options.description.clone(),
        destination: destination.to_string(),
        enable_compression: options.enable_compression,
        split: options.max_volume_size_mb > 0,
        use_vss: false,
        volume_size_index,
        use_default_label: options.label_id == LABEL_ID_ALLOCATE
            && options.label_name.is_empty(),
        label_id: options.label_id,
        label_name: options.label_name.clone(),
        paths: bkp::plan::PlanPaths {
            checked: paths.to_vec(),
            unchecked: Vec::new(),
        },
    }
}
