use anyhow::{Context, Result};
use btrsync::planner::{flatten_layout, plan_transfers};
use btrsync::root::{LocalRoot, Root};
use btrsync::{BtrSync, Config};
use clap::{crate_version, Clap};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use human_panic::setup_panic;
use slog::{o, Drain, Level, Logger};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    setup_panic!();

    let options = match CliOptions::try_parse() {
        Ok(o) => o,
        Err(e) => {
            println!("{}", e.to_string().replace("error:", "ERRO:"));
            return ExitCode::from(2);
        }
    };

    let _log_guard = install_logger(options.verbose);

    match run(options) {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            slog_scope::error!("{}", e);
            for cause in e.chain().skip(1) {
                slog_scope::info!("caused by: {}", cause);
            }
            ExitCode::from(2)
        }
    }
}

fn install_logger(verbose: u8) -> impl Drop {
    let level = match verbose {
        0 => Level::Info,
        1 => Level::Debug,
        _ => Level::Trace,
    };
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(level).fuse();
    let logger = Logger::root(drain, o!());
    slog_scope::set_global_logger(logger)
}

fn run(options: CliOptions) -> Result<i32> {
    let config = Config::from_env().unwrap_or_default();

    let src = Root::Local(
        LocalRoot::new(options.src_mount.clone(), options.src_subpath.clone().unwrap_or_default(), options.sudo, config.sudo_flag.clone())
            .context("failed to construct source root")?,
    );
    let dst = Root::Local(
        LocalRoot::new(options.dst_mount.clone(), options.dst_subpath.clone().unwrap_or_default(), options.sudo, config.sudo_flag.clone())
            .context("failed to construct destination root")?,
    );

    let src_tree = src.build_tree().context("failed to build source subvolume tree")?;
    let dst_tree = dst.build_tree().context("failed to build destination subvolume tree")?;

    let planning = plan_transfers(&src_tree, &dst_tree, &options.dst_mount, flatten_layout, options.incremental_only);

    if options.dry_run {
        render_plan_table(&planning);
        return Ok(0);
    }

    let executor = BtrSync::new(config);
    let cancel = executor.cancel_handle();
    ctrlc::set_handler(move || {
        slog_scope::warn!("received interrupt signal; finishing in-flight transfer then stopping");
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    let result = executor.run(planning, &src, &dst)?;
    render_result_table(&result);
    Ok(result.exit_code())
}

fn render_plan_table(planning: &btrsync::PlanningResult) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Source", "Destination", "Class", "Parent"]);
    for plan in &planning.plans {
        table.add_row(vec![
            Cell::new(plan.src_vol.display_name()),
            Cell::new(plan.dst_path.display().to_string()),
            Cell::new(format!("{:?}", plan.class())),
            Cell::new(plan.parent.as_ref().map(|p| p.display_name()).unwrap_or_else(|| "-".to_string())),
        ]);
    }
    println!("{}", table);
    for skip in &planning.skipped {
        println!("skipped {}: {:?}", skip.src_vol.display_name(), skip.reason);
    }
}

fn render_result_table(result: &btrsync::RunResult) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Source", "Status", "Bytes / Stage"]);
    for completed in &result.completed {
        table.add_row(vec![
            Cell::new(completed.plan.src_vol.display_name()),
            Cell::new("completed").fg(Color::Green),
            Cell::new(completed.bytes_transferred.to_string()),
        ]);
    }
    for failed in &result.failed {
        table.add_row(vec![
            Cell::new(failed.plan.src_vol.display_name()),
            Cell::new("failed").fg(Color::Red),
            Cell::new(failed.error.to_string()),
        ]);
    }
    println!("{}", table);
    if result.cancelled {
        println!("interrupted before all plans ran");
    }
}

#[derive(Clap)]
#[clap(version = crate_version!(), author = "opensource@rebeagle.com")]
struct CliOptions {
    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,

    /// Only emit incremental plans; skip subvolumes with no viable parent.
    #[clap(long)]
    incremental_only: bool,

    /// Plan the transfer and print it without running anything.
    #[clap(long)]
    dry_run: bool,

    /// Use `sudo -n` to run `btrfs` commands.
    #[clap(long)]
    sudo: bool,

    /// Source btrfs mountpoint.
    src_mount: PathBuf,

    /// Path within the source mount to enumerate, relative to its root.
    #[clap(long)]
    src_subpath: Option<PathBuf>,

    /// Destination btrfs mountpoint.
    dst_mount: PathBuf,

    /// Path within the destination mount to enumerate, relative to its root.
    #[clap(long)]
    dst_subpath: Option<PathBuf>,
}
