use std::{path::PathBuf, process::ExitCode, sync::Arc};

use cardsync::{
	config::Config,
	engine::{ApplyResult, PassReport, SyncEngine, SyncError},
	models::operation::Direction,
	remote::AnkiConnect,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cardsync")]
#[command(about = "Sync a flashcard collection with a directory of markdown deck files")]
struct Cli {
	/// Directory holding the deck files.
	#[arg(long, global = true, default_value = ".")]
	collection: PathBuf,

	/// Config file; defaults to cardsync.toml inside the collection.
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	cmd: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Make the collection match the deck files.
	Import {
		#[arg(long)]
		dry_run: bool,
	},
	/// Make the deck files match the collection.
	Export {
		#[arg(long)]
		dry_run: bool,
	},
	/// Import, then export.
	Sync,
	/// Show what a pass would do without changing anything.
	Plan {
		direction: DirectionArg,
	},
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
	Import,
	Export,
}

impl From<DirectionArg> for Direction {
	fn from(arg: DirectionArg) -> Self {
		match arg {
			DirectionArg::Import => Direction::Import,
			DirectionArg::Export => Direction::Export,
		}
	}
}

fn init_logging() {
	let log_dir = dirs::data_local_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join("cardsync");
	std::fs::create_dir_all(&log_dir).ok();
	let file_appender = tracing_appender::rolling::never(log_dir, "cardsync.log");
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer().with_writer(file_appender).with_ansi(false))
		.init();
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	init_logging();

	let config = match &cli.config {
		Some(path) => Config::load(path),
		None => Config::load_for_collection(&cli.collection),
	};
	let config = match config {
		Ok(config) => config,
		Err(e) => {
			eprintln!("error: {e}");
			return ExitCode::from(2);
		}
	};
	let remote = match AnkiConnect::new(&config.remote.url, config.remote.timeout()) {
		Ok(remote) => Arc::new(remote),
		Err(e) => {
			eprintln!("error: {e}");
			return ExitCode::from(2);
		}
	};
	let mut engine = match SyncEngine::new(&cli.collection, config, remote) {
		Ok(engine) => engine,
		Err(e) => {
			eprintln!("error: {e}");
			return ExitCode::from(2);
		}
	};

	let cancel = engine.cancel_flag();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::warn!("interrupt received; stopping after in-flight operations");
			cancel.cancel();
		}
	});

	let result = match cli.cmd {
		Command::Import { dry_run: false } => engine.run(Direction::Import).await.map(|r| vec![r]),
		Command::Export { dry_run: false } => engine.run(Direction::Export).await.map(|r| vec![r]),
		Command::Import { dry_run: true } => engine.plan_only(Direction::Import).await.map(|r| vec![r]),
		Command::Export { dry_run: true } => engine.plan_only(Direction::Export).await.map(|r| vec![r]),
		Command::Plan { direction } => engine.plan_only(direction.into()).await.map(|r| vec![r]),
		Command::Sync => engine.round_trip().await,
	};

	match result {
		Ok(reports) => {
			for report in &reports {
				print_report(report);
			}
			if reports.iter().any(PassReport::has_failures) {
				ExitCode::FAILURE
			} else {
				ExitCode::SUCCESS
			}
		}
		Err(e) => {
			tracing::error!("pass failed: {e}");
			eprintln!("error: {e}");
			match e {
				SyncError::Cancelled => ExitCode::from(130),
				_ => ExitCode::FAILURE,
			}
		}
	}
}

fn print_report(report: &PassReport) {
	println!("{}", report.headline());
	if let Some(rebuild) = &report.rebuild {
		println!(
			"  mapping store rebuilt: {} notes matched, {} without a collection note",
			rebuild.matched,
			rebuild.unmatched.len()
		);
		if let Some(moved) = &rebuild.moved_to {
			println!("  unreadable store kept at {}", moved.display());
		}
	}
	if report.skipped_files > 0 {
		println!("  skipped {} entries that are not deck files", report.skipped_files);
	}
	if let Some(media) = &report.media {
		println!("  media: {}", media.format());
		for name in &media.missing {
			println!("  missing media {name}");
		}
	}
	for issue in &report.issues {
		println!("  skipped {issue}");
	}
	for issue in &report.plan.issues {
		println!("  skipped {issue}");
	}
	for (conflict, resolution) in &report.plan.conflicts {
		println!("  conflict: {conflict} ({resolution})");
	}
	for deck in &report.plan.untracked {
		println!(
			"  untracked deck '{}' on the {} side ({} notes left alone)",
			deck.path, deck.side, deck.records
		);
	}
	if report.apply.is_none() {
		for op in &report.plan.operations {
			println!("  {op}");
		}
		for stamp in &report.plan.stamps {
			println!("  {stamp}");
		}
	}
	if let ApplyResult::PartialFailure { failed, .. } = report.result() {
		for f in failed {
			println!("  failed: {}: {}", f.op, f.cause);
		}
	}
	if let Some(apply) = &report.apply {
		for (stamp, cause) in &apply.stamp_failures {
			println!("  failed: {stamp}: {cause}");
		}
	}
}
