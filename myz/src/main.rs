mod output;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgGroup, CommandFactory, Parser};
use myz_core::{Archive, ArchiveOptions, DEFAULT_LEVEL};
use output::{
    EntriesOutput, OperationOutput, OutputWriter, QueryOutput, QueryResult, notice_strings,
};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Myz - A single-file archive container
#[derive(Parser, Debug)]
#[command(name = "myz")]
#[command(about = "Pack files into a single archive, with optional gzip compression", long_about = None)]
#[command(version)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["create", "append", "extract", "delete", "metadata", "hierarchy", "query"])
))]
struct Cli {
    /// Create an archive from the given paths
    #[arg(short = 'c', long)]
    create: bool,

    /// Append paths to an existing archive
    #[arg(short = 'a', long)]
    append: bool,

    /// Extract the archive (or the given entries) into the current directory
    #[arg(short = 'x', long)]
    extract: bool,

    /// Delete entries and everything beneath them
    #[arg(short = 'd', long)]
    delete: bool,

    /// Print the metadata of every entry
    #[arg(short = 'm', long)]
    metadata: bool,

    /// Print the entry hierarchy
    #[arg(short = 'p', long = "print")]
    hierarchy: bool,

    /// Report whether each path is in the archive
    #[arg(short = 'q', long)]
    query: bool,

    /// Compress new entries with gzip (with -c or -a)
    #[arg(short = 'j', long = "gzip")]
    gzip: bool,

    /// Log operation summaries to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Archive file
    archive: PathBuf,

    /// Source paths or archive entry paths
    paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Append,
    Extract,
    Delete,
    Metadata,
    Hierarchy,
    Query,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.create {
            Mode::Create
        } else if self.append {
            Mode::Append
        } else if self.extract {
            Mode::Extract
        } else if self.delete {
            Mode::Delete
        } else if self.metadata {
            Mode::Metadata
        } else if self.hierarchy {
            Mode::Hierarchy
        } else {
            Mode::Query
        }
    }

    /// Checks clap cannot express declaratively.
    fn validate(&self) -> std::result::Result<(), clap::Error> {
        let mode = self.mode();
        if self.gzip && !matches!(mode, Mode::Create | Mode::Append) {
            return Err(Cli::command().error(
                ErrorKind::ArgumentConflict,
                "-j/--gzip is only valid with -c or -a",
            ));
        }
        let needs_paths = matches!(mode, Mode::Create | Mode::Append | Mode::Delete | Mode::Query);
        if needs_paths && self.paths.is_empty() {
            return Err(Cli::command().error(
                ErrorKind::MissingRequiredArgument,
                "at least one path is required for -c, -a, -d and -q",
            ));
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse().and_then(|cli| cli.validate().map(|_| cli)) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(cli.verbose);
    let output = OutputWriter::new(cli.json);

    match run(&cli, &output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output.write_error(&e, 1);
            ExitCode::FAILURE
        }
    }
}

/// Install the stderr subscriber. `MYZ_LOG` takes precedence over `-v`.
fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "error" };
    let filter = EnvFilter::try_from_env("MYZ_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli, output: &OutputWriter) -> Result<()> {
    let mode = cli.mode();
    let paths = match mode {
        Mode::Query => cli.paths.clone(),
        _ => filter_overlapping(&cli.paths),
    };

    let options = ArchiveOptions::default()
        .with_compression(cli.gzip)
        .with_level(gzip_level(output));
    let archive = Archive::new(&cli.archive).with_options(options);
    debug!(?mode, archive = %cli.archive.display(), paths = paths.len(), "dispatching");

    match mode {
        Mode::Create => cmd_create(&archive, &paths, output),
        Mode::Append => cmd_append(&archive, &paths, output),
        Mode::Extract => cmd_extract(&archive, &paths, output),
        Mode::Delete => cmd_delete(&archive, &paths, output),
        Mode::Metadata => cmd_metadata(&archive, &paths, output),
        Mode::Hierarchy => cmd_hierarchy(&archive, &paths, output),
        Mode::Query => cmd_query(&archive, &paths, output),
    }
}

/// gzip level from `MYZ_GZIP_LEVEL`, falling back to the default.
fn gzip_level(output: &OutputWriter) -> u32 {
    match std::env::var("MYZ_GZIP_LEVEL") {
        Ok(value) => match value.trim().parse::<u32>() {
            Ok(level) if level <= 9 => level,
            _ => {
                output.write_warning(&format!(
                    "ignoring MYZ_GZIP_LEVEL={:?}, expected 0-9; using {}",
                    value, DEFAULT_LEVEL
                ));
                DEFAULT_LEVEL
            }
        },
        Err(_) => DEFAULT_LEVEL,
    }
}

/// Drop inputs equal to or nested under another input, keeping the first
/// occurrence and the original order.
fn filter_overlapping(paths: &[String]) -> Vec<String> {
    let normalized: Vec<PathBuf> = paths
        .iter()
        .map(|p| {
            Path::new(p)
                .components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect()
        })
        .collect();

    paths
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            !normalized.iter().enumerate().any(|(j, other)| {
                j != *i
                    && normalized[*i].starts_with(other)
                    && (normalized[*i] != *other || j < *i)
            })
        })
        .map(|(_, p)| p.clone())
        .collect()
}

fn operation_output(
    output: &OutputWriter,
    operation: &'static str,
    archive: &Archive,
    report: &myz_core::Report,
    text: String,
) -> Result<()> {
    output.write_notices(&report.notices);
    let data = OperationOutput {
        success: true,
        result_code: 0,
        operation,
        archive: archive.path().display().to_string(),
        entries: report.entries,
        notices: notice_strings(&report.notices),
    };
    output.write(&data, || text)
}

fn cmd_create(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let report = archive
        .create(paths)
        .with_context(|| format!("Failed to create archive {}", archive.path().display()))?;

    let text = format!(
        "Created {} ({} entries)\n",
        archive.path().display(),
        report.entries
    );
    operation_output(output, "create", archive, &report, text)
}

fn cmd_append(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let report = archive
        .append(paths)
        .with_context(|| format!("Failed to append to archive {}", archive.path().display()))?;

    let text = format!(
        "Appended {} entries to {}\n",
        report.entries,
        archive.path().display()
    );
    operation_output(output, "append", archive, &report, text)
}

fn cmd_extract(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let report = archive
        .extract(paths, ".")
        .with_context(|| format!("Failed to extract archive {}", archive.path().display()))?;

    let text = format!(
        "Extracted {} entries from {}\n",
        report.entries,
        archive.path().display()
    );
    operation_output(output, "extract", archive, &report, text)
}

fn cmd_delete(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let report = archive
        .delete(paths)
        .with_context(|| format!("Failed to delete from archive {}", archive.path().display()))?;

    let text = format!(
        "Deleted {} entries from {}\n",
        report.entries,
        archive.path().display()
    );
    operation_output(output, "delete", archive, &report, text)
}

fn cmd_metadata(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let context = || format!("Failed to read archive {}", archive.path().display());

    if output.is_json() {
        let (entries, report) = archive.entries(paths).with_context(context)?;
        let data = EntriesOutput {
            success: true,
            result_code: 0,
            entries,
            notices: notice_strings(&report.notices),
        };
        return output.write(&data, String::new);
    }

    let report = archive
        .print_metadata(paths, io::stdout().lock())
        .with_context(context)?;
    output.write_notices(&report.notices);
    Ok(())
}

fn cmd_hierarchy(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let context = || format!("Failed to read archive {}", archive.path().display());

    if output.is_json() {
        let (entries, report) = archive.entries(paths).with_context(context)?;
        let data = EntriesOutput {
            success: true,
            result_code: 0,
            entries,
            notices: notice_strings(&report.notices),
        };
        return output.write(&data, String::new);
    }

    let report = archive
        .list_hierarchy(paths, io::stdout().lock())
        .with_context(context)?;
    output.write_notices(&report.notices);
    Ok(())
}

fn cmd_query(archive: &Archive, paths: &[String], output: &OutputWriter) -> Result<()> {
    let catalog = archive
        .catalog()
        .with_context(|| format!("Failed to read archive {}", archive.path().display()))?;

    let results: Vec<QueryResult> = paths
        .iter()
        .map(|path| QueryResult {
            path: path.clone(),
            found: catalog.find_by_path(path).is_some(),
        })
        .collect();

    let data = QueryOutput {
        success: true,
        result_code: 0,
        results: results.clone(),
    };
    output.write(&data, || {
        results
            .iter()
            .map(|r| {
                let status = if r.found { "found" } else { "not found" };
                format!("{}: {}\n", r.path, status)
            })
            .collect()
    })
}
