//! zmodel CLI
//!
//! Command-line interface for `.zmodel` schema documents:
//! - Validating documents (parse + link + semantic checks)
//! - Formatting documents through the canonical printer
//! - Compiling access-policy rules into a JSON policy bundle

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zmodel_check::{validate_document_with, Diagnostic, Severity, ValidationOptions};

mod fmt;

#[derive(Parser)]
#[command(name = "zmodel")]
#[command(author, version, about = "zmodel: schema validation and policy compilation")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check and format `.zmodel` documents.
    Check {
        #[command(subcommand)]
        command: CheckCommands,
    },

    /// Compile the access-policy rules of a document into a JSON bundle.
    Policy {
        /// Input `.zmodel` file.
        input: PathBuf,
        /// Write the bundle to this file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Validate `.zmodel` documents.
    ///
    /// Directories are searched recursively for `*.zmodel` files. Each
    /// document is validated independently.
    Validate {
        /// Input files or directories.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Print diagnostics as JSON.
        #[arg(long)]
        json: bool,
        /// Treat warnings as errors.
        #[arg(long)]
        deny_warnings: bool,
        /// Report documents without a `datasource` block.
        #[arg(long)]
        require_datasource: bool,
    },

    /// Format a `.zmodel` document through the canonical printer.
    Fmt {
        /// Input `.zmodel` file.
        input: PathBuf,
        /// Write formatted output to this file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Overwrite the input file in-place.
        #[arg(long)]
        write: bool,
        /// Drop comments instead of refusing to format.
        #[arg(long)]
        strip_comments: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Check { command } => match command {
            CheckCommands::Validate {
                inputs,
                json,
                deny_warnings,
                require_datasource,
            } => {
                let options = ValidationOptions {
                    require_datasource,
                    deny_warnings,
                };
                let failed = cmd_validate(&inputs, &options, json)?;
                if failed {
                    std::process::exit(1);
                }
            }
            CheckCommands::Fmt {
                input,
                out,
                write,
                strip_comments,
            } => {
                fmt::cmd_fmt_zmodel(&input, out.as_deref(), write, strip_comments)?;
            }
        },
        Commands::Policy { input, out } => {
            cmd_policy(&input, out.as_deref())?;
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Serialize)]
struct FileReport {
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_error: Option<String>,
    diagnostics: Vec<DiagnosticReport>,
}

impl FileReport {
    fn failed(&self) -> bool {
        self.parse_error.is_some()
            || self
                .diagnostics
                .iter()
                .any(|d| d.diagnostic.severity == Severity::Error)
    }
}

#[derive(Debug, Serialize)]
struct DiagnosticReport {
    #[serde(flatten)]
    diagnostic: Diagnostic,
    line: usize,
    column: usize,
}

/// Expand directories into the `*.zmodel` files beneath them, sorted.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "zmodel"))
                .collect();
            found.sort();
            files.extend(found);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            return Err(anyhow!("no such file or directory: {}", input.display()));
        }
    }
    Ok(files)
}

fn validate_file(path: &Path, options: &ValidationOptions) -> Result<FileReport> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
    let file = path.display().to_string();
    let document = match zmodel_dsl::parse_document(&text) {
        Ok(document) => document,
        Err(err) => {
            return Ok(FileReport {
                file,
                parse_error: Some(err.to_string()),
                diagnostics: Vec::new(),
            })
        }
    };
    let result = validate_document_with(&document, options);
    tracing::info!(
        file = %file,
        diagnostics = result.diagnostics.len(),
        valid = result.is_valid(),
        "validated"
    );
    let diagnostics = result
        .diagnostics
        .into_vec()
        .into_iter()
        .map(|diagnostic| {
            let (line, column) = diagnostic.span.line_col(&text);
            DiagnosticReport {
                diagnostic,
                line,
                column,
            }
        })
        .collect();
    Ok(FileReport {
        file,
        parse_error: None,
        diagnostics,
    })
}

/// Returns `true` when any document failed to parse or has errors.
fn cmd_validate(inputs: &[PathBuf], options: &ValidationOptions, json: bool) -> Result<bool> {
    let files = collect_inputs(inputs)?;
    if files.is_empty() {
        return Err(anyhow!("no .zmodel files found"));
    }
    let reports = files
        .par_iter()
        .map(|path| validate_file(path, options))
        .collect::<Result<Vec<_>>>()?;
    let failed = reports.iter().filter(|r| r.failed()).count();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(failed > 0);
    }

    for report in &reports {
        if let Some(err) = &report.parse_error {
            println!("{}: {} {err}", report.file, "error[parse]:".red().bold());
            continue;
        }
        for entry in &report.diagnostics {
            let d = &entry.diagnostic;
            let label = match d.severity {
                Severity::Error => format!("error[{}]:", d.kind.as_str()).red().bold(),
                Severity::Warning => format!("warning[{}]:", d.kind.as_str()).yellow().bold(),
            };
            println!(
                "{}:{}:{}: {label} {}",
                report.file, entry.line, entry.column, d.message
            );
        }
    }
    if failed == 0 {
        eprintln!(
            "{} validated {} document(s)",
            "ok".green().bold(),
            reports.len()
        );
    } else {
        eprintln!(
            "{} {failed} of {} document(s) have errors",
            "failed".red().bold(),
            reports.len()
        );
    }
    Ok(failed > 0)
}

fn cmd_policy(input: &Path, out: Option<&Path>) -> Result<()> {
    let text = fs::read_to_string(input)
        .map_err(|e| anyhow!("failed to read {}: {e}", input.display()))?;
    let document = zmodel_dsl::parse_document(&text)
        .map_err(|e| anyhow!("{}: {e}", input.display()))?;
    let result = validate_document_with(&document, &ValidationOptions::default());
    let Some(validated) = result.validated else {
        for d in result.diagnostics.errors() {
            eprintln!("{}: {d}", input.display());
        }
        return Err(anyhow!(
            "{} has {} error(s); fix them before compiling policies",
            input.display(),
            result.diagnostics.errors().count()
        ));
    };
    let bundle = validated
        .policies()
        .map_err(|e| anyhow!("failed to compile policies: {e}"))?;
    let rendered = serde_json::to_string_pretty(&bundle)?;
    match out {
        Some(out) => {
            fs::write(out, format!("{rendered}\n"))?;
            eprintln!("{} {}", "wrote".green().bold(), out.display().to_string().bold());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
