//! # Validate Subcommand
//!
//! Loads each policy file, normalizes order ranks, and runs the same
//! save-time validation the management API applies. Every problem in every
//! file is reported, not just the first.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use warden_engine::PolicyFile;

/// Arguments for the `warden validate` subcommand.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Policy files (YAML or JSON).
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Print the normalized policies of valid files as YAML.
    #[arg(long)]
    pub normalized: bool,
}

/// Outcome for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub policies: usize,
    pub problems: Vec<String>,
}

impl FileReport {
    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Validate one file. Unreadable or unparseable files are reported as a
/// single problem.
pub fn check_file(path: PathBuf) -> (FileReport, Option<PolicyFile>) {
    let mut file = match PolicyFile::read(&path) {
        Ok(file) => file,
        Err(e) => {
            return (
                FileReport {
                    path,
                    policies: 0,
                    problems: vec![e.to_string()],
                },
                None,
            )
        }
    };
    let problems: Vec<String> = file.check().iter().map(ToString::to_string).collect();
    tracing::debug!(path = %path.display(), policies = file.policies.len(), problems = problems.len(), "checked policy file");
    let report = FileReport {
        path,
        policies: file.policies.len(),
        problems,
    };
    (report, Some(file))
}

/// Execute the validate subcommand.
///
/// Returns exit code: 0 when every file is valid, 1 otherwise.
pub fn run_validate(args: &ValidateArgs) -> Result<u8> {
    let mut failed = 0usize;
    for path in &args.paths {
        let (report, file) = check_file(path.clone());
        if report.passed() {
            println!(
                "PASS: {} ({} policies)",
                report.path.display(),
                report.policies
            );
            if let (true, Some(file)) = (args.normalized, file) {
                print!("{}", file.to_yaml()?);
            }
        } else {
            failed += 1;
            println!("FAIL: {}", report.path.display());
            for problem in &report.problems {
                println!("  - {problem}");
            }
        }
    }

    let total = args.paths.len();
    println!("\nFiles: {}/{} passed", total - failed, total);
    Ok(if failed == 0 { 0 } else { 1 })
}
