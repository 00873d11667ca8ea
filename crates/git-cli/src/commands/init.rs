use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use bstr::BString;
use clap::Args;
use git_ref::{FilesRefStore, RefName};

use crate::Cli;

const DEFAULT_BRANCH: &str = "master";

#[derive(Args)]
pub struct InitArgs {
    /// Create a bare repository
    #[arg(long)]
    bare: bool,

    /// Override the name of the initial branch
    #[arg(short = 'b', long, value_name = "branch-name")]
    initial_branch: Option<String>,

    /// Be quiet, only report errors
    #[arg(short, long)]
    quiet: bool,

    /// Directory to create the repository in
    directory: Option<PathBuf>,
}

pub fn run(args: &InitArgs, _cli: &Cli) -> Result<i32> {
    let target = match &args.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    if !target.exists() {
        std::fs::create_dir_all(&target)?;
    }

    let git_dir = if args.bare { target.clone() } else { target.join(".git") };

    for dir in ["objects/pack", "refs/heads", "refs/tags"] {
        std::fs::create_dir_all(git_dir.join(dir))?;
    }

    let branch = args.initial_branch.as_deref().unwrap_or(DEFAULT_BRANCH);
    let head_target = RefName::new(BString::from(format!("refs/heads/{branch}")))?;
    let head = RefName::new(BString::from("HEAD"))?;
    let refs = FilesRefStore::new(&git_dir);
    refs.write_symbolic_ref(&head, &head_target)?;

    if !args.quiet {
        let stderr = io::stderr();
        let mut err = stderr.lock();
        let display_dir = std::fs::canonicalize(&git_dir).unwrap_or(git_dir);
        let mut display_path = display_dir.display().to_string();
        if !display_path.ends_with('/') {
            display_path.push('/');
        }
        writeln!(err, "Initialized empty Git repository in {}", display_path)?;
    }

    Ok(0)
}
