pub mod cat_file;
pub mod check_ref_format;
pub mod count_objects;
pub mod for_each_ref;
pub mod hash_object;
pub mod init;
pub mod reflog;
pub mod show_ref;
pub mod symbolic_ref;
pub mod update_ref;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Subcommand;

use crate::Cli;

#[derive(Subcommand)]
pub enum Commands {
    /// Provide content or type and size information for repository objects
    CatFile(cat_file::CatFileArgs),
    /// Compute object ID and optionally create a blob from a file
    HashObject(hash_object::HashObjectArgs),
    /// Update the object name stored in a ref safely
    UpdateRef(update_ref::UpdateRefArgs),
    /// Output information on each ref
    ForEachRef(for_each_ref::ForEachRefArgs),
    /// List references in a local repository
    ShowRef(show_ref::ShowRefArgs),
    /// Read, modify and delete symbolic refs
    SymbolicRef(symbolic_ref::SymbolicRefArgs),
    /// Ensure that a reference name is well formed
    CheckRefFormat(check_ref_format::CheckRefFormatArgs),
    /// Manage reflog information
    Reflog(reflog::ReflogArgs),
    /// Count unpacked number of objects and their disk consumption
    CountObjects(count_objects::CountObjectsArgs),
    /// Create an empty Git repository or reinitialize an existing one
    Init(init::InitArgs),
}

impl Commands {
    /// Get the command name as used in config keys (e.g., "cat-file", "hash-object").
    pub fn command_name(&self) -> &str {
        match self {
            Commands::CatFile(_) => "cat-file",
            Commands::HashObject(_) => "hash-object",
            Commands::UpdateRef(_) => "update-ref",
            Commands::ForEachRef(_) => "for-each-ref",
            Commands::ShowRef(_) => "show-ref",
            Commands::SymbolicRef(_) => "symbolic-ref",
            Commands::CheckRefFormat(_) => "check-ref-format",
            Commands::Reflog(_) => "reflog",
            Commands::CountObjects(_) => "count-objects",
            Commands::Init(_) => "init",
        }
    }
}

/// A repository handle built directly on the storage-engine crates: an
/// object database rooted at `<git_dir>/objects` and a files-backend ref
/// store rooted at `<git_dir>`. There is no working tree, index, or config
/// layer here — this binary exercises the object/ref core only.
pub struct RepoContext {
    git_dir: PathBuf,
    odb: Arc<git_odb::ObjectDatabase>,
    refs: git_ref::FilesRefStore,
}

impl RepoContext {
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn odb(&self) -> &git_odb::ObjectDatabase {
        &self.odb
    }

    pub fn refs(&self) -> &git_ref::FilesRefStore {
        &self.refs
    }
}

/// Open a repository, respecting `--git-dir`, otherwise discovering a
/// `.git` directory by walking up from the current directory.
pub fn open_repo(cli: &Cli) -> Result<RepoContext> {
    let git_dir = match &cli.git_dir {
        Some(dir) => dir.clone(),
        None => discover_git_dir(&std::env::current_dir()?)?,
    };

    let odb = Arc::new(git_odb::ObjectDatabase::open(git_dir.join("objects"))?);
    let mut refs = git_ref::FilesRefStore::new(&git_dir);
    refs.set_object_database(Arc::clone(&odb));

    Ok(RepoContext { git_dir, odb, refs })
}

fn discover_git_dir(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(".git");
        if candidate.is_dir() {
            return Ok(candidate);
        }
        if !dir.pop() {
            bail!("not a git repository (or any of the parent directories): .git");
        }
    }
}

pub fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Commands::CatFile(args) => cat_file::run(args, &cli),
        Commands::HashObject(args) => hash_object::run(args, &cli),
        Commands::UpdateRef(args) => update_ref::run(args, &cli),
        Commands::ForEachRef(args) => for_each_ref::run(args, &cli),
        Commands::ShowRef(args) => show_ref::run(args, &cli),
        Commands::SymbolicRef(args) => symbolic_ref::run(args, &cli),
        Commands::CheckRefFormat(args) => check_ref_format::run(args),
        Commands::Reflog(args) => reflog::run(args, &cli),
        Commands::CountObjects(args) => count_objects::run(args, &cli),
        Commands::Init(args) => init::run(args, &cli),
    }
}
