//! linksync: sync file trees by rename/hardlink/unlink and find duplicates,
//! driven by cached content fingerprints.

use std::io::Write;
use std::process::ExitCode;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

use linksync::error::PlanImpossible;
use linksync::fdupes;
use linksync::groupprint::GroupedFilePrinter;
use linksync::logging::{init_logging, LogConfig, LogLevel};
use linksync::{
    PropertyTree, SyncCmd, TreeConfig, TreePairMatcher, XxHash64Hasher, DEFAULT_DB_PREFIX,
};

#[derive(Parser)]
#[command(
    name = "linksync",
    version,
    about = "Content-addressed file-tree synchronizer and duplicate finder"
)]
struct Cli {
    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "warn", value_name = "LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Default)]
struct TreeOptions {
    /// Glob patterns for paths to exclude from scanning
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Ignore zero-length files
    #[arg(long)]
    skip_empty: bool,

    /// Ignore files larger than this many bytes
    #[arg(long = "maxsize", value_name = "BYTES")]
    max_size: Option<u64>,

    /// Cache file basename prefix
    #[arg(long, default_value = DEFAULT_DB_PREFIX, value_name = "PREFIX")]
    db_prefix: String,

    /// Directory holding the cache file, instead of the tree root
    #[arg(long, value_name = "DIR")]
    db_dir: Option<Utf8PathBuf>,
}

#[derive(Args, Clone, Default)]
struct GroupOptions {
    /// Count several links to one file as a single occurrence
    #[arg(long)]
    hard_links: bool,

    /// Print every link of each matched file
    #[arg(long)]
    all_links: bool,

    /// Print each group on a single line
    #[arg(long)]
    same_line: bool,

    /// Sort groups by file size before printing
    #[arg(long)]
    sort: bool,

    /// Emit one JSON object per group instead of plain paths
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Align target with source using only rename/link/unlink
    Sync {
        /// Source tree: a directory, or an offline snapshot file
        source: Utf8PathBuf,
        /// Target tree root (must be a directory)
        target: Utf8PathBuf,
        /// Print the plan without touching the target
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Fingerprint every file, refreshing stale cache entries
    Update {
        tree: Utf8PathBuf,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Find files with identical content across trees
    Fdupes {
        #[arg(required = true)]
        trees: Vec<Utf8PathBuf>,
        #[command(flatten)]
        groups: GroupOptions,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Find content present in every tree
    Onall {
        #[arg(required = true)]
        trees: Vec<Utf8PathBuf>,
        #[command(flatten)]
        groups: GroupOptions,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Find content only in the first tree
    Onfirstonly {
        #[arg(required = true)]
        trees: Vec<Utf8PathBuf>,
        #[command(flatten)]
        groups: GroupOptions,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Find content in the first tree that some other tree also has
    Onfirstnotonly {
        #[arg(required = true)]
        trees: Vec<Utf8PathBuf>,
        #[command(flatten)]
        groups: GroupOptions,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Re-hash files and compare against cached fingerprints
    Check {
        tree: Utf8PathBuf,
        /// Paths to check; all files when omitted
        paths: Vec<Utf8PathBuf>,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Drop cache rows for files no longer in the tree, then compact
    Purge {
        tree: Utf8PathBuf,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Freeze tree structure and fingerprints into a portable snapshot
    Mkoffline {
        tree: Utf8PathBuf,
        /// Snapshot file to create
        output: Utf8PathBuf,
        #[command(flatten)]
        opts: TreeOptions,
    },
    /// Strip the offline tables from a snapshot, keeping fingerprints
    Rmoffline {
        /// Snapshot file
        db_file: Utf8PathBuf,
    },
    /// Print cached fingerprints for the given paths
    Lookup {
        tree: Utf8PathBuf,
        #[arg(required = true)]
        paths: Vec<Utf8PathBuf>,
        #[command(flatten)]
        opts: TreeOptions,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level: LogLevel = match cli.log_level.parse() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&LogConfig {
        level,
        ..LogConfig::default()
    }) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Sync {
            source,
            target,
            dry_run,
            opts,
        } => cmd_sync(&source, &target, dry_run, &opts),
        Command::Update { tree, opts } => cmd_update(&tree, &opts),
        Command::Fdupes { trees, groups, opts } => cmd_groups(&trees, &groups, &opts, Query::Duplicates),
        Command::Onall { trees, groups, opts } => cmd_groups(&trees, &groups, &opts, Query::OnAll),
        Command::Onfirstonly { trees, groups, opts } => {
            cmd_groups(&trees, &groups, &opts, Query::FirstOnly)
        }
        Command::Onfirstnotonly { trees, groups, opts } => {
            cmd_groups(&trees, &groups, &opts, Query::FirstNotOnly)
        }
        Command::Check { tree, paths, opts } => cmd_check(&tree, &paths, &opts),
        Command::Purge { tree, opts } => cmd_purge(&tree, &opts),
        Command::Mkoffline { tree, output, opts } => cmd_mkoffline(&tree, &output, &opts),
        Command::Rmoffline { db_file } => cmd_rmoffline(&db_file),
        Command::Lookup { tree, paths, opts } => cmd_lookup(&tree, &paths, &opts),
    }
}

fn tree_config(opts: &TreeOptions, writeback: bool) -> TreeConfig {
    TreeConfig {
        exclude: opts.exclude.clone(),
        skip_empty: opts.skip_empty,
        max_size: opts.max_size,
        writeback,
        db_prefix: opts.db_prefix.clone(),
        db_dir: opts.db_dir.clone(),
    }
}

/// A directory opens as an online tree, a file as an offline snapshot.
fn open_tree(location: &Utf8PathBuf, opts: &TreeOptions, writeback: bool) -> Result<PropertyTree> {
    let config = tree_config(opts, writeback);
    if location.is_dir() {
        PropertyTree::open_online(location, Box::new(XxHash64Hasher), config)
    } else if location.is_file() {
        PropertyTree::open_offline(location, Box::new(XxHash64Hasher), config)
    } else {
        anyhow::bail!("expected a directory or a snapshot file: {location}")
    }
}

fn open_trees(locations: &[Utf8PathBuf], opts: &TreeOptions) -> Result<Vec<PropertyTree>> {
    locations
        .iter()
        .map(|loc| open_tree(loc, opts, false))
        .collect()
}

fn cmd_sync(
    source: &Utf8PathBuf,
    target: &Utf8PathBuf,
    dry_run: bool,
    opts: &TreeOptions,
) -> Result<ExitCode> {
    let mut src = open_tree(source, opts, false)?;
    let mut tgt = open_tree(target, opts, !dry_run)?;

    let mut matcher = TreePairMatcher::new(&mut src, &mut tgt)?;
    let cmds: Vec<SyncCmd> = match matcher.plan(&tgt) {
        Ok(cmds) => cmds,
        Err(e) if e.downcast_ref::<PlanImpossible>().is_some() => {
            eprintln!("{e}");
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for cmd in &cmds {
        writeln!(out, "{cmd}")?;
        if !dry_run {
            tgt.exec_cmd(cmd)?;
        }
    }
    tracing::info!(commands = cmds.len(), applied = !dry_run, "sync finished");
    Ok(ExitCode::SUCCESS)
}

fn cmd_update(tree: &Utf8PathBuf, opts: &TreeOptions) -> Result<ExitCode> {
    let mut tree = open_tree(tree, opts, false)?;
    let report = tree.bulk_update()?;
    eprintln!(
        "{} up to date, {} updated, {} errors",
        report.up_to_date,
        report.updated,
        report.errors.len()
    );
    if report.errors.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

enum Query {
    Duplicates,
    OnAll,
    FirstOnly,
    FirstNotOnly,
}

fn cmd_groups(
    locations: &[Utf8PathBuf],
    groups: &GroupOptions,
    opts: &TreeOptions,
    query: Query,
) -> Result<ExitCode> {
    let mut trees = open_trees(locations, opts)?;
    let mut printer = GroupedFilePrinter::new(
        groups.hard_links,
        groups.all_links,
        groups.same_line,
        groups.sort,
    );
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    // With a full-content hasher, files of different sizes never share a
    // fingerprint, so work size bucket by size bucket. Otherwise sweep
    // everything at once.
    let by_size = trees[0].hasher().depends_on_size();
    let buckets: Vec<Option<u64>> = if by_size {
        let sizes = match query {
            Query::Duplicates => fdupes::sizes_with_duplicates(&mut trees, groups.hard_links)?,
            Query::OnAll => fdupes::sizes_on_all(&mut trees)?,
            Query::FirstOnly | Query::FirstNotOnly => {
                let mut sizes = trees[0].all_sizes()?;
                sizes.sort_unstable();
                sizes
            }
        };
        sizes.into_iter().map(Some).collect()
    } else {
        vec![None]
    };

    for size in buckets {
        let found: Vec<(Option<i64>, fdupes::LocatedFiles)> = match query {
            Query::Duplicates => {
                fdupes::groups_of_duplicates_at_size(&mut trees, size, groups.hard_links)?
                    .into_iter()
                    .map(|(fp, located)| (Some(fp), located))
                    .collect()
            }
            Query::OnAll => fdupes::groups_on_all_at_size(&mut trees, size)?
                .into_iter()
                .map(|(fp, located)| (Some(fp), located))
                .collect(),
            Query::FirstOnly => fdupes::groups_on_first_only_at_size(&mut trees, size)?,
            Query::FirstNotOnly => fdupes::groups_on_first_not_only_at_size(&mut trees, size)?
                .into_iter()
                .map(|(fp, located)| (Some(fp), located))
                .collect(),
        };
        for (fp, located) in found {
            if groups.json {
                write_group_json(&mut out, &trees, fp, &located)?;
            } else {
                printer.add_group(&mut out, &trees, &located)?;
            }
        }
    }
    printer.flush(&mut out)?;
    Ok(ExitCode::SUCCESS)
}

/// One JSON object per group: fingerprint plus per-tree path lists.
fn write_group_json(
    out: &mut dyn Write,
    trees: &[PropertyTree],
    fingerprint: Option<i64>,
    located: &fdupes::LocatedFiles,
) -> Result<()> {
    let members: Vec<serde_json::Value> = located
        .iter()
        .map(|(index, ids)| {
            let paths: Vec<String> = ids
                .iter()
                .filter_map(|id| trees[*index].tree().file(*id))
                .flat_map(|f| f.paths.iter().map(|p| trees[*index].printable_path(p)))
                .collect();
            serde_json::json!({ "tree": trees[*index].printable_path(camino::Utf8Path::new("")), "paths": paths })
        })
        .collect();
    let value = serde_json::json!({ "fingerprint": fingerprint, "files": members });
    writeln!(out, "{value}")?;
    Ok(())
}

fn cmd_check(tree: &Utf8PathBuf, paths: &[Utf8PathBuf], opts: &TreeOptions) -> Result<ExitCode> {
    let mut tree = open_tree(tree, opts, false)?;
    let ids = if paths.is_empty() {
        tree.walk_files()?
    } else {
        let mut ids = Vec::new();
        for path in paths {
            match tree.file_at(path)? {
                Some(id) => ids.push(id),
                None => anyhow::bail!("no such file in tree: {path}"),
            }
        }
        ids
    };

    let mut failed = 0usize;
    for id in ids {
        match tree.recheck_fingerprint(id) {
            Ok(true) => {}
            Ok(false) => {
                failed += 1;
                println!("MISMATCH {}", tree.path_digest(id));
            }
            Err(e) => {
                failed += 1;
                println!("ERROR {} ({e})", tree.path_digest(id));
            }
        }
    }
    if failed == 0 {
        eprintln!("all fingerprints match");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{failed} files failed the check");
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_purge(tree: &Utf8PathBuf, opts: &TreeOptions) -> Result<ExitCode> {
    let mut tree = open_tree(tree, opts, false)?;
    tree.purge_stale()?;
    tree.compact_store()?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_mkoffline(tree: &Utf8PathBuf, output: &Utf8PathBuf, opts: &TreeOptions) -> Result<ExitCode> {
    let mut tree = open_tree(tree, opts, false)?;
    let report = tree.bulk_update()?;
    if !report.errors.is_empty() {
        tracing::warn!(
            errors = report.errors.len(),
            "snapshot will omit files that could not be fingerprinted"
        );
    }
    tree.freeze_offline(output, None)?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_rmoffline(db_file: &Utf8PathBuf) -> Result<ExitCode> {
    let mut store = linksync::CacheStore::open_offline(db_file)?;
    store.with_txn(|s| s.clear_offline())?;
    store.compact()?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_lookup(tree: &Utf8PathBuf, paths: &[Utf8PathBuf], opts: &TreeOptions) -> Result<ExitCode> {
    let mut tree = open_tree(tree, opts, false)?;
    for path in paths {
        match tree.file_at(path)? {
            Some(id) => {
                let fp = tree.get_fingerprint(id)?;
                println!("{fp}  {path}");
            }
            None => anyhow::bail!("no such file in tree: {path}"),
        }
    }
    Ok(ExitCode::SUCCESS)
}
