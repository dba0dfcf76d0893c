use std::{
    io::{self, Write},
    ops::ControlFlow,
    path::PathBuf,
};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mdtodo::config::Settings;
use mdtodo::core::{Priority, Task};
use mdtodo::projectors::{self, TaskFilter};
use mdtodo::state::{Mutation, RescanSummary, TodoState};
use mdtodo::storage::{FsStore, RelPath, ScanPolicy};
use mdtodo::watch::{self, DocumentEvent};
use mdtodo::writer::{NewTask, WriteOutcome};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "mdtodo",
    about = "Tagged checklist tasks across a folder of Markdown notes",
    version
)]
struct Cli {
    /// Vault root directory.
    #[arg(long, global = true, default_value = ".")]
    vault: PathBuf,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Override the tag prefix from settings.
    #[arg(long, global = true)]
    tag_prefix: Option<String>,
    /// Override the quick-add inbox document from settings.
    #[arg(long, global = true)]
    inbox: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan the vault and print tasks.
    List(ListArgs),

    /// Print groups and their categories.
    Groups(GroupsArgs),

    /// Mark the task at FILE:LINE complete.
    Done(TaskRefArgs),

    /// Mark the task at FILE:LINE incomplete.
    Undo(TaskRefArgs),

    /// Replace the title of the task at FILE:LINE.
    Edit(EditArgs),

    /// Delete the task line at FILE:LINE.
    Rm(TaskRefArgs),

    /// Append a task to the inbox document.
    Add(AddArgs),

    /// Re-scan whenever documents change.
    Watch,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
    /// Only tasks in this group (slug).
    #[arg(long, conflicts_with = "category")]
    group: Option<String>,
    /// Only tasks in this category (GROUP/CATEGORY slugs).
    #[arg(long)]
    category: Option<String>,
    /// Override `showCompleted` from settings.
    #[arg(long)]
    show_completed: Option<bool>,
}

#[derive(Debug, Args)]
struct GroupsArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TaskRefArgs {
    /// Task location as FILE:LINE (1-based, relative to the vault).
    #[arg(value_parser = parse_task_ref)]
    task: TaskRef,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[arg(value_parser = parse_task_ref)]
    task: TaskRef,
    /// New title.
    title: String,
}

#[derive(Debug, Args)]
struct AddArgs {
    title: String,
    /// Category as GROUP/CATEGORY slugs; must already exist in the vault.
    #[arg(long)]
    category: Option<String>,
    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    priority: PriorityArg,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PriorityArg {
    Urgent,
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Urgent => Priority::Urgent,
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskRef {
    file: RelPath,
    line: usize,
}

fn parse_task_ref(raw: &str) -> Result<TaskRef, String> {
    let (file, line) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected FILE:LINE, got {raw:?}"))?;
    if file.is_empty() {
        return Err(format!("missing file in {raw:?}"));
    }
    let line: usize = line
        .parse()
        .map_err(|_| format!("line must be a positive number in {raw:?}"))?;
    if line == 0 {
        return Err(format!("line numbers start at 1 in {raw:?}"));
    }
    Ok(TaskRef {
        file: RelPath::new(file),
        line,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(cli, &mut out)
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

struct Vault {
    root: PathBuf,
    settings: Settings,
    store: FsStore,
    state: TodoState,
    /// Result of the scan `open_vault` ran.
    initial: RescanSummary,
}

fn open_vault(cli: &Cli) -> Result<Vault> {
    let root = cli.vault.clone();
    if !root.is_dir() {
        bail!("vault {:?} is not a directory", root);
    }
    let mut settings = Settings::load(&root)?;
    if let Some(prefix) = &cli.tag_prefix {
        settings.tag_prefix = prefix.clone();
    }
    if let Some(inbox) = &cli.inbox {
        settings.inbox_file = inbox.clone();
    }
    let settings = settings.normalized();

    let store = FsStore::with_policy(&root, ScanPolicy::default());
    let mut state = TodoState::new();
    let initial = state
        .rescan(&store, &settings)
        .with_context(|| format!("scanning {:?}", root))?;
    if let Some(message) = state.error_message() {
        warn!("{message}");
    }
    Ok(Vault {
        root,
        settings,
        store,
        state,
        initial,
    })
}

fn run(cli: Cli, out: &mut dyn Write) -> Result<()> {
    let mut vault = open_vault(&cli)?;
    match cli.command {
        Commands::List(args) => handle_list(&vault, args, out),
        Commands::Groups(args) => handle_groups(&vault, args, out),
        Commands::Done(args) => handle_toggle(&mut vault, args.task, true, out),
        Commands::Undo(args) => handle_toggle(&mut vault, args.task, false, out),
        Commands::Edit(args) => handle_edit(&mut vault, args, out),
        Commands::Rm(args) => handle_rm(&mut vault, args.task, out),
        Commands::Add(args) => handle_add(&mut vault, args, out),
        Commands::Watch => handle_watch(&mut vault, out),
    }
}

fn handle_list(vault: &Vault, args: ListArgs, out: &mut dyn Write) -> Result<()> {
    let snapshot = vault.state.view();
    let filter = if let Some(key) = &args.group {
        let group = projectors::group_by_key(snapshot, key)
            .with_context(|| format!("no group {key:?} in the vault"))?;
        TaskFilter::Group(group.id)
    } else if let Some(key) = &args.category {
        let category = projectors::category_by_key(snapshot, key)
            .with_context(|| format!("no category {key:?} in the vault"))?;
        TaskFilter::Category(category.id)
    } else {
        TaskFilter::All
    };
    let show_completed = args.show_completed.unwrap_or(vault.settings.show_completed);
    let tasks = projectors::visible_tasks(snapshot, filter, show_completed);

    if args.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&tasks)?)?;
        return Ok(());
    }
    for task in tasks {
        writeln!(
            out,
            "{}  [{}]  {}",
            task_line(task),
            projectors::category_label(snapshot, task.category_id),
            location(task)
        )?;
    }
    Ok(())
}

fn handle_groups(vault: &Vault, args: GroupsArgs, out: &mut dyn Write) -> Result<()> {
    let snapshot = vault.state.view();
    let views = projectors::categories_by_group(snapshot);
    let ungrouped = projectors::ungrouped_categories(snapshot);

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            groups: &'a [projectors::GroupView<'a>],
            ungrouped: &'a [&'a mdtodo::core::Category],
        }
        let payload = JsonOutput {
            groups: &views,
            ungrouped: &ungrouped,
        };
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        return Ok(());
    }

    for view in &views {
        let mut flags = Vec::new();
        if view.group.archived {
            flags.push("archived");
        }
        if view.group.collapsed {
            flags.push("collapsed");
        }
        let suffix = if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        };
        writeln!(out, "{}{}", view.group.name, suffix)?;
        for category in &view.categories {
            match &category.emoji {
                Some(emoji) => writeln!(out, "  {} {}", emoji, category.name)?,
                None => writeln!(out, "  {}", category.name)?,
            }
        }
    }
    for category in ungrouped {
        writeln!(out, "{}", category.name)?;
    }
    Ok(())
}

fn find_task(vault: &Vault, task_ref: &TaskRef) -> Result<Task> {
    vault
        .state
        .find_task_at(&task_ref.file, task_ref.line)
        .cloned()
        .with_context(|| format!("no task at {}:{}", task_ref.file, task_ref.line))
}

fn apply(vault: &mut Vault, mutation: Mutation, verb: &str) -> Result<()> {
    let outcome = vault
        .state
        .apply(&vault.store, &vault.settings, mutation)
        .with_context(|| format!("{verb} failed"))?;
    match outcome {
        WriteOutcome::Applied => Ok(()),
        WriteOutcome::NotApplied(reason) => bail!("{verb} not applied: {reason}"),
    }
}

fn handle_toggle(vault: &mut Vault, task_ref: TaskRef, completed: bool, out: &mut dyn Write) -> Result<()> {
    let task = find_task(vault, &task_ref)?;
    apply(
        vault,
        Mutation::ToggleComplete {
            task_id: task.id,
            completed,
        },
        if completed { "done" } else { "undo" },
    )?;
    match vault.state.task(task.id) {
        Some(updated) => writeln!(out, "{}  {}", task_line(updated), location(updated))?,
        None => writeln!(out, "{}", task.title)?,
    }
    Ok(())
}

fn handle_edit(vault: &mut Vault, args: EditArgs, out: &mut dyn Write) -> Result<()> {
    let task = find_task(vault, &args.task)?;
    apply(
        vault,
        Mutation::EditTitle {
            task_id: task.id,
            title: args.title,
        },
        "edit",
    )?;
    match vault.state.find_task_at(&args.task.file, args.task.line) {
        Some(updated) => writeln!(out, "{}  {}", task_line(updated), location(updated))?,
        None => writeln!(out, "edited {}:{}", args.task.file, args.task.line)?,
    }
    Ok(())
}

fn handle_rm(vault: &mut Vault, task_ref: TaskRef, out: &mut dyn Write) -> Result<()> {
    let task = find_task(vault, &task_ref)?;
    apply(vault, Mutation::Delete { task_id: task.id }, "rm")?;
    writeln!(out, "removed {:?} from {}:{}", task.title, task_ref.file, task_ref.line)?;
    Ok(())
}

fn handle_add(vault: &mut Vault, args: AddArgs, out: &mut dyn Write) -> Result<()> {
    let category_id = match &args.category {
        Some(key) => Some(
            projectors::category_by_key(vault.state.view(), key)
                .with_context(|| format!("no category {key:?} in the vault"))?
                .id,
        ),
        None => None,
    };
    let new = NewTask {
        title: args.title,
        category_id,
        priority: args.priority.into(),
    };
    apply(vault, Mutation::Add(new.clone()), "add")?;
    writeln!(out, "added {:?} to {}", new.title.trim(), vault.settings.inbox_path())?;
    Ok(())
}

fn handle_watch(vault: &mut Vault, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{} {}", Local::now().format("%H:%M:%S"), vault.initial)?;
    out.flush()?;

    let root = vault.root.clone();
    let policy = vault.store.policy().clone();
    let debounce = vault.settings.debounce();
    watch::watch_vault(&root, &policy, debounce, |events| {
        if let Err(err) = request_rescan(vault, &events, out) {
            warn!(%err, "could not report re-scan");
        }
        ControlFlow::Continue(())
    })
}

/// One re-scan for a debounced batch of document events.
fn request_rescan(vault: &mut Vault, events: &[DocumentEvent], out: &mut dyn Write) -> Result<()> {
    info!(events = events.len(), "re-scan requested");
    let stamp = Local::now().format("%H:%M:%S");
    match vault.state.rescan(&vault.store, &vault.settings) {
        Ok(summary) => writeln!(out, "{stamp} {summary}")?,
        Err(err) => writeln!(out, "{stamp} scan failed: {err}")?,
    }
    out.flush()?;
    Ok(())
}

fn task_line(task: &Task) -> String {
    format!("[{}] {}", if task.completed { "x" } else { " " }, task.title)
}

fn location(task: &Task) -> String {
    match (&task.source_file, task.source_line) {
        (Some(file), Some(line)) => format!("{file}:{line}"),
        _ => String::from("-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn run_in(vault: &Path, args: &[&str]) -> Result<String> {
        let mut argv = vec!["mdtodo", "--vault", vault.to_str().expect("utf-8 path")];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        run(cli, &mut out)?;
        Ok(String::from_utf8(out).expect("utf-8 output"))
    }

    fn vault_with(files: &[(&str, &str)]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().expect("tempdir");
        for (path, text) in files {
            let full = tmp.path().join(path);
            fs::create_dir_all(full.parent().expect("parent")).expect("mkdir");
            fs::write(full, text).expect("write");
        }
        tmp
    }

    #[test]
    fn opening_a_vault_keeps_the_first_scan_summary() {
        let tmp = vault_with(&[
            ("a.md", "- [ ] #todo/work/admin File taxes\n"),
            ("b.md", "- [ ] #todo Stretch\n"),
        ]);
        let vault_arg = tmp.path().to_str().expect("utf-8 path");
        let cli = Cli::try_parse_from(["mdtodo", "--vault", vault_arg, "watch"]).expect("cli");
        let vault = open_vault(&cli).expect("open");

        assert_eq!(vault.initial.tasks, 2);
        assert_eq!(vault.initial.categories, 1);
        assert_eq!(vault.initial.groups, 1);
        assert_eq!(vault.initial.to_string(), "2 tasks, 1 categories, 1 groups");
        assert_eq!(vault.state.tasks().len(), vault.initial.tasks);
    }

    #[test]
    fn task_refs_parse_file_and_line() {
        assert_eq!(
            parse_task_ref("Projects/Plan.md:12").unwrap(),
            TaskRef {
                file: RelPath::new("Projects/Plan.md"),
                line: 12
            }
        );
        assert!(parse_task_ref("Plan.md").is_err());
        assert!(parse_task_ref("Plan.md:0").is_err());
        assert!(parse_task_ref(":3").is_err());
        assert!(parse_task_ref("Plan.md:x").is_err());
    }

    #[test]
    fn list_prints_tasks_with_category_and_location() {
        let tmp = vault_with(&[(
            "notes/today.md",
            "# Today\n- [ ] #todo/work/admin File taxes\n- [x] #todo Stretch\n",
        )]);
        let out = run_in(tmp.path(), &["list"]).expect("list");
        assert_eq!(
            out,
            "[ ] File taxes  [Admin]  notes/today.md:2\n[x] Stretch  [Uncategorized]  notes/today.md:3\n"
        );

        let open_only = run_in(tmp.path(), &["list", "--show-completed", "false"]).expect("list");
        assert_eq!(open_only.lines().count(), 1);

        let by_group = run_in(tmp.path(), &["list", "--group", "work", "--json"]).expect("list");
        let parsed: serde_json::Value = serde_json::from_str(&by_group).expect("json");
        assert_eq!(parsed[0]["title"], "File taxes");
        assert_eq!(parsed[0]["sourceLine"], 2);
    }

    #[test]
    fn done_and_undo_rewrite_the_line() {
        let tmp = vault_with(&[("a.md", "- [ ] #todo/health Drink water 🔼\n")]);
        run_in(tmp.path(), &["done", "a.md:1"]).expect("done");
        let text = fs::read_to_string(tmp.path().join("a.md")).unwrap();
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(text, format!("- [x] #todo/health Drink water 🔼 ✅ {today}\n"));

        run_in(tmp.path(), &["undo", "a.md:1"]).expect("undo");
        let text = fs::read_to_string(tmp.path().join("a.md")).unwrap();
        assert_eq!(text, "- [ ] #todo/health Drink water 🔼\n");
    }

    #[test]
    fn edit_rm_and_add_go_through_the_writer() {
        let tmp = vault_with(&[("a.md", "- [ ] #todo/work/admin Old 📅 2025-01-01\nkeep\n")]);
        run_in(tmp.path(), &["edit", "a.md:1", "New"]).expect("edit");
        assert_eq!(
            fs::read_to_string(tmp.path().join("a.md")).unwrap(),
            "- [ ] #todo/work/admin New\nkeep\n"
        );

        run_in(
            tmp.path(),
            &["--inbox", "Inbox/Capture", "add", "Call bank", "--category", "work/admin", "--priority", "urgent"],
        )
        .expect("add");
        assert_eq!(
            fs::read_to_string(tmp.path().join("Inbox/Capture.md")).unwrap(),
            "- [ ] #todo/work/admin Call bank ⏫\n"
        );

        run_in(tmp.path(), &["rm", "a.md:1"]).expect("rm");
        assert_eq!(fs::read_to_string(tmp.path().join("a.md")).unwrap(), "keep\n");
    }

    #[test]
    fn missing_tasks_and_blank_titles_fail() {
        let tmp = vault_with(&[("a.md", "- [ ] #todo A\n")]);
        let err = run_in(tmp.path(), &["done", "a.md:5"]).unwrap_err();
        assert!(err.to_string().contains("no task at a.md:5"));

        let err = run_in(tmp.path(), &["edit", "a.md:1", "  "]).unwrap_err();
        assert!(err.to_string().contains("not applied"));
        assert_eq!(fs::read_to_string(tmp.path().join("a.md")).unwrap(), "- [ ] #todo A\n");
    }

    #[test]
    fn settings_file_and_flags_choose_the_prefix() {
        let tmp = vault_with(&[("a.md", "- [ ] #task/home Sweep\n- [ ] #todo Other\n")]);
        let settings = Settings {
            tag_prefix: "#task".into(),
            ..Settings::default()
        };
        settings.save(tmp.path()).expect("save");

        let out = run_in(tmp.path(), &["list"]).expect("list");
        assert!(out.contains("Sweep") && !out.contains("Other"));

        let out = run_in(tmp.path(), &["--tag-prefix", "#todo", "list"]).expect("list");
        assert!(out.contains("Other") && !out.contains("Sweep"));
    }

    #[test]
    fn groups_lists_categories_with_emoji() {
        let tmp = vault_with(&[("a.md", "- [ ] #todo/life/health Run\n- [ ] #todo/life/chores Sweep\n")]);
        let out = run_in(tmp.path(), &["groups"]).expect("groups");
        assert_eq!(out, "Life\n  💪 Health\n  Chores\n");
    }
}
