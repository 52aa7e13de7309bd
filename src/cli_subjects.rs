use anyhow::Result;
use clap::builder::styling::{AnsiColor, Color, Style};
use clap::builder::{BoolishValueParser, Styles};
use clap::{ArgAction, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use reconcile_poller::poller::{
    RecipientStore, Recipient, SubjectStore, TrackedSubject, WatermarkKind,
};
use reconcile_poller::{SqlitePollerStore, SubjectRegistry};

use rustyline::{
    completion::Completer, highlight::Highlighter, history::FileHistory, validate::Validator,
    CompletionType, Config, Editor, Helper,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn get_styles() -> Styles {
    let bold = Style::new().bold();
    Styles::styled()
        .usage(bold.underline().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
        .header(bold.underline().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
        .literal(bold.fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .invalid(bold.fg_color(Some(Color::Ansi(AnsiColor::Red))))
        .error(bold.fg_color(Some(Color::Ansi(AnsiColor::Red))))
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::White))))
}

#[derive(Parser, Debug)]
#[command(styles=get_styles())]
struct CliArgs {
    /// Path to the SQLite poller database. Created if missing.
    #[clap(value_parser = parse_path)]
    pub path: PathBuf,
}

#[derive(Parser)]
#[command(styles=get_styles(), name = "")]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Sequence,
    Timestamp,
    Marker,
}

impl From<KindArg> for WatermarkKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Sequence => WatermarkKind::Sequence,
            KindArg::Timestamp => WatermarkKind::Timestamp,
            KindArg::Marker => WatermarkKind::Marker,
        }
    }
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Starts tracking a subject. The target is an absolute URL or a path
    /// relative to the daemon's upstream base URL.
    AddSubject {
        id: String,
        target: String,
        #[clap(long, value_enum, default_value = "sequence")]
        kind: KindArg,
        /// JSON pointer to the watermark inside the upstream response.
        #[clap(long)]
        selector: Option<String>,
        /// Human readable name, defaults to the id.
        #[clap(long)]
        label: Option<String>,
    },

    /// Stops tracking a subject and forgets its watermark and deliveries.
    RemoveSubject { id: String },

    /// Shows a subject with its watermark and subscribers.
    ShowSubject { id: String },

    /// Lists all tracked subjects.
    ListSubjects,

    /// Registers a recipient with its webhook address.
    AddRecipient {
        id: String,
        address: String,
        /// Register with notifications turned off.
        #[clap(long)]
        disabled: bool,
    },

    /// Deletes a recipient and all its subscriptions.
    RemoveRecipient { id: String },

    /// Lists all recipients.
    ListRecipients,

    /// Subscribes a recipient to a subject.
    Subscribe {
        subject_id: String,
        recipient_id: String,
    },

    /// Removes a recipient's subscription to a subject.
    Unsubscribe {
        subject_id: String,
        recipient_id: String,
    },

    /// Turns notifications on or off for a recipient.
    SetNotifications {
        recipient_id: String,
        #[clap(value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
        enabled: bool,
    },

    /// Lists subjects the upstream currently reports as gone.
    Missing,

    /// Shows the delivery records of a subject.
    Deliveries { subject_id: String },

    /// Shows the path of the current poller db.
    Where,

    /// Close this program.
    Exit,
}

enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

const PROMPT: &str = ">> ";

fn print_subject(subject: &TrackedSubject) {
    let missing = subject
        .missing_since
        .map(|t| format!(" [missing since {}]", t.to_rfc3339()))
        .unwrap_or_default();
    println!(
        "{} ({}) kind={} target={} selector={}{}",
        subject.id,
        subject.label,
        subject.kind,
        subject.target,
        subject.selector.as_deref().unwrap_or("-"),
        missing
    );
}

fn print_recipient(recipient: &Recipient) {
    println!(
        "{} -> {} notifications={}",
        recipient.id,
        recipient.address,
        if recipient.notifications_enabled {
            "on"
        } else {
            "off"
        }
    );
}

fn run_command(command: InnerCommand, store: &SqlitePollerStore, db_path: &Path) -> Result<bool> {
    match command {
        InnerCommand::AddSubject {
            id,
            target,
            kind,
            selector,
            label,
        } => {
            let subject = TrackedSubject {
                label: label.unwrap_or_else(|| id.clone()),
                id,
                target,
                selector,
                kind: kind.into(),
                missing_since: None,
            };
            store.add_subject(&subject)?;
            println!("Added subject {}", subject.id);
        }
        InnerCommand::RemoveSubject { id } => {
            if store.remove_subject(&id)? {
                println!("Removed subject {}", id);
            } else {
                anyhow::bail!("Subject {} not found", id);
            }
        }
        InnerCommand::ShowSubject { id } => {
            let Some(subject) = store.get_subject(&id)? else {
                anyhow::bail!("Subject {} not found", id);
            };
            print_subject(&subject);
            match store.get_watermark(&id)? {
                Some(watermark) => println!("  watermark: {}", watermark),
                None => println!("  watermark: none yet"),
            }
            let recipients = store.recipients_for(&id)?;
            println!("  subscribers: {}", recipients.len());
            for recipient in &recipients {
                print!("    ");
                print_recipient(recipient);
            }
        }
        InnerCommand::ListSubjects => {
            let subjects = store.list_subjects()?;
            if subjects.is_empty() {
                println!("No subjects");
            }
            for subject in &subjects {
                print_subject(subject);
            }
        }
        InnerCommand::AddRecipient {
            id,
            address,
            disabled,
        } => {
            store.add_recipient(&Recipient {
                id: id.clone(),
                address,
                notifications_enabled: !disabled,
            })?;
            println!("Added recipient {}", id);
        }
        InnerCommand::RemoveRecipient { id } => {
            if store.remove_recipient(&id)? {
                println!("Removed recipient {}", id);
            } else {
                anyhow::bail!("Recipient {} not found", id);
            }
        }
        InnerCommand::ListRecipients => {
            for recipient in store.list_recipients()? {
                print_recipient(&recipient);
            }
        }
        InnerCommand::Subscribe {
            subject_id,
            recipient_id,
        } => {
            if store.subscribe(&subject_id, &recipient_id)? {
                println!("{} subscribed to {}", recipient_id, subject_id);
            } else {
                println!("{} was already subscribed to {}", recipient_id, subject_id);
            }
        }
        InnerCommand::Unsubscribe {
            subject_id,
            recipient_id,
        } => {
            if !store.unsubscribe(&subject_id, &recipient_id)? {
                anyhow::bail!("{} is not subscribed to {}", recipient_id, subject_id);
            }
            println!("{} unsubscribed from {}", recipient_id, subject_id);
        }
        InnerCommand::SetNotifications {
            recipient_id,
            enabled,
        } => {
            if !store.set_notifications_enabled(&recipient_id, enabled)? {
                anyhow::bail!("Recipient {} not found", recipient_id);
            }
            println!(
                "Notifications {} for {}",
                if enabled { "enabled" } else { "disabled" },
                recipient_id
            );
        }
        InnerCommand::Missing => {
            let missing = store.list_missing_subjects()?;
            if missing.is_empty() {
                println!("No missing subjects");
            }
            for subject in &missing {
                print_subject(subject);
            }
        }
        InnerCommand::Deliveries { subject_id } => {
            for record in store.list_deliveries(&subject_id)? {
                println!(
                    "{} -> {}: {} after {} attempt(s), last at {}{}",
                    record.change_id,
                    record.recipient_id,
                    record.outcome.as_str(),
                    record.attempts,
                    record.last_attempt_at.to_rfc3339(),
                    record
                        .last_error
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
            }
        }
        InnerCommand::Where => {
            println!("{}", db_path.display());
        }
        InnerCommand::Exit => return Ok(false),
    }
    Ok(true)
}

fn execute_command(line: String, store: &SqlitePollerStore, db_path: &Path) -> CommandExecutionResult {
    if line.is_empty() {
        return CommandExecutionResult::Ok;
    }

    let args =
        shlex::split(&line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());

    let cli = InnerCli::try_parse_from(std::iter::once(" ").chain(args.iter().map(String::as_str)));

    match cli {
        Ok(cli) => {
            println!("{} {}", PROMPT, &line);
            match run_command(cli.command, store, db_path) {
                Ok(true) => CommandExecutionResult::Ok,
                Ok(false) => CommandExecutionResult::Exit,
                Err(err) => CommandExecutionResult::Error(format!("{:#}", err)),
            }
        }
        Err(e) => {
            if e.print().is_err() {
                println!("{}", e);
            }
            CommandExecutionResult::Ok
        }
    }
}

#[derive(rustyline_derive::Hinter)]
struct CommandHelper {
    commands_names: Vec<String>,
}

impl CommandHelper {
    pub fn new() -> Self {
        let commands_names: Vec<String> = InnerCli::command()
            .get_subcommands()
            .map(|sc| sc.get_name().to_string())
            .collect();

        CommandHelper { commands_names }
    }
}

impl Completer for CommandHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if line.contains(' ') {
            return Ok((0, Vec::new()));
        }
        let matches = self
            .commands_names
            .iter()
            .filter(|c| c.starts_with(line))
            .cloned()
            .collect();

        Ok((0, matches))
    }
}

impl Highlighter for CommandHelper {}
impl Validator for CommandHelper {}
impl Helper for CommandHelper {}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let store = SqlitePollerStore::new(&cli_args.path)?;

    InnerCli::command().print_long_help()?;

    let config = Config::builder()
        .completion_type(CompletionType::List)
        .build();

    let mut rl = Editor::<CommandHelper, FileHistory>::with_config(config)?;
    rl.set_helper(Some(CommandHelper::new()));

    loop {
        let readline = rl.readline(PROMPT);

        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);
                match execute_command(line, &store, &cli_args.path) {
                    CommandExecutionResult::Ok => {}
                    CommandExecutionResult::Exit => {
                        break;
                    }
                    CommandExecutionResult::Error(err) => {
                        eprintln!("Error: {}", err);
                        continue;
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                println!("CTRL-D: exiting.");
                break;
            }
            Err(e) => {
                println!("Error: {:?}", e);
                break;
            }
        }
    }
    Ok(())
}
