use std::path::PathBuf;

use billscan_core::BillId;
use thiserror::Error;

pub const USAGE: &str = "\
Usage: billscan [--config <FILE>] <COMMAND>

Commands:
  scan <IMAGE>...                   Scan receipt images and store the results
  watch                             Scan every image dropped into the intake folder
  add <ORGANIZATION> <AMOUNT> [TIP] Record a bill by hand
  list                              Show stored bills, newest first, with totals
  delete <ID>                       Remove a stored bill";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Scan { images: Vec<PathBuf> },
    Watch,
    Add { organization: String, amount: String, tip: String },
    List,
    Delete { id: BillId },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config: Option<PathBuf>,
    pub command: Command,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("missing command")]
    MissingCommand,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("`{0}` needs a value")]
    MissingValue(&'static str),
    #[error("unexpected argument `{0}`")]
    Unexpected(String),
    #[error("`{0}` is not a bill id")]
    BadId(String),
}

pub fn parse<I>(args: I) -> Result<Invocation, CliError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut config = None;

    let command = loop {
        match args.next().as_deref() {
            None => return Err(CliError::MissingCommand),
            Some("--config") | Some("-c") => {
                config = Some(PathBuf::from(args.next().ok_or(CliError::MissingValue("--config"))?));
            }
            Some(cmd) => break cmd.to_string(),
        }
    };
    let rest: Vec<String> = args.collect();

    let command = match command.as_str() {
        "scan" => {
            if rest.is_empty() {
                return Err(CliError::MissingValue("scan"));
            }
            Command::Scan { images: rest.into_iter().map(PathBuf::from).collect() }
        }
        "watch" => no_more(rest, Command::Watch)?,
        "list" => no_more(rest, Command::List)?,
        "add" => {
            let mut rest = rest.into_iter();
            let organization = rest.next().ok_or(CliError::MissingValue("add"))?;
            let amount = rest.next().ok_or(CliError::MissingValue("add"))?;
            let tip = rest.next().unwrap_or_default();
            no_more(rest.collect(), Command::Add { organization, amount, tip })?
        }
        "delete" => {
            let mut rest = rest.into_iter();
            let raw = rest.next().ok_or(CliError::MissingValue("delete"))?;
            let id = raw.parse::<i64>().map_err(|_| CliError::BadId(raw.clone()))?;
            no_more(rest.collect(), Command::Delete { id: BillId(id) })?
        }
        "help" | "--help" | "-h" => Command::Help,
        other => return Err(CliError::UnknownCommand(other.to_string())),
    };

    Ok(Invocation { config, command })
}

fn no_more(rest: Vec<String>, command: Command) -> Result<Command, CliError> {
    match rest.into_iter().next() {
        Some(extra) => Err(CliError::Unexpected(extra)),
        None => Ok(command),
    }
}
