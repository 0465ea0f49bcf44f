use crate::remote::ExponentialBackoff;
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use core::time::Duration;
use firestore_remote_core::{
    DEFAULT_DATABASE_ID, DatabaseId, DatabaseInfo,
    model::{DocumentKey, FieldValue, Mutation, ObjectValue},
};

/// Persistence key reported for sessions started from the command line.
pub const CLI_PERSISTENCE_KEY: &str = "firestore-remote-cli";

/// Runtime configuration for the `firestore-remote` binary.
///
/// Every connection setting can also be supplied through the environment (or
/// a `.env` file). The subcommand picks what to do once connected.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "firestore-remote",
    version,
    about = "Look up and write Firestore documents over the remote transport"
)]
pub struct CliArgs {
    /// Backend `host[:port]`.
    ///
    /// Point this at a local emulator together with `--insecure`.
    ///
    /// Environment variable: `FIRESTORE_HOST`
    #[arg(long, env = "FIRESTORE_HOST", default_value_t = String::from("firestore.googleapis.com"))]
    pub host: String,

    /// Project that owns the database.
    ///
    /// Environment variable: `FIRESTORE_PROJECT_ID`
    #[arg(long, env = "FIRESTORE_PROJECT_ID")]
    pub project_id: String,

    /// Database within the project.
    ///
    /// Environment variable: `FIRESTORE_DATABASE_ID`
    #[arg(long, env = "FIRESTORE_DATABASE_ID", default_value_t = String::from(DEFAULT_DATABASE_ID))]
    pub database_id: String,

    /// Connect over plaintext HTTP/2 instead of TLS.
    ///
    /// Environment variable: `FIRESTORE_INSECURE`
    #[arg(long, env = "FIRESTORE_INSECURE", default_value_t = false)]
    pub insecure: bool,

    /// OAuth bearer token sent with every call. Calls are unauthenticated
    /// when absent.
    ///
    /// Environment variable: `FIRESTORE_TOKEN`
    #[arg(long, env = "FIRESTORE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// First non-zero reconnect delay of the write stream, in milliseconds.
    ///
    /// Environment variable: `BACKOFF_INITIAL_MS`
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value_t = 1_000)]
    pub backoff_initial_ms: u64,

    /// Growth factor applied to the reconnect delay after every failure.
    ///
    /// Environment variable: `BACKOFF_FACTOR`
    #[arg(long, env = "BACKOFF_FACTOR", default_value_t = 1.5)]
    pub backoff_factor: f64,

    /// Upper bound of the reconnect delay, in milliseconds.
    ///
    /// Environment variable: `BACKOFF_MAX_MS`
    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub backoff_max_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch documents by path, e.g. `rooms/eros`.
    Lookup {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Delete documents in one commit.
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Overwrite one document in a unary commit.
    Set {
        key: String,
        /// A field as `NAME=JSON`, e.g. `--field 'count=3'`. Repeatable.
        #[arg(long = "field", value_name = "NAME=JSON")]
        fields: Vec<String>,
    },
    /// Overwrite one document through the write stream.
    Stream {
        key: String,
        /// A field as `NAME=JSON`. Repeatable.
        #[arg(long = "field", value_name = "NAME=JSON")]
        fields: Vec<String>,
    },
}

/// What the binary does once connected.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Lookup(Vec<DocumentKey>),
    Commit(Vec<Mutation>),
    Stream(Vec<Mutation>),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub database_info: DatabaseInfo,
    pub token: Option<String>,
    pub backoff: ExponentialBackoff,
    pub action: Action,
}

impl TryFrom<CliArgs> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.project_id.trim().is_empty() {
            bail!("FIRESTORE_PROJECT_ID must not be empty");
        }
        if args.database_id.trim().is_empty() {
            bail!("FIRESTORE_DATABASE_ID must not be empty");
        }
        if args.host.trim().is_empty() {
            bail!("FIRESTORE_HOST must not be empty");
        }

        if !args.backoff_factor.is_finite() || args.backoff_factor < 1.0 {
            bail!(
                "BACKOFF_FACTOR ({}) must be a finite number of at least 1.0",
                args.backoff_factor
            );
        }
        if args.backoff_initial_ms > args.backoff_max_ms {
            bail!(
                "BACKOFF_INITIAL_MS ({}) exceeds BACKOFF_MAX_MS ({})",
                args.backoff_initial_ms,
                args.backoff_max_ms
            );
        }

        let action = match args.command {
            Command::Lookup { keys } => Action::Lookup(parse_keys(&keys)?),
            Command::Delete { keys } => Action::Commit(
                parse_keys(&keys)?
                    .into_iter()
                    .map(Mutation::delete)
                    .collect(),
            ),
            Command::Set { key, fields } => Action::Commit(vec![parse_set(&key, &fields)?]),
            Command::Stream { key, fields } => Action::Stream(vec![parse_set(&key, &fields)?]),
        };

        let database_id = DatabaseId::new(args.project_id, args.database_id);
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(args.backoff_initial_ms),
            args.backoff_factor,
            Duration::from_millis(args.backoff_max_ms),
        );

        Ok(Self {
            database_info: DatabaseInfo::new(
                database_id,
                CLI_PERSISTENCE_KEY,
                args.host,
                !args.insecure,
            ),
            token: args.token.filter(|token| !token.is_empty()),
            backoff,
            action,
        })
    }
}

fn parse_keys(paths: &[String]) -> anyhow::Result<Vec<DocumentKey>> {
    paths
        .iter()
        .map(|path| DocumentKey::from_path(path).with_context(|| format!("bad document key '{path}'")))
        .collect()
}

fn parse_set(path: &str, fields: &[String]) -> anyhow::Result<Mutation> {
    let key = DocumentKey::from_path(path).with_context(|| format!("bad document key '{path}'"))?;
    let mut value = ObjectValue::new();
    for field in fields {
        let (name, value_json) = parse_field(field)?;
        value.insert(name, value_json);
    }
    Ok(Mutation::set(key, value))
}

/// Parses `NAME=JSON` into a field name and value.
fn parse_field(field: &str) -> anyhow::Result<(String, FieldValue)> {
    let Some((name, json)) = field.split_once('=') else {
        bail!("field '{field}' is not of the form NAME=JSON");
    };
    if name.is_empty() {
        bail!("field '{field}' has an empty name");
    }
    let json: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("field '{name}' is not valid JSON"))?;
    Ok((name.to_string(), field_value_from_json(json)))
}

fn field_value_from_json(json: serde_json::Value) -> FieldValue {
    use serde_json::Value;

    match json {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => FieldValue::String(s),
        Value::Array(values) => {
            FieldValue::Array(values.into_iter().map(field_value_from_json).collect())
        }
        Value::Object(fields) => FieldValue::Map(
            fields
                .into_iter()
                .map(|(name, value)| (name, field_value_from_json(value)))
                .collect(),
        ),
    }
}
