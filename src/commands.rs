//! Command dispatch and babble handlers.
//!
//! Each command kind maps to exactly one `run_*` handler. A handler fills in
//! the command's answer and reports success or failure; failures are logged
//! and never end the connection. `answer_command` then puts the answer on
//! the wire of the client that issued it.

use crate::protocol::{
    client_key, notify_parse_error, write_answer, Answer, Command, CommandKind, ParseError,
    SendError, BABBLE_TIMELINE_MAX,
};
use crate::registration::{ClientBundle, ClientDirectory, DirectoryError};
use crate::storage::{Storage, StorageError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state every handler works against.
#[derive(Clone)]
pub struct ServerContext {
    pub directory: Arc<ClientDirectory>,
    pub storage: Arc<Storage>,
}

impl ServerContext {
    /// Build the shared state once at startup.
    pub fn new(max_clients: usize) -> Self {
        Self {
            directory: Arc::new(ClientDirectory::new(max_clients)),
            storage: Storage::new(),
        }
    }
}

/// Handler failures
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("registration failed: {0}")]
    Registration(#[from] DirectoryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("LOGIN without a connection")]
    MissingConnection,
}

/// Route `cmd` to its handler.
pub fn process_command(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let result = match cmd.kind {
        CommandKind::Login => run_login_command(cmd, ctx),
        CommandKind::Publish => run_publish_command(cmd, ctx),
        CommandKind::Follow => run_follow_command(cmd, ctx),
        CommandKind::Timeline => run_timeline_command(cmd, ctx),
        CommandKind::FollowCount => run_fcount_command(cmd, ctx),
        CommandKind::Rdv => run_rdv_command(cmd, ctx),
        CommandKind::Unregister => unregister_client(cmd, ctx),
    };

    if let Err(ref e) = result {
        warn!(error = %e, command = %cmd, "Failed to run command");
    }
    result
}

/// Register the connection carried by `cmd` under the key of its identifier.
pub fn run_login_command(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let id = cmd.payload.clone();
    cmd.key = client_key(&id);

    let sink = cmd.sink.take().ok_or(CommandError::MissingConnection)?;
    match ctx.directory.insert(ClientBundle::new(cmd.key, &id, sink)) {
        Ok(bundle) => cmd.origin = Some(bundle),
        Err(e) => {
            cmd.answer = Answer::Single(format!("login {id} failed: {e}"));
            return Err(e.into());
        }
    }
    ctx.storage.register(cmd.key, &id);

    cmd.answer = Answer::Single(format!("{id} registered with key {}", cmd.key));
    Ok(())
}

pub fn run_publish_command(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let publication = ctx.storage.publish(cmd.key, &cmd.payload)?;
    cmd.answer = Answer::Single(format!("{{{}}} published", publication.time.to_rfc3339()));
    Ok(())
}

pub fn run_follow_command(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let target = client_key(&cmd.payload);
    match ctx.storage.follow(cmd.key, target) {
        Ok(()) => {
            cmd.answer = Answer::Single(format!("follow {}", cmd.payload));
            Ok(())
        }
        Err(StorageError::UnknownClient(key)) if key == target => {
            cmd.answer = Answer::Single(format!("follow {} failed", cmd.payload));
            Err(CommandError::UnknownClient(cmd.payload.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Answer with every publication of followed clients, oldest first.
pub fn run_timeline_command(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let timeline = ctx.storage.timeline(cmd.key)?;
    cmd.answer = Answer::Sequence(timeline.into_iter().map(|p| p.text).collect());
    Ok(())
}

pub fn run_fcount_command(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let summary = ctx.storage.summary(cmd.key)?;
    cmd.answer = Answer::Single(format!("{} has {} followers", summary.id, summary.followers));
    Ok(())
}

/// Acknowledge once everything this connection sent before has run.
pub fn run_rdv_command(cmd: &mut Command, _ctx: &ServerContext) -> Result<(), CommandError> {
    cmd.answer = Answer::Single("rdv_ack".to_string());
    Ok(())
}

/// Drop the directory entry of a closing connection.
pub fn unregister_client(cmd: &mut Command, ctx: &ServerContext) -> Result<(), CommandError> {
    let bundle = ctx.directory.remove(cmd.key)?;
    debug!(key = bundle.key, id = %bundle.id, "Unregistered client");
    Ok(())
}

/// Deliver the answer of a processed command to the client that sent it.
///
/// Consumes the command; its answer is dropped unsent when the client asked
/// for none. A command carrying its origin is answered on that session only,
/// never on a later login of the same identifier. Returns the number of
/// message frames written.
pub fn answer_command(cmd: Command, directory: &ClientDirectory) -> Result<usize, SendError> {
    let Command {
        key,
        answer,
        answer_expected,
        origin,
        ..
    } = cmd;

    if !answer_expected || answer == Answer::Empty {
        return Ok(0);
    }

    let bundle = match origin {
        Some(bundle) if directory.is_current(&bundle) => bundle,
        Some(_) => return Err(SendError::NotConnected(key)),
        None => directory.lookup(key).ok_or(SendError::NotConnected(key))?,
    };
    bundle.write_with(|out| write_answer(answer, out, BABBLE_TIMELINE_MAX))
}

/// Report a parse failure on the connection of `origin`.
pub fn notify_client_parse_error(origin: &ClientBundle, err: &ParseError) -> Result<(), SendError> {
    origin.write_with(|out| notify_parse_error(out, err))?;
    Ok(())
}
