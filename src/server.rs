//! Listener and per-connection command loop
//!
//! Every accepted connection becomes one pool task. The task owns its
//! `Session` and reads envelopes until the peer closes, answering each
//! command through an explicit match on `Command`.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::auth::{CredentialStore, SignupOutcome, SIGNUP_FAILED};
use crate::checksum::md5_file;
use crate::config::ServerConfig;
use crate::error::{FerryError, Result};
use crate::logger::{Direction, Logger};
use crate::pool::WorkerPool;
use crate::progress::NoProgress;
use crate::protocol::{status, Command, FileMeta, ResumeStatus, REPLY_BUF};
use crate::protocol_core::{
    ensure_dir_exists, read_envelope, read_reply, send_reply, validate_file_name, write_envelope,
};
use crate::session::Session;
use crate::transfer::{receive_into, resume_status, send_range};

/// State shared by every connection.
pub struct ServerContext {
    pub store: CredentialStore,
    pub logger: Arc<dyn Logger>,
}

impl ServerContext {
    pub fn new(store: CredentialStore, logger: Arc<dyn Logger>) -> Self {
        Self { store, logger }
    }
}

pub struct Server {
    listener: TcpListener,
    root: PathBuf,
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
}

impl Server {
    pub fn bind(config: &ServerConfig, logger: Arc<dyn Logger>) -> anyhow::Result<Self> {
        ensure_dir_exists(&config.root)
            .with_context(|| format!("create data root {}", config.root.display()))?;
        let root = fs::canonicalize(&config.root)
            .with_context(|| format!("canonicalize data root {}", config.root.display()))?;
        let user_info = config.user_info_path();
        let store = CredentialStore::open(&user_info, &root)
            .with_context(|| format!("open credential file {}", user_info.display()))?;

        let bind = config.bind_addr();
        let listener = TcpListener::bind(&bind).with_context(|| format!("bind {}", bind))?;
        let pool = WorkerPool::new(config.threads, Arc::clone(&logger));

        Ok(Self {
            listener,
            root,
            ctx: Arc::new(ServerContext::new(store, logger)),
            pool,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Accept forever. Connections beyond the pool size wait in its queue.
    pub fn run(&self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        self.ctx.logger.listen(&addr.to_string(), &self.root);
        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    let ctx = Arc::clone(&self.ctx);
                    self.pool.execute(move || serve_connection(stream, &ctx));
                }
                Err(e) => self.ctx.logger.error("accept", &e.to_string()),
            }
        }
        Ok(())
    }
}

pub fn serve(config: &ServerConfig, logger: Arc<dyn Logger>) -> anyhow::Result<()> {
    Server::bind(config, logger)?.run()
}

fn serve_connection(stream: TcpStream, ctx: &ServerContext) -> anyhow::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = stream.set_nodelay(true);
    ctx.logger.connect(&peer);
    let result = handle_conn(stream, ctx);
    ctx.logger.disconnect(&peer);
    result.with_context(|| format!("connection {}", peer))
}

pub fn handle_conn(mut stream: TcpStream, ctx: &ServerContext) -> Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut session = Session::new(peer);
    run_session(&mut stream, &mut session, ctx)
}

/// Command loop over any byte stream. Returns when the peer closes.
pub fn run_session<S: Read + Write>(
    stream: &mut S,
    session: &mut Session,
    ctx: &ServerContext,
) -> Result<()> {
    while let Some(envelope) = read_envelope(stream)? {
        let cmd = match Command::from_envelope(envelope) {
            Ok(cmd) => cmd,
            Err(e @ (FerryError::UnknownAction(_) | FerryError::BadRequest(_))) => {
                ctx.logger.error(session.peer(), &e.to_string());
                send_reply(stream, status::BAD_REQUEST)?;
                continue;
            }
            Err(e) => return Err(e),
        };
        dispatch(stream, session, ctx, cmd)?;
    }
    Ok(())
}

fn dispatch<S: Read + Write>(
    stream: &mut S,
    session: &mut Session,
    ctx: &ServerContext,
    cmd: Command,
) -> Result<()> {
    match cmd {
        Command::Signup {
            username,
            password,
            size,
        } => handle_signup(stream, session, ctx, &username, &password, size),
        Command::Login { username, password } => {
            handle_login(stream, session, ctx, &username, &password)
        }
        Command::Get { file_name } => handle_get(stream, session, ctx, &file_name),
        Command::Put {
            file_name,
            file_size,
            md5,
        } => handle_put(stream, session, ctx, &file_name, file_size, &md5),
        Command::Ls => {
            let reply = match session.ls() {
                Ok(listing) => listing,
                Err(e) => status_for(session, ctx, "ls", e).to_string(),
            };
            send_reply(stream, &reply)
        }
        Command::Cd { target_path } => {
            let code = session
                .cd(&target_path)
                .map(|o| o.code())
                .unwrap_or_else(|e| status_for(session, ctx, "cd", e));
            send_reply(stream, code)
        }
        Command::MkDir { dir_name } => {
            let code = session
                .mk_dir(&dir_name)
                .map(|o| o.code())
                .unwrap_or_else(|e| status_for(session, ctx, "mk_dir", e));
            send_reply(stream, code)
        }
        Command::Remove { dir_name } => {
            let code = session
                .remove(&dir_name)
                .map(|o| o.code())
                .unwrap_or_else(|e| status_for(session, ctx, "remove", e));
            send_reply(stream, code)
        }
        Command::GetFreeSize => handle_free_size(stream, session, ctx),
    }
}

/// Status code for a failed directory command.
fn status_for(session: &Session, ctx: &ServerContext, action: &str, err: FerryError) -> &'static str {
    match err {
        FerryError::NotAuthenticated => status::NOT_LOGGED_IN,
        e => {
            ctx.logger
                .error(session.peer(), &format!("{}: {}", action, e));
            status::INVALID
        }
    }
}

fn handle_signup<S: Write>(
    stream: &mut S,
    session: &Session,
    ctx: &ServerContext,
    username: &str,
    password: &str,
    quota_mb: u64,
) -> Result<()> {
    let reply = match ctx.store.signup(username, password, quota_mb) {
        Ok(outcome) => {
            if outcome == SignupOutcome::Created {
                ctx.logger.signup(username);
            }
            outcome.message()
        }
        Err(e) => {
            ctx.logger
                .error(session.peer(), &format!("signup {}: {}", username, e));
            SIGNUP_FAILED
        }
    };
    send_reply(stream, reply)
}

fn handle_login<S: Write>(
    stream: &mut S,
    session: &mut Session,
    ctx: &ServerContext,
    username: &str,
    password: &str,
) -> Result<()> {
    let ok = match ctx.store.login(username, password)? {
        Some(record) => {
            let home = ctx.store.home_of(&record.username);
            ensure_dir_exists(&home)?;
            session.login(&record.username, &home)?;
            true
        }
        None => false,
    };
    ctx.logger.login(username, ok);
    send_reply(stream, if ok { status::OK } else { status::FAILED })
}

fn handle_get<S: Read + Write>(
    stream: &mut S,
    session: &Session,
    ctx: &ServerContext,
    file_name: &str,
) -> Result<()> {
    let path = match locate_file(session, file_name) {
        Some(path) => path,
        None => return write_envelope(stream, &FileMeta::missing(file_name)),
    };
    let mut file = File::open(&path)?;
    let size = file.metadata()?.len();
    let md5 = md5_file(&path)?;
    write_envelope(
        stream,
        &FileMeta {
            file_name: file_name.to_string(),
            is_file: true,
            file_size: Some(size),
            md5: Some(md5),
        },
    )?;

    let reply = read_reply(stream, REPLY_BUF)?;
    let offset = match ResumeStatus::parse(&reply)?.offset() {
        Some(offset) => offset,
        None => return Ok(()),
    };
    let user = session.user()?;
    match send_range(&mut file, offset, size, stream, &mut NoProgress) {
        Ok(sent) => {
            ctx.logger
                .transfer(&user.username, Direction::Download, &path, sent);
            Ok(())
        }
        // Client holds more than we have; it expects nothing, so the session goes on
        Err(e @ FerryError::OffsetBeyondEnd { .. }) => {
            ctx.logger.error(session.peer(), &format!("get {}: {}", file_name, e));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// An existing regular file named by a single component in the current
/// directory.
fn locate_file(session: &Session, file_name: &str) -> Option<PathBuf> {
    if !session.is_authenticated() || validate_file_name(file_name).is_err() {
        return None;
    }
    session.resolve(file_name).ok().filter(|p| p.is_file())
}

fn handle_put<S: Read + Write>(
    stream: &mut S,
    session: &Session,
    ctx: &ServerContext,
    file_name: &str,
    file_size: u64,
    md5: &str,
) -> Result<()> {
    let user = match session.user() {
        Ok(user) => user,
        Err(_) => return send_reply(stream, status::NOT_LOGGED_IN),
    };
    if validate_file_name(file_name).is_err() {
        return send_reply(stream, status::INVALID);
    }
    let path = match session.resolve(file_name) {
        Ok(path) => path,
        Err(FerryError::PathViolation(_)) => return send_reply(stream, status::INVALID),
        Err(e) => return Err(e),
    };
    let resume = match resume_status(&path, file_size, md5) {
        Ok(resume) => resume,
        Err(FerryError::PathViolation(_)) => return send_reply(stream, status::INVALID),
        Err(e) => return Err(e),
    };

    send_reply(stream, &resume.to_wire())?;
    let received = receive_into(&path, resume, file_size, stream, &mut NoProgress)?;
    if resume != ResumeStatus::Skip {
        ctx.logger
            .transfer(&user.username, Direction::Upload, &path, received);
    }
    Ok(())
}

fn handle_free_size<S: Write>(stream: &mut S, session: &Session, ctx: &ServerContext) -> Result<()> {
    let user = match session.user() {
        Ok(user) => user,
        Err(_) => return send_reply(stream, status::NOT_LOGGED_IN),
    };
    let free = ctx.store.free_size_mb(&user.username)?;
    // Debug keeps the decimal point, so "-4.0" never reads as a refusal
    send_reply(stream, &format!("{:?}", free))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::md5_hex;
    use crate::logger::NoopLogger;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Scripted client bytes in, everything the server wrote out.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn context() -> (TempDir, ServerContext) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let store = CredentialStore::open(root.join("user_info.dat"), &root).unwrap();
        (dir, ServerContext::new(store, Arc::new(NoopLogger)))
    }

    fn script(messages: &[Value], raw_tail: &[u8]) -> Scripted {
        let mut input = Vec::new();
        for m in messages {
            write_envelope(&mut input, m).unwrap();
        }
        input.extend_from_slice(raw_tail);
        Scripted {
            input: Cursor::new(input),
            output: Vec::new(),
        }
    }

    fn run(ctx: &ServerContext, messages: &[Value], raw_tail: &[u8]) -> String {
        let mut stream = script(messages, raw_tail);
        let mut session = Session::new("test-peer");
        run_session(&mut stream, &mut session, ctx).unwrap();
        String::from_utf8(stream.output).unwrap()
    }

    #[test]
    fn unknown_and_malformed_commands_get_bad_request() {
        let (_dir, ctx) = context();
        let out = run(
            &ctx,
            &[json!({"action": "rename"}), json!({"action": "cd"}), json!({"nothing": 1})],
            b"",
        );
        assert_eq!(out, "-3-3-3");
    }

    #[test]
    fn commands_before_login_are_refused() {
        let (_dir, ctx) = context();
        let out = run(
            &ctx,
            &[
                json!({"action": "ls"}),
                json!({"action": "cd", "target_path": "x"}),
                json!({"action": "mk_dir", "dir_name": "x"}),
                json!({"action": "remove", "dir_name": "x"}),
                json!({"action": "get_free_size"}),
                json!({"action": "put", "file_name": "a", "file_size": 1, "md5": "x"}),
            ],
            b"",
        );
        assert_eq!(out, "-4-4-4-4-4-4");
    }

    #[test]
    fn signup_login_and_directory_commands() {
        let (dir, ctx) = context();
        let out = run(
            &ctx,
            &[
                json!({"action": "signup", "username": "alice", "password": "pw1", "size": 100}),
                json!({"action": "login", "username": "alice", "password": "nope"}),
                json!({"action": "login", "username": "alice", "password": "pw1"}),
                json!({"action": "mk_dir", "dir_name": "docs"}),
                json!({"action": "mk_dir", "dir_name": "docs"}),
                json!({"action": "cd", "target_path": "docs"}),
                json!({"action": "cd", "target_path": ".."}),
                json!({"action": "cd", "target_path": ".."}),
                json!({"action": "remove", "dir_name": "docs"}),
                json!({"action": "remove", "dir_name": "docs"}),
                json!({"action": "get_free_size"}),
            ],
            b"",
        );
        assert_eq!(out, "Signup successful!-100-100-10-1100.0");
        assert!(dir.path().join("alice").is_dir());
    }

    #[test]
    fn signup_storage_failure_is_answered() {
        let (dir, ctx) = context();
        // A plain file where the home directory should go
        fs::write(dir.path().join("carol"), b"in the way").unwrap();
        let out = run(
            &ctx,
            &[
                json!({"action": "signup", "username": "carol", "password": "pw", "size": 10}),
                json!({"action": "ls"}),
            ],
            b"",
        );
        assert_eq!(out, "Signup failed!-4");
        assert!(ctx.store.find("carol").unwrap().is_none());
    }

    #[test]
    fn put_writes_payload_into_current_directory() {
        let (dir, ctx) = context();
        ctx.store.signup("alice", "pw1", 100).unwrap();
        let data = b"hello ferry".to_vec();
        let out = run(
            &ctx,
            &[
                json!({"action": "login", "username": "alice", "password": "pw1"}),
                json!({"action": "put", "file_name": "hello.txt", "file_size": data.len(), "md5": md5_hex(&data)}),
            ],
            &data,
        );
        assert_eq!(out, "00");
        assert_eq!(fs::read(dir.path().join("alice/hello.txt")).unwrap(), data);

        // Same file again: skip, and no payload follows
        let out = run(
            &ctx,
            &[
                json!({"action": "login", "username": "alice", "password": "pw1"}),
                json!({"action": "put", "file_name": "hello.txt", "file_size": data.len(), "md5": md5_hex(&data)}),
                json!({"action": "put", "file_name": "../escape.txt", "file_size": 1, "md5": "x"}),
            ],
            b"",
        );
        assert_eq!(out, "0-1-2");
    }

    #[test]
    fn get_of_missing_file_reports_not_a_file() {
        let (_dir, ctx) = context();
        ctx.store.signup("alice", "pw1", 100).unwrap();
        let mut stream = script(
            &[
                json!({"action": "login", "username": "alice", "password": "pw1"}),
                json!({"action": "get", "file_name": "nope.txt"}),
            ],
            b"",
        );
        let mut session = Session::new("test-peer");
        run_session(&mut stream, &mut session, &ctx).unwrap();

        let mut out = Cursor::new(stream.output);
        assert_eq!(read_reply(&mut out, 1).unwrap(), "0");
        let env = read_envelope(&mut out).unwrap().unwrap();
        assert_eq!(env.get("is_file"), Some(&Value::Bool(false)));
        assert_eq!(env.get("file_name").and_then(Value::as_str), Some("nope.txt"));
    }
}
