use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use crossbeam_channel::{unbounded, Receiver, TryRecvError};

use ide_session::model::RunOutcome;
use ide_session::{config, logger, NoticeLevel, Session};

const PUMP_INTERVAL: Duration = Duration::from_millis(30);
const EOF_GRACE: Duration = Duration::from_secs(1);

const USAGE: &str = "usage: ide-session [--config <file>] <username|email> [password]\n\
password may also be given in IDE_SESSION_PASSWORD";

struct Args {
    config: Option<PathBuf>,
    identifier: String,
    password: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => bail!(USAGE),
            _ => positional.push(arg),
        }
    }
    let mut positional = positional.into_iter();
    let identifier = positional.next().ok_or_else(|| anyhow!(USAGE))?;
    let password = match positional.next() {
        Some(p) => p,
        None => std::env::var("IDE_SESSION_PASSWORD").map_err(|_| anyhow!(USAGE))?,
    };
    Ok(Args {
        config,
        identifier,
        password,
    })
}

fn spawn_stdin_reader() -> anyhow::Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("ide-stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning stdin reader")?;
    Ok(rx)
}

fn print_notices(session: &mut Session) -> Option<String> {
    let mut first_error = None;
    for notice in session.drain_notices() {
        let tag = match notice.level {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => "ok",
            NoticeLevel::Error => "error",
        };
        eprintln!("[{tag}] {}", notice.message);
        if notice.level == NoticeLevel::Error && first_error.is_none() {
            first_error = Some(notice.message);
        }
    }
    first_error
}

enum Flow {
    Continue,
    Quit,
}

fn handle_line(session: &mut Session, line: &str, now: Instant) -> Flow {
    let Some(command) = line.strip_prefix(':') else {
        let _ = session.send_terminal_input(line, now);
        return Flow::Continue;
    };
    let (name, arg) = command
        .split_once(' ')
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));
    // Failures are already queued as notices.
    match name {
        "quit" | "q" => return Flow::Quit,
        "tree" => {
            for row in session.tree().visible_rows() {
                let marker = match (row.kind, row.expanded) {
                    (ide_session::model::EntryKind::File, _) => " ",
                    (_, true) => "v",
                    (_, false) => ">",
                };
                println!("{}{marker} {}", "  ".repeat(row.depth), row.name);
            }
        }
        "reload" => {
            let _ = session.reload_tree();
        }
        "toggle" => {
            let _ = session.toggle_dir(arg);
        }
        "open" => {
            let _ = session.open_file(arg);
        }
        "cat" => match session.tabs().active() {
            Some(tab) => println!("{}", tab.buffered_content),
            None => eprintln!("[error] no file is open"),
        },
        "save" => {
            let _ = session.save();
        }
        "run" => {
            let _ = session.run_code();
        }
        "init" => {
            let _ = session.start_init();
        }
        "skip" => {
            let _ = session.skip_init();
        }
        "info" => session.system_info(),
        other => eprintln!("[error] unknown command :{other}"),
    }
    Flow::Continue
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let cfg = match args.config.as_deref() {
        Some(path) => config::try_load_from(path)?,
        None => config::load(),
    };
    if let Err(err) = logger::init(&cfg.resolved_log_path()) {
        eprintln!("[info] logging disabled: {err:#}");
    }
    tracing::info!(server = %cfg.server_url, "starting ide-session");

    let mut session = Session::from_config(cfg)?;
    session.login(&args.identifier, &args.password)?;
    let login_deadline = Instant::now() + session.config().http_timeout();
    while !session.is_authenticated() {
        let now = Instant::now();
        session.pump(now);
        if let Some(err) = print_notices(&mut session) {
            bail!(err);
        }
        if now >= login_deadline {
            bail!("no answer from {}", session.config().server_url);
        }
        thread::sleep(PUMP_INTERVAL);
    }

    let lines = spawn_stdin_reader()?;
    let mut printed = 0usize;
    let mut generation = session.terminal().transcript_generation();
    let mut last_run: Option<RunOutcome> = None;
    let mut stdin_closed_at: Option<Instant> = None;
    let mut stdout = std::io::stdout();
    loop {
        let now = Instant::now();
        session.pump(now);

        let terminal = session.terminal();
        if terminal.transcript_generation() != generation {
            generation = terminal.transcript_generation();
            printed = 0;
        }
        let transcript = terminal.transcript();
        if let Some(tail) = transcript.get(printed..).filter(|t| !t.is_empty()) {
            let _ = stdout.write_all(tail.as_bytes());
            let _ = stdout.flush();
            printed = transcript.len();
        }
        if session.last_run() != last_run.as_ref() {
            last_run = session.last_run().cloned();
            if let Some(outcome) = last_run.as_ref() {
                println!("{}", outcome.render());
            }
        }
        print_notices(&mut session);

        match lines.try_recv() {
            Ok(line) => {
                if let Flow::Quit = handle_line(&mut session, &line, now) {
                    break;
                }
            }
            Err(TryRecvError::Disconnected) => {
                let closed = *stdin_closed_at.get_or_insert(now);
                if now.saturating_duration_since(closed) >= EOF_GRACE {
                    break;
                }
            }
            Err(TryRecvError::Empty) => {}
        }
        thread::sleep(PUMP_INTERVAL);
    }

    session.logout();
    print_notices(&mut session);
    Ok(())
}
