use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::ServerConfig;
use crate::plugins::Executor;
use crate::proto::{Dispatcher, Flow};

/// Cadence at which an idle socket is re-checked for timeout. Also the pause
/// after a half-closed peer, so the accept loop cannot spin.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why the active session ended. Socket mode re-accepts after every variant;
/// the reason only changes what gets logged.
#[derive(Debug)]
enum SessionEnd {
    Quit,
    IdleTimeout,
    Eof,
    Write(io::Error),
    Read(io::Error),
}

/// One accepted client connection. Owned by the serve loop from accept to
/// shutdown; dropped (channels closed) on disconnect, timeout or quit.
struct Session {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    last_activity: Instant,
}

impl Session {
    fn open(stream: TcpStream) -> io::Result<Session> {
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Session { stream, reader, last_activity: Instant::now() })
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Serve the process's own stdin/stdout: exactly one session for the
/// lifetime of the process, terminated by end-of-stream or `quit`.
pub fn run_stream<E: Executor>(config: &ServerConfig, executor: E) -> io::Result<()> {
    info!("stdin handler opened");
    serve_lines(config, executor, io::stdin().lock(), io::stdout().lock())
}

/// Banner-then-dispatch loop over an arbitrary channel pair.
pub fn serve_lines<E: Executor>(
    config: &ServerConfig,
    executor: E,
    mut input: impl BufRead,
    mut output: impl Write,
) -> io::Result<()> {
    let dispatcher = Dispatcher::new(config, executor);
    dispatcher.banner(&mut output)?;
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            info!("end of input, shutting down");
            return Ok(());
        }
        if dispatcher.handle_line(&line, &mut output)? == Flow::Quit {
            info!("client requested session end");
            return Ok(());
        }
    }
}

/// Serve one client at a time on an already-bound listening socket. The
/// listener is never closed; whenever the active session ends the loop logs
/// the reason and re-accepts on the same socket.
pub fn run_socket<E: Executor>(
    listener: TcpListener,
    config: &ServerConfig,
    executor: E,
) -> io::Result<()> {
    let dispatcher = Dispatcher::new(config, executor);
    let local = listener.local_addr()?;
    info!("listening on {local}");
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        info!("accepted incoming connection from {peer}");
        match serve_session(&dispatcher, stream, config.idle_timeout) {
            SessionEnd::Quit => info!("client requested session end, closing connection"),
            SessionEnd::IdleTimeout => info!("session timeout, closing connection"),
            SessionEnd::Eof => info!("client disconnected"),
            SessionEnd::Write(err) => warn!("write error, reinitialising: {err}"),
            SessionEnd::Read(err) => warn!("socket error, reinitialising: {err}"),
        }
        info!("listening on {local}");
    }
}

/// Run the read-dispatch-write loop for one session. Returns the reason the
/// session ended; the connection has been shut down and closed on return.
fn serve_session<E: Executor>(
    dispatcher: &Dispatcher<E>,
    stream: TcpStream,
    idle_timeout: Duration,
) -> SessionEnd {
    let mut session = match Session::open(stream) {
        Ok(session) => session,
        Err(err) => return SessionEnd::Read(err),
    };
    let mut writer = match session.stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => return SessionEnd::Read(err),
    };
    if let Err(err) = dispatcher.banner(&mut writer) {
        return SessionEnd::Write(err);
    }

    let mut line = String::new();
    let end = loop {
        match session.reader.read_line(&mut line) {
            Ok(0) => {
                // Half-closed peer; pause briefly before handing control
                // back to the accept loop.
                thread::sleep(POLL_INTERVAL);
                break SessionEnd::Eof;
            }
            Ok(_) => {
                session.touch();
                match dispatcher.handle_line(&line, &mut writer) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break SessionEnd::Quit,
                    Err(err) => break SessionEnd::Write(err),
                }
                line.clear();
            }
            Err(err) if is_timeout(&err) => {
                // Keep any partial line already buffered; only complete
                // lines reset the activity clock.
                if session.idle_for() >= idle_timeout {
                    break SessionEnd::IdleTimeout;
                }
            }
            Err(err) => break SessionEnd::Read(err),
        }
    };
    let _ = writer.flush();
    let _ = session.stream.shutdown(Shutdown::Both);
    end
}

/// A read timeout surfaces as WouldBlock or TimedOut depending on platform.
fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
