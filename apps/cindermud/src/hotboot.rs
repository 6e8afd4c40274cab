//! Hot restart. The process re-execs itself while client sockets stay
//! open: session metadata and raw fds go into a JSON file, the listener
//! fd is passed on the command line, and the new process re-adopts
//! everything before the clients notice more than a hiccup.

use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::config::Config;
use crate::server::Server;
use crate::session::ConnState;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HotbootSession {
    pub fd: RawFd,
    pub name: String,
    pub host: String,
    pub color: bool,
    pub gmcp: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HotbootFile {
    pub sessions: Vec<HotbootSession>,
}

/// Strip FD_CLOEXEC so the descriptor survives the exec.
fn clear_cloexec(fd: RawFd) -> anyhow::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        bail!("F_GETFD on fd {fd}: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        bail!("F_SETFD on fd {fd}: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn save(path: &Path, file: &HotbootFile) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("tmp");
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Read and remove the state file, so a crash during recovery cannot
/// loop on stale fds.
fn load(path: &Path) -> anyhow::Result<HotbootFile> {
    let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    fs::remove_file(path).ok();
    serde_json::from_str(&json).context("parsing hotboot state")
}

/// Tear the server apart and exec a fresh copy of ourselves. Only
/// returns on failure.
pub fn perform(mut srv: Server) -> anyhow::Result<()> {
    let mut file = HotbootFile {
        sessions: Vec::new(),
    };
    let sessions = std::mem::take(&mut srv.sessions);
    for (_, mut s) in sessions {
        let in_game = matches!(s.state, ConnState::Playing | ConnState::EditingText);
        let name = s
            .char_id
            .and_then(|cid| srv.world.char(cid))
            .map(|c| c.name.clone());
        match (in_game, name) {
            (true, Some(name)) => {
                s.tx.extend_from_slice(b"\r\nThe world shivers around you. Hold on...\r\n");
                let _ = s.try_flush_tx();
                let std_stream = match s.stream.into_std() {
                    Ok(st) => st,
                    Err(e) => {
                        warn!(error = %e, "dropping session, could not detach socket");
                        continue;
                    }
                };
                if let Err(e) = clear_cloexec(std_stream.as_raw_fd()) {
                    warn!(error = %e, "dropping session, could not keep fd open");
                    continue;
                }
                file.sessions.push(HotbootSession {
                    fd: std_stream.into_raw_fd(),
                    name,
                    host: s.host.clone(),
                    color: s.color,
                    gmcp: s.gmcp,
                });
            }
            _ => {
                s.tx.extend_from_slice(
                    b"\r\nThe server is restarting; please reconnect in a moment.\r\n",
                );
                let _ = s.try_flush_tx();
            }
        }
    }
    save(&srv.cfg.hotboot_path(), &file)?;
    let std_listener = srv.listener.into_std().context("detaching listener")?;
    clear_cloexec(std_listener.as_raw_fd())?;
    let listener_fd = std_listener.into_raw_fd();
    let exe = std::env::current_exe().context("finding our own executable")?;
    let mut cmd = Command::new(exe);
    if srv.cfg.mini {
        cmd.arg("-m");
    }
    if srv.cfg.no_specials {
        cmd.arg("-s");
    }
    if srv.cfg.restrict {
        cmd.arg("-r");
    }
    cmd.args(["-d", &srv.cfg.data_dir]);
    cmd.args(["-H", &listener_fd.to_string()]);
    cmd.arg(srv.cfg.port.to_string());
    info!(sessions = file.sessions.len(), listener_fd, "executing hot restart");
    let err = cmd.exec();
    bail!("exec failed: {err}");
}

/// The other side: adopt the inherited listener and client sockets in a
/// freshly started process.
pub fn recover(
    listener_fd: RawFd,
    cfg: &Config,
) -> anyhow::Result<(TcpListener, Vec<(TcpStream, HotbootSession)>)> {
    let file = load(&cfg.hotboot_path())?;
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(listener_fd) };
    std_listener
        .set_nonblocking(true)
        .context("listener nonblocking")?;
    let listener = TcpListener::from_std(std_listener).context("adopting listener")?;
    let mut clients = Vec::with_capacity(file.sessions.len());
    for meta in file.sessions {
        let mut std_stream = unsafe { std::net::TcpStream::from_raw_fd(meta.fd) };
        if std_stream.set_nonblocking(true).is_err() {
            warn!(name = %meta.name, "stale client fd dropped during recovery");
            continue;
        }
        // Probe write: a dead peer surfaces here instead of in the loop.
        use std::io::Write;
        if let Err(e) = std_stream.write_all(b"\r\n") {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                warn!(name = %meta.name, error = %e, "client gone, fd dropped during recovery");
                continue;
            }
        }
        match TcpStream::from_std(std_stream) {
            Ok(stream) => clients.push((stream, meta)),
            Err(e) => warn!(name = %meta.name, error = %e, "client fd rejected during recovery"),
        }
    }
    info!(sessions = clients.len(), "hot restart recovery complete");
    Ok((listener, clients))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HotbootFile {
        HotbootFile {
            sessions: vec![
                HotbootSession {
                    fd: 7,
                    name: "Testa".into(),
                    host: "203.0.113.9".into(),
                    color: true,
                    gmcp: false,
                },
                HotbootSession {
                    fd: 9,
                    name: "Vesta".into(),
                    host: "203.0.113.10".into(),
                    color: false,
                    gmcp: true,
                },
            ],
        }
    }

    #[test]
    fn state_file_round_trips() {
        let json = serde_json::to_string(&sample()).unwrap();
        let back: HotbootFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn save_then_load_removes_the_file() {
        let path = std::env::temp_dir().join(format!("hotboot-test-{}.json", std::process::id()));
        save(&path, &sample()).unwrap();
        let back = load(&path).unwrap();
        assert_eq!(back, sample());
        assert!(!path.exists());
        assert!(load(&path).is_err());
    }
}
