//! Pi-side receiver
//!
//! Waits for requests on the gadget serial port, stores and verifies
//! uploads, extracts them into the configured deploy directory and runs the
//! project on request, relaying its output back over the link.

use crate::archive;
use crate::journal::Journal;
use crate::project::ProjectConfig;
use crate::protocol::{HeaderError, Reply, Request};
use crate::serial::Link;
use crate::settings::ReceiverSettings;
use crate::storage::{format_size, free_space};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Pause between polls when no request is pending
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Receiver<P> {
    link: Link<P>,
    settings: ReceiverSettings,
    journal: Journal,
    /// Last config received; required before `UPLOAD` and `RUN`
    config: Option<ProjectConfig>,
    running: Arc<AtomicBool>,
}

impl<P: Read + Write> Receiver<P> {
    pub fn new(link: Link<P>, settings: ReceiverSettings, journal: Journal) -> Self {
        Self {
            link,
            settings,
            journal,
            config: None,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag that stops [`Receiver::serve`] when cleared
    #[cfg(test)]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Handle requests until the running flag is cleared
    pub fn serve(&mut self) -> Result<()> {
        let app_dir = self.settings.app_dir();
        fs::create_dir_all(&app_dir)
            .with_context(|| format!("Failed to create app directory: {}", app_dir.display()))?;

        self.journal.record(format!(
            "Starting receiver on {} @ {}",
            self.settings.port, self.settings.baud
        ));
        self.journal.record("Ready.");

        while self.running.load(Ordering::SeqCst) {
            match self.poll() {
                Ok(true) => {}
                Ok(false) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    self.journal.warn(format!("Exception: {:#}", e));
                    thread::sleep(self.settings.error_backoff());
                }
            }
        }

        Ok(())
    }

    /// Handle at most one request; returns whether a line was read
    pub fn poll(&mut self) -> Result<bool> {
        let line = match self.link.read_line()? {
            Some(line) if !line.is_empty() => line,
            Some(_) => return Ok(true),
            None => return Ok(false),
        };

        match Request::parse(&line) {
            Ok(Request::Config { size }) => self.handle_config(size)?,
            Ok(Request::Upload { size, sha256, name }) => {
                self.handle_upload(size, &sha256, &name)?
            }
            Ok(Request::Run) => self.handle_run()?,
            Ok(Request::Unknown(line)) => {
                self.journal.record(format!("Ignoring unknown command: {}", line));
            }
            Err(HeaderError::Upload(_)) if self.config.is_none() => {
                self.send(&Reply::ErrNoConfig)?;
                self.journal.warn("UPLOAD received but no config present.");
            }
            Err(e) => {
                self.send(&e.reply())?;
                self.journal.warn(e.to_string());
            }
        }

        Ok(true)
    }

    fn send(&mut self, reply: &Reply) -> Result<()> {
        self.link
            .write_line(&reply.to_string())
            .with_context(|| format!("Failed to send {}", reply))
    }

    fn handle_config(&mut self, size: usize) -> Result<()> {
        if size > self.settings.max_config_size {
            self.send(&Reply::ErrConfigHeader)?;
            self.journal.warn(format!(
                "CONFIG of {} bytes refused, limit is {}",
                size, self.settings.max_config_size
            ));
            return Ok(());
        }

        let raw = self
            .link
            .read_exact_within(size, self.settings.payload_idle_timeout())
            .with_context(|| format!("Failed to read {} config bytes", size))?;

        match ProjectConfig::from_slice(&raw) {
            Ok(config) => {
                self.send(&Reply::OkConfig)?;
                self.journal.record(format!(
                    "Config received: {}",
                    String::from_utf8_lossy(&raw)
                ));
                self.config = Some(config);
            }
            Err(e) => {
                self.journal.warn(format!("Failed to parse config.json: {}", e));
                self.send(&Reply::ErrConfigParse)?;
                self.journal.warn("Failed to parse config; ignoring.");
            }
        }

        Ok(())
    }

    fn handle_upload(&mut self, size: u64, expected: &str, name: &str) -> Result<()> {
        let config = match self.config.clone() {
            Some(config) => config,
            None => {
                self.send(&Reply::ErrNoConfig)?;
                self.journal.warn("UPLOAD received but no config present.");
                return Ok(());
            }
        };

        let app_dir = self.settings.app_dir();
        let deploy_dir = config.deploy_dir(&app_dir);
        if let Some(parent) = deploy_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let needed = size.saturating_add(self.settings.reserved_space);
        if let Some(free) = free_space(&app_dir).filter(|&free| free < needed) {
            self.send(&Reply::ErrNoSpace(free))?;
            self.journal.warn(format!(
                "UPLOAD of {} refused, only {} free in {}",
                format_size(size),
                format_size(free),
                app_dir.display()
            ));
            return Ok(());
        }

        self.journal.record(format!(
            "UPLOAD requested: name={} size={} sha256={} deploy_to={}",
            name,
            size,
            expected,
            deploy_dir.display()
        ));
        self.send(&Reply::Ok)?;

        let partial = self.settings.partial_path();
        let (got, actual) = match self.receive_archive(size, &partial) {
            Ok(received) => received,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e.context("Upload aborted"));
            }
        };
        self.journal
            .record(format!("Received {} bytes, computed sha256={}", got, actual));

        if !actual.eq_ignore_ascii_case(expected) {
            let _ = fs::remove_file(&partial);
            self.send(&Reply::ErrChecksum(actual))?;
            self.journal.warn("Checksum mismatch. Waiting for possible retry.");
            return Ok(());
        }

        let archive_path = self.settings.archive_path();
        fs::rename(&partial, &archive_path)
            .with_context(|| format!("Failed to store {}", archive_path.display()))?;
        self.send(&Reply::Done)?;

        let keep = [
            archive_path.clone(),
            partial,
            self.settings.log_path(),
        ];
        match archive::extract_to(&archive_path, &deploy_dir, &keep) {
            Ok(()) => self
                .journal
                .record(format!("Extraction succeeded into {}.", deploy_dir.display())),
            Err(e) => self.journal.warn(format!("Extraction failed: {}", e)),
        }

        Ok(())
    }

    /// Stream `size` payload bytes into `partial`, hashing and reporting
    /// progress; returns the byte count and the hex digest
    fn receive_archive(&mut self, size: u64, partial: &Path) -> Result<(u64, String)> {
        let mut out = File::create(partial)
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.settings.chunk_size.max(1)];
        let idle = self.settings.payload_idle_timeout();
        let interval = self.settings.progress_interval.max(1);

        let mut got = 0u64;
        let mut last_progress = 0u64;
        while got < size {
            let want = (size - got).min(buffer.len() as u64) as usize;
            let n = self
                .link
                .read_chunk(&mut buffer[..want], idle)
                .with_context(|| format!("Transfer stalled after {} of {} bytes", got, size))?;

            out.write_all(&buffer[..n])
                .with_context(|| format!("Failed to write {}", partial.display()))?;
            hasher.update(&buffer[..n]);
            got += n as u64;

            if got - last_progress >= interval {
                last_progress = got;
                self.journal.record(format!("Progress: {} bytes", got));
                if let Err(e) = self.send(&Reply::Progress(got)) {
                    log::debug!("{:#}", e);
                }
            }
        }

        out.sync_all()
            .with_context(|| format!("Failed to sync {}", partial.display()))?;

        Ok((got, hex::encode(hasher.finalize())))
    }

    fn handle_run(&mut self) -> Result<()> {
        let config = match self.config.clone() {
            Some(config) => config,
            None => {
                self.send(&Reply::ErrNoConfig)?;
                self.journal.warn("RUN received but no config present.");
                return Ok(());
            }
        };

        self.journal
            .record("RUN command received; starting application.");

        let deploy_dir = config.deploy_dir(&self.settings.app_dir());
        let main_path = deploy_dir.join(&config.main);
        if !main_path.exists() {
            let msg = format!("main not found: {}", main_path.display());
            self.journal.warn(&msg);
            self.send(&Reply::ErrRun(msg))?;
            return Ok(());
        }

        let mut command = config.launch_command(&main_path);
        command
            .current_dir(&deploy_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let argv: Vec<String> = std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        self.journal
            .record(format!("Starting process: {}", argv.join(" ")));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.journal.warn(format!("Failed to start process: {}", e));
                self.send(&Reply::ErrRun(e.to_string()))?;
                return Ok(());
            }
        };

        self.send(&Reply::Running)?;

        match self.relay_output(&mut child) {
            Ok(status) => {
                let code = exit_code(status);
                self.journal
                    .record(format!("Process exited with code {}", code));
                self.send(&Reply::Exit(code))?;
            }
            Err(e) => {
                self.journal
                    .warn(format!("Exception while streaming process output: {:#}", e));
                let _ = child.kill();
                let _ = child.wait();
                self.send(&Reply::ErrStream(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// Forward the child's stdout and stderr lines over the link until both
    /// close, then wait for it
    fn relay_output(&mut self, child: &mut Child) -> Result<ExitStatus> {
        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        for line in rx {
            self.journal.record(format!("APP: {}", line));
            if let Err(e) = self.link.write_line(&line) {
                log::debug!("Dropped application output: {}", e);
            }
        }

        for reader in readers {
            let _ = reader.join();
        }

        child.wait().with_context(|| "Failed to wait for application")
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: R,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if tx.send(line.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Exit code as a shell reports it; signals map to their negated number
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}
