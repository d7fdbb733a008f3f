//! Host-side uploader
//!
//! Packs a project directory, sends its config and archive to the receiver,
//! retries the whole exchange with exponential backoff and optionally starts
//! the project once the upload is verified.

use crate::archive;
use crate::journal::Journal;
use crate::project::ProjectConfig;
use crate::protocol::{Reply, Request, TransferError, ARCHIVE_NAME, CHUNK_SIZE};
use crate::serial::Link;
use crate::settings::SenderSettings;
use crate::storage::format_size;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// A packed project, ready to send
#[derive(Debug, Clone)]
pub struct Upload {
    pub project_dir: PathBuf,
    pub config: ProjectConfig,
    pub archive_path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub members: usize,
}

impl Upload {
    /// Load the project config and build the archive inside the project
    pub fn prepare(project_dir: &Path, journal: &mut Journal) -> Result<Self> {
        if !project_dir.is_dir() {
            anyhow::bail!("Folder '{}' is not valid", project_dir.display());
        }
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", project_dir.display()))?;

        let config = ProjectConfig::load(&project_dir)?;
        let archive_path = project_dir.join(ARCHIVE_NAME);

        journal.record("Creating compressed archive (tar.gz) according to config...");
        let members = archive::build(&project_dir, &archive_path, &config)?;
        let sha256 = archive::sha256_file(&archive_path)?;
        let size = fs::metadata(&archive_path)
            .with_context(|| format!("Failed to stat {}", archive_path.display()))?
            .len();

        journal.record(format!(
            "Archive created: {} ({} bytes, {} files) sha256={}",
            archive_path.display(),
            size,
            members,
            sha256
        ));

        Ok(Self {
            project_dir,
            config,
            archive_path,
            size,
            sha256,
            members,
        })
    }

    /// Name announced in the `UPLOAD` header
    pub fn name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ARCHIVE_NAME.to_string())
    }
}

pub struct Uploader {
    settings: SenderSettings,
    journal: Journal,
    /// Send `RUN` after a verified upload
    run_after_upload: bool,
}

impl Uploader {
    pub fn new(settings: SenderSettings, journal: Journal) -> Self {
        Self {
            settings,
            journal,
            run_after_upload: true,
        }
    }

    pub fn with_run(mut self, run: bool) -> Self {
        self.run_after_upload = run;
        self
    }

    pub fn journal(&mut self) -> &mut Journal {
        &mut self.journal
    }

    /// Try the upload up to `max_retries` times, reopening the link through
    /// `connect` for every attempt
    pub fn send_with_retries<P, F>(&mut self, upload: &Upload, mut connect: F) -> Result<()>
    where
        P: Read + Write,
        F: FnMut(&ProjectConfig) -> Result<Link<P>>,
    {
        let max = self.settings.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            self.journal.record(format!("Attempt {} of {}", attempt, max));

            let outcome = connect(&upload.config).and_then(|mut link| {
                self.send_once(&mut link, upload)
                    .map_err(anyhow::Error::from)
            });

            match outcome {
                Ok(()) => {
                    self.journal.record("Upload succeeded.");
                    return Ok(());
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    self.journal
                        .warn(format!("Upload failed (reason={}). Will retry.", last_error));
                }
            }

            if attempt < max {
                let delay = self.settings.retry_delay(attempt);
                self.journal
                    .record(format!("Sleeping {:.1}s before retry.", delay.as_secs_f64()));
                thread::sleep(delay);
            }
        }

        self.journal.warn("Exceeded maximum retries. Giving up.");
        anyhow::bail!("upload failed after {} attempts: {}", max, last_error)
    }

    /// One complete exchange: config, archive, and optionally `RUN`
    pub fn send_once<P: Read + Write>(
        &mut self,
        link: &mut Link<P>,
        upload: &Upload,
    ) -> Result<(), TransferError> {
        let config_bytes = upload
            .config
            .to_vec()
            .map_err(|e| TransferError::Io(e.into()))?;

        self.journal
            .record(format!("Sending CONFIG ({} bytes)", config_bytes.len()));
        link.write_line(&Request::Config { size: config_bytes.len() }.to_string())?;
        link.write_all(&config_bytes)?;
        link.flush()?;
        self.await_reply(link, "CONFIG", &Reply::OkConfig)?;

        let header = Request::Upload {
            size: upload.size,
            sha256: upload.sha256.clone(),
            name: upload.name(),
        };
        self.journal.record("Sending UPLOAD header.");
        link.write_line(&header.to_string())?;
        self.await_reply(link, "UPLOAD", &Reply::Ok)?;

        self.journal.record(format!(
            "Sending file bytes ({})...",
            format_size(upload.size)
        ));
        let sent = self.stream_archive(link, &upload.archive_path)?;
        self.journal.record(format!(
            "Finished sending {} bytes. Waiting for DONE or ERR_CHECKSUM...",
            sent
        ));
        self.await_reply(link, "DONE", &Reply::Done)?;

        if self.run_after_upload {
            self.journal.record("Upload successful, sending RUN command...");
            match link.write_line(&Request::Run.to_string()) {
                Ok(()) => {
                    self.journal.record("RUN command sent.");
                    self.watch_run(link);
                }
                Err(e) => self.journal.warn(format!("Failed to send RUN: {}", e)),
            }
        }

        Ok(())
    }

    fn stream_archive<P: Read + Write>(
        &mut self,
        link: &mut Link<P>,
        archive_path: &Path,
    ) -> Result<u64, TransferError> {
        let mut file = File::open(archive_path)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            link.write_all(&buffer[..n])?;
            sent += n as u64;
        }
        link.flush()?;

        Ok(sent)
    }

    /// Read replies until `expected` arrives.
    ///
    /// Fails on any error reply or when the receiver stays silent for
    /// longer than the reply timeout. Progress reports reset the timeout.
    fn await_reply<P: Read + Write>(
        &mut self,
        link: &mut Link<P>,
        stage: &'static str,
        expected: &Reply,
    ) -> Result<(), TransferError> {
        let timeout = self.settings.reply_timeout();
        let mut deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match link.read_line_within(remaining)? {
                Some(line) => line,
                None => {
                    self.journal
                        .warn(format!("Timeout waiting for {} reply from Pi.", stage));
                    return Err(TransferError::Timeout(stage));
                }
            };

            self.journal.record(format!("-> Pi: {}", line));
            let reply = Reply::parse(&line);

            if reply == *expected {
                return Ok(());
            }

            match reply {
                Reply::ErrChecksum(actual) => return Err(TransferError::Checksum(actual)),
                reply if reply.is_error() => {
                    self.journal
                        .warn(format!("Pi returned error for {}: {}", stage, reply));
                    return Err(TransferError::Rejected {
                        stage,
                        reply: reply.to_string(),
                    });
                }
                Reply::Progress(_) => deadline = Instant::now() + timeout,
                _ => {}
            }
        }
    }

    /// Echo receiver output after `RUN` until the process exits or the run
    /// window closes
    fn watch_run<P: Read + Write>(&mut self, link: &mut Link<P>) {
        let window = self.settings.run_window();
        let started = Instant::now();

        while started.elapsed() < window {
            let remaining = window.saturating_sub(started.elapsed());
            let line = match link.read_line_within(remaining.min(Duration::from_millis(250))) {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    self.journal.warn(format!("Lost link while watching run: {}", e));
                    return;
                }
            };

            self.journal.record(format!("-> Pi (run): {}", line));
            match Reply::parse(&line) {
                Reply::Exit(_)
                | Reply::ErrRun(_)
                | Reply::ErrStream(_)
                | Reply::ErrNoConfig => return,
                _ => {}
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::receiver::Receiver;
    use crate::settings::ReceiverSettings;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn quick_settings() -> SenderSettings {
        SenderSettings {
            max_retries: 3,
            retry_base_delay_ms: 1,
            reply_timeout_secs: 2,
            run_window_secs: 5,
            ..SenderSettings::default()
        }
    }

    fn project(config: &str, files: &[(&str, &[u8])]) -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.json"), config).unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    /// Receiver running on one end of a socket pair
    fn spawn_receiver(app_dir: &Path) -> (Link<UnixStream>, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        theirs.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let settings = ReceiverSettings {
            app_dir: app_dir.to_string_lossy().to_string(),
            payload_idle_timeout_secs: 1,
            error_backoff_ms: 10,
            ..ReceiverSettings::default()
        };
        let journal = Journal::open(settings.log_path());
        let mut receiver = Receiver::new(Link::new(theirs), settings, journal);
        let running = receiver.running_flag();
        let worker = thread::spawn(move || receiver.serve().unwrap());

        (Link::new(ours), running, worker)
    }

    #[test]
    fn test_prepare_builds_archive() {
        let dir = project(r#"{"exclude": ["*.log"]}"#, &[("main.py", b"print(1)\n"), ("debug.log", b"x")]);
        let mut journal = Journal::disabled();
        let upload = Upload::prepare(dir.path(), &mut journal).unwrap();

        assert_eq!(upload.members, 2);
        assert_eq!(upload.name(), ARCHIVE_NAME);
        assert_eq!(upload.size, fs::metadata(&upload.archive_path).unwrap().len());
        assert_eq!(upload.sha256, archive::sha256_file(&upload.archive_path).unwrap());
    }

    #[test]
    fn test_prepare_rejects_missing_folder() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::disabled();
        let err = Upload::prepare(&dir.path().join("nope"), &mut journal).unwrap_err();
        assert!(err.to_string().contains("is not valid"));
    }

    #[test]
    fn test_end_to_end_upload_and_run() {
        let app = tempdir().unwrap();
        let deploy = app.path().join("robot");
        let config = format!(
            r#"{{"directory": "{}", "main": "main.sh", "runner": ["sh"], "args": ["fast"]}}"#,
            deploy.display()
        );
        let blob: Vec<u8> = (0..300_000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let dir = project(&config, &[("main.sh", b"echo started $1\n"), ("assets/blob.bin", &blob)]);

        let log_dir = tempdir().unwrap();
        let send_log = log_dir.path().join("send_log.txt");
        let mut uploader = Uploader::new(quick_settings(), Journal::open(&send_log));
        let upload = Upload::prepare(dir.path(), uploader.journal()).unwrap();

        let (link, running, worker) = spawn_receiver(app.path());
        let mut link = Some(link);
        uploader
            .send_with_retries(&upload, |_| link.take().context("link already used"))
            .unwrap();

        running.store(false, Ordering::SeqCst);
        worker.join().unwrap();

        assert_eq!(fs::read(deploy.join("assets/blob.bin")).unwrap(), blob);
        assert_eq!(
            fs::read(app.path().join(ARCHIVE_NAME)).unwrap(),
            fs::read(&upload.archive_path).unwrap()
        );

        let sent = fs::read_to_string(&send_log).unwrap();
        assert!(sent.contains("-> Pi: OK_CONFIG"));
        assert!(sent.contains("-> Pi: DONE"));
        assert!(sent.contains("-> Pi (run): started fast"));
        assert!(sent.contains("-> Pi (run): EXIT 0"));

        let received = fs::read_to_string(app.path().join("upload.log")).unwrap();
        assert!(received.contains(&format!("Received {} bytes", upload.size)));
    }

    #[test]
    fn test_retries_then_gives_up() {
        let dir = project("{}", &[("main.py", b"")]);
        let mut uploader = Uploader::new(quick_settings(), Journal::disabled());
        let upload = Upload::prepare(dir.path(), uploader.journal()).unwrap();

        let mut attempts = 0;
        let err = uploader
            .send_with_retries::<UnixStream, _>(&upload, |_| {
                attempts += 1;
                anyhow::bail!("port busy")
            })
            .unwrap_err();

        assert_eq!(attempts, 3);
        assert!(err.to_string().contains("port busy"));
    }

    /// Peer that accepts the config, swallows the archive and answers the
    /// upload with `verdict`
    fn verdict_peer(stream: UnixStream, verdict: &'static str) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap() == 0 {
                    return;
                }
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.first().copied() {
                    Some("CONFIG") => {
                        let mut json = vec![0u8; fields[1].parse().unwrap()];
                        reader.read_exact(&mut json).unwrap();
                        writer.write_all(b"OK_CONFIG\n").unwrap();
                    }
                    Some("UPLOAD") => {
                        writer.write_all(b"OK\n").unwrap();
                        let mut archive = vec![0u8; fields[1].parse().unwrap()];
                        reader.read_exact(&mut archive).unwrap();
                        writer.write_all(format!("{}\n", verdict).as_bytes()).unwrap();
                        return;
                    }
                    _ => {}
                }
            }
        })
    }

    #[test]
    fn test_checksum_mismatch_retried() {
        let dir = project("{}", &[("main.py", b"print(5)\n")]);
        let log_dir = tempdir().unwrap();
        let send_log = log_dir.path().join("send_log.txt");
        let mut uploader =
            Uploader::new(quick_settings(), Journal::open(&send_log)).with_run(false);
        let upload = Upload::prepare(dir.path(), uploader.journal()).unwrap();

        let mut peers = Vec::new();
        let mut links = Vec::new();
        for verdict in ["ERR_CHECKSUM 00ff", "DONE"] {
            let (ours, theirs) = UnixStream::pair().unwrap();
            ours.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
            peers.push(verdict_peer(theirs, verdict));
            links.push(Link::new(ours));
        }
        let mut links = links.into_iter();

        uploader
            .send_with_retries(&upload, |_| links.next().context("no link left"))
            .unwrap();
        for peer in peers {
            peer.join().unwrap();
        }

        let log = fs::read_to_string(&send_log).unwrap();
        assert!(log.contains("-> Pi: ERR_CHECKSUM 00ff"));
        assert!(log.contains("Upload failed (reason=checksum mismatch"));
        assert!(log.contains("Attempt 2 of 3"));
        assert!(!log.contains("Attempt 3 of 3"));
        assert!(log.contains("Upload succeeded."));
    }

    #[test]
    fn test_rejected_config_fails_attempt() {
        let dir = project("{}", &[("main.py", b"")]);
        let mut uploader = Uploader::new(quick_settings(), Journal::disabled()).with_run(false);
        let upload = Upload::prepare(dir.path(), uploader.journal()).unwrap();

        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut peer = theirs;
        let responder = thread::spawn(move || {
            let mut header = Vec::new();
            let mut byte = [0u8; 1];
            while peer.read(&mut byte).unwrap() == 1 && byte[0] != b'\n' {
                header.push(byte[0]);
            }
            peer.write_all(b"ERR_CONFIG_PARSE\n").unwrap();
            String::from_utf8(header).unwrap()
        });

        let mut link = Link::new(ours);
        let err = uploader.send_once(&mut link, &upload).unwrap_err();
        assert!(matches!(err, TransferError::Rejected { stage: "CONFIG", .. }));
        assert!(responder.join().unwrap().starts_with("CONFIG "));
    }

    #[test]
    fn test_silent_receiver_times_out() {
        let dir = project("{}", &[("main.py", b"")]);
        let mut settings = quick_settings();
        settings.reply_timeout_secs = 1;
        let mut uploader = Uploader::new(settings, Journal::disabled());
        let upload = Upload::prepare(dir.path(), uploader.journal()).unwrap();

        let (ours, _theirs) = UnixStream::pair().unwrap();
        ours.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let err = uploader.send_once(&mut Link::new(ours), &upload).unwrap_err();
        assert!(matches!(err, TransferError::Timeout("CONFIG")));
    }
}
