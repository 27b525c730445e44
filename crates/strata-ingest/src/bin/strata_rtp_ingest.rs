//! # Strata RTP Ingest
//!
//! Standalone RTP push receiver. Accepts PS- or TS-over-RTP datagrams on
//! one UDP port, runs one ingest session per SSRC, and writes the recovered
//! elementary streams to a directory (or discards them).
//!
//! ## Usage
//!
//! ```bash
//! # Monitor mode (log stats, discard frames)
//! strata-rtp-ingest --bind 0.0.0.0:10000
//!
//! # Write <stream>.h264 / <stream>.aac / ... per session
//! strata-rtp-ingest --bind 0.0.0.0:10000 --output-dir ./capture
//!
//! # Config file and Prometheus metrics
//! strata-rtp-ingest --config ingest.toml --metrics-port 9090
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use strata_ingest::codec::Codec;
use strata_ingest::config::IngestConfig;
use strata_ingest::metrics::render_prometheus;
use strata_ingest::process::Collaborators;
use strata_ingest::publish::{ChannelPublisherFactory, PublishEvent};
use strata_ingest::sessions::SessionTable;
use strata_ingest::stats::SessionSnapshot;

const DEFAULT_BIND: &str = "0.0.0.0:10000";
const MAX_DATAGRAM: usize = 65_536;

type SharedSnapshots = Arc<Mutex<Vec<SessionSnapshot>>>;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default(),
    };

    tracing::info!(
        bind = %args.bind,
        config = ?args.config,
        output_dir = ?args.output_dir,
        metrics_port = ?args.metrics_port,
        check_source = config.rtp_proxy.check_source,
        timeout_ms = config.rtp_proxy.timeout.as_millis() as u64,
        "strata-rtp-ingest starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::handle(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        });
    }

    // ── Frame sink ──────────────────────────────────────────────
    let (factory, events) = ChannelPublisherFactory::new();
    let output_dir = args.output_dir.clone();
    let sink = std::thread::Builder::new()
        .name("frame-sink".into())
        .spawn(move || run_frame_sink(events, output_dir))?;

    // ── Sessions ────────────────────────────────────────────────
    let timeout = config.rtp_proxy.timeout;
    let collab = Collaborators::new(Arc::new(factory));
    let mut table = SessionTable::new(Arc::new(config), collab);

    let socket = UdpSocket::bind(args.bind)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    tracing::info!(addr = %args.bind, "RTP socket bound");

    // ── Metrics server (optional) ───────────────────────────────
    let snapshots: SharedSnapshots = Arc::new(Mutex::new(Vec::new()));
    if let Some(port) = args.metrics_port {
        let snapshots = snapshots.clone();
        std::thread::Builder::new()
            .name("metrics".into())
            .spawn(move || {
                if let Err(e) = run_metrics_server(port, snapshots) {
                    tracing::error!(error = %e, "metrics server failed");
                }
            })?;
    }

    // ── Main receive loop ───────────────────────────────────────
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut total_bytes: u64 = 0;
    let mut total_packets: u64 = 0;
    let mut last_housekeeping = Instant::now();
    let mut last_stats_log = Instant::now();
    let housekeeping_interval = Duration::from_secs(1).min(timeout);
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                total_bytes += len as u64;
                total_packets += 1;
                table.input(&buf[..len], peer);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                tracing::error!(error = %e, "RTP socket receive failed");
                break;
            }
        }

        if last_housekeeping.elapsed() >= housekeeping_interval {
            let reaped = table.reap();
            if reaped > 0 {
                tracing::info!(reaped, remaining = table.len(), "idle sessions reaped");
            }
            *snapshots.lock().unwrap_or_else(|e| e.into_inner()) = table.snapshots();
            last_housekeeping = Instant::now();
        }

        if last_stats_log.elapsed() >= stats_interval {
            tracing::info!(
                packets = total_packets,
                bytes = total_bytes,
                sessions = table.len(),
                "ingest stats"
            );
            last_stats_log = Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    table.close_all();
    // Dropping the table drops the last publisher factory, ending the sink.
    drop(table);
    if sink.join().is_err() {
        tracing::error!("frame sink panicked");
    }
    tracing::info!(total_packets, total_bytes, "strata-rtp-ingest stopped");

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    bind: SocketAddr,
    config: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    metrics_port: Option<u16>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut bind = None;
    let mut config = None;
    let mut output_dir = None;
    let mut metrics_port = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--bind requires a value"))?;
                bind = Some(
                    val.parse::<SocketAddr>()
                        .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", val, e))?,
                );
            }
            "--config" | "-c" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?,
                ));
            }
            "--output-dir" | "-o" => {
                i += 1;
                output_dir = Some(PathBuf::from(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--output-dir requires a value"))?,
                ));
            }
            "--metrics-port" | "-m" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--metrics-port requires a value"))?;
                metrics_port = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid port '{}': {}", val, e))?,
                );
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if bind.is_none() {
        if let Ok(val) = std::env::var("BIND_ADDR") {
            bind = Some(val.trim().parse()?);
        }
    }
    if config.is_none() {
        config = std::env::var("INGEST_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
    }
    if metrics_port.is_none() {
        if let Ok(val) = std::env::var("METRICS_PORT") {
            metrics_port = val.parse().ok();
        }
    }

    let bind = match bind {
        Some(addr) => addr,
        None => DEFAULT_BIND.parse()?,
    };

    Ok(Args {
        bind,
        config,
        output_dir,
        metrics_port,
    })
}

fn print_help() {
    eprintln!(
        r#"strata-rtp-ingest: RTP push (PS/TS) ingest receiver

USAGE:
  strata-rtp-ingest [OPTIONS]

OPTIONS:
  --bind, -b <addr>          UDP bind address (default: 0.0.0.0:10000)
  --config, -c <path>        TOML configuration file
  --output-dir, -o <dir>     Write per-session elementary streams here
  --metrics-port, -m <port>  Prometheus metrics on 0.0.0.0:<port>/metrics,
                             session JSON on /sessions
  --help, -h                 Show this help

ENVIRONMENT VARIABLES:
  BIND_ADDR      Bind address (fallback for --bind)
  INGEST_CONFIG  Config file (fallback for --config)
  METRICS_PORT   Prometheus port (fallback for --metrics-port)
  RUST_LOG       Log level filter (e.g. info, debug, strata_ingest=trace)

EXAMPLES:
  # Monitor mode (logs stats, discards frames)
  strata-rtp-ingest --bind 0.0.0.0:10000

  # Record elementary streams
  strata-rtp-ingest --bind 0.0.0.0:10000 --output-dir ./capture
"#
    );
}

// ─── Frame Sink ─────────────────────────────────────────────────────────────

/// Drains publisher events until every publisher factory is gone.
fn run_frame_sink(events: Receiver<PublishEvent>, output_dir: Option<PathBuf>) {
    if output_dir.is_none() {
        tracing::info!("output: monitor mode (set --output-dir to capture)");
    }
    let mut files: HashMap<(String, Codec), Option<BufWriter<File>>> = HashMap::new();

    for event in events {
        match event {
            PublishEvent::Created { identity, options } => {
                tracing::info!(
                    stream = %identity,
                    rtxp = options.enable_rtxp,
                    hls = options.enable_hls,
                    mp4 = options.enable_mp4,
                    "publisher created"
                );
            }
            PublishEvent::TrackAdded { identity, track } => {
                tracing::info!(stream = %identity, kind = %track.kind, codec = %track.codec, "track added");
            }
            PublishEvent::ListenerAttached { .. } => {}
            PublishEvent::Frame { identity, frame } => {
                let Some(dir) = output_dir.as_ref() else {
                    continue;
                };
                let slot = files
                    .entry((identity.stream_id.clone(), frame.codec))
                    .or_insert_with(|| {
                        let path = dir.join(format!(
                            "{}.{}",
                            identity.stream_id,
                            file_extension(frame.codec)
                        ));
                        open_output(&path)
                    });
                if let Some(writer) = slot.as_mut() {
                    if let Err(e) = writer.write_all(&frame.data) {
                        tracing::error!(stream = %identity, error = %e, "output write failed");
                        *slot = None;
                    }
                }
            }
        }
    }

    for writer in files.values_mut().flatten() {
        let _ = writer.flush();
    }
}

fn open_output(path: &std::path::Path) -> Option<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(dir = %parent.display(), error = %e, "cannot create output directory");
            return None;
        }
    }
    match File::create(path) {
        Ok(file) => {
            tracing::info!(path = %path.display(), "output: writing elementary stream");
            Some(BufWriter::new(file))
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot create output file");
            None
        }
    }
}

fn file_extension(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "h264",
        Codec::H265 => "h265",
        Codec::Aac => "aac",
        Codec::G711 => "g711a",
        Codec::Unsupported(_) => "bin",
    }
}

// ─── Metrics Server ─────────────────────────────────────────────────────────

fn run_metrics_server(port: u16, snapshots: SharedSnapshots) -> anyhow::Result<()> {
    use std::io::BufRead;
    use std::io::BufReader;
    use std::net::TcpListener;

    let listener = TcpListener::bind(format!("0.0.0.0:{port}"))?;
    tracing::info!(port, "prometheus metrics server listening");

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "metrics accept error");
                continue;
            }
        };

        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).is_err() {
            continue;
        }

        // Drain remaining headers
        let mut header = String::new();
        loop {
            header.clear();
            match reader.read_line(&mut header) {
                Ok(0) | Err(_) => break,
                Ok(_) if header.trim().is_empty() => break,
                _ => {}
            }
        }

        let (status, content_type, body) = {
            let s = snapshots.lock().unwrap_or_else(|e| e.into_inner());
            if request_line.starts_with("GET /metrics") {
                ("200 OK", "text/plain; charset=utf-8", render_prometheus(&s))
            } else if request_line.starts_with("GET /sessions") {
                match serde_json::to_string(&*s) {
                    Ok(json) => ("200 OK", "application/json", json),
                    Err(e) => (
                        "500 Internal Server Error",
                        "text/plain; charset=utf-8",
                        e.to_string(),
                    ),
                }
            } else {
                ("404 Not Found", "text/plain; charset=utf-8", "404 Not Found".to_string())
            }
        };

        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let _ = stream.write_all(response.as_bytes());
    }

    Ok(())
}

// ─── Signal Handling ────────────────────────────────────────────────────────

mod ctrlc {
    use std::sync::atomic::{AtomicBool, Ordering};

    static HANDLER_SET: AtomicBool = AtomicBool::new(false);

    /// Run `f` once SIGINT or SIGTERM arrives. Must be called before other
    /// threads that should not see the signals are spawned.
    pub fn handle(f: impl Fn() + Send + 'static) {
        if HANDLER_SET.swap(true, Ordering::SeqCst) {
            return;
        }
        block_signals();
        let _ = std::thread::Builder::new()
            .name("signal".into())
            .spawn(move || {
                wait_for_signal();
                f();
            });
    }

    #[cfg(unix)]
    fn signal_mask() -> libc::sigset_t {
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGINT);
            libc::sigaddset(&mut mask, libc::SIGTERM);
            mask
        }
    }

    /// sigwait only sees signals that are blocked in the calling thread.
    #[cfg(unix)]
    fn block_signals() {
        let mask = signal_mask();
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
        }
    }

    #[cfg(unix)]
    fn wait_for_signal() {
        let mask = signal_mask();
        let mut sig: libc::c_int = 0;
        unsafe {
            libc::sigwait(&mask, &mut sig);
        }
    }

    #[cfg(not(unix))]
    fn block_signals() {}

    #[cfg(not(unix))]
    fn wait_for_signal() {
        loop {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
}
