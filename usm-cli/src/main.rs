//! `extract`/`create`/`probe`/`encrypt` subcommands over CRI Sofdec2 USM
//! files (component C8). File discovery, keying, the worker pool, and the
//! `ffprobe` subprocess glue live here; the core crate never touches a
//! filesystem path or a process.

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;

use clap::{Parser, Subcommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use usm::prober::{AudioProber, VideoProber};
use usm::{AudioStream, OpMode, UsmContainer, UsmError, VideoStream};
use usm_probe::{FfmpegAudioProber, FfmpegVideoProber};

#[derive(Parser, Debug)]
#[command(name = "usm-cli", about = "extract, create, probe, and encrypt CRI Sofdec2 USM files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Demux one or more USM files into their elementary streams.
    Extract(ExtractArgs),
    /// Mux a video (and optional audio) elementary stream into a new USM.
    Create(CreateArgs),
    /// Demux, then report per-packet timing via an external `ffprobe`.
    Probe(ProbeArgs),
    /// Re-serialize a USM file with an installed key, forcing ciphertext.
    Encrypt(EncryptArgs),
}

#[derive(clap::Args, Debug)]
struct ExtractArgs {
    /// A single `.usm` file or a directory to search recursively.
    #[arg(short, long, value_name = "PATH")]
    input: PathBuf,
    #[arg(short, long, value_name = "DIR", default_value = "./output")]
    output: PathBuf,
    #[arg(short, long, value_parser = parse_key)]
    key: Option<u64>,
    #[arg(long, default_value = "shift-jis")]
    encoding: String,
    /// Write one file per frame/block instead of one concatenated stream per channel.
    #[arg(long)]
    pages: bool,
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

#[derive(clap::Args, Debug)]
struct CreateArgs {
    #[arg(long, value_name = "FILE")]
    video: PathBuf,
    #[arg(long, value_name = "FILE")]
    audio: Option<PathBuf>,
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
    #[arg(short, long, value_parser = parse_key)]
    key: Option<u64>,
    #[arg(long, default_value = "shift-jis")]
    encoding: String,
}

#[derive(clap::Args, Debug)]
struct ProbeArgs {
    #[arg(short, long, value_name = "PATH")]
    input: PathBuf,
    #[arg(short, long, value_name = "DIR", default_value = "./output")]
    output: PathBuf,
    #[arg(long, default_value = "shift-jis")]
    encoding: String,
    #[arg(long, default_value = "ffprobe")]
    ffprobe: String,
}

#[derive(clap::Args, Debug)]
struct EncryptArgs {
    #[arg(short, long, value_name = "PATH")]
    input: PathBuf,
    /// Defaults to the input's own directory, keeping the filename.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
    #[arg(short, long, value_parser = parse_key)]
    key: u64,
    #[arg(long, default_value = "shift-jis")]
    encoding: String,
}

/// Decimal or `0x`-prefixed hex; bare hex digits are retried with an
/// implicit `0x` prefix, mirroring the reference implementation's
/// `key_normalize`.
fn parse_key(raw: &str) -> Result<u64, String> {
    parse_radix(raw).or_else(|_| parse_radix(&format!("0x{raw}")))
        .map_err(|_| format!("not a valid key: {raw}"))
}

fn parse_radix(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(rest, 16)
    } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        u64::from_str_radix(rest, 8)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(rest, 2)
    } else {
        s.parse()
    }
}

fn is_usm_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("usm") {
        return false;
    }
    let Ok(mut f) = fs::File::open(path) else {
        return false;
    };
    let mut sig = [0u8; 4];
    f.read_exact(&mut sig).is_ok() && &sig == b"CRID"
}

/// Walks `path` for `.usm` files, verifying the `CRID` signature on each
/// candidate. `path` itself may be a file.
fn find_usm(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(if is_usm_file(path) { vec![path.to_path_buf()] } else { Vec::new() });
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.is_dir() {
            found.extend(find_usm(&entry_path)?);
        } else if is_usm_file(&entry_path) {
            found.push(entry_path);
        }
    }
    found.sort();
    Ok(found)
}

fn dir_or_parent_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Extract(args) => run_extract(args),
        Command::Create(args) => run_create(args),
        Command::Probe(args) => run_probe(args),
        Command::Encrypt(args) => run_encrypt(args),
    }
}

fn extract_one(
    path: &Path,
    output_dir: &Path,
    key: Option<u64>,
    enc: &'static encoding_rs::Encoding,
    pages: bool,
) -> usm::Result<()> {
    let data = fs::read(path).map_err(UsmError::IoFailure)?;
    let container = UsmContainer::open_with_encoding(&data, key, enc)?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("usm");
    fs::create_dir_all(output_dir).map_err(UsmError::IoFailure)?;

    for stream in &container.video_streams {
        let ext = stream.codec_tag.to_lowercase();
        if pages {
            for (i, frame) in stream.frames.iter().enumerate() {
                let name = output_dir.join(format!("{stem}_video{}_{i:05}.{ext}", stream.channel_number));
                fs::write(name, &frame.data).map_err(UsmError::IoFailure)?;
            }
        } else {
            let name = output_dir.join(format!("{stem}_video{}.{ext}", stream.channel_number));
            let mut f = fs::File::create(name).map_err(UsmError::IoFailure)?;
            for frame in &stream.frames {
                f.write_all(&frame.data).map_err(UsmError::IoFailure)?;
            }
        }
    }
    for stream in &container.audio_streams {
        let ext = stream.codec_tag.to_lowercase();
        if pages {
            for (i, sample) in stream.samples.iter().enumerate() {
                let name = output_dir.join(format!("{stem}_audio{}_{i:05}.{ext}", stream.channel_number));
                fs::write(name, &sample.data).map_err(UsmError::IoFailure)?;
            }
        } else {
            let name = output_dir.join(format!("{stem}_audio{}.{ext}", stream.channel_number));
            let mut f = fs::File::create(name).map_err(UsmError::IoFailure)?;
            for sample in &stream.samples {
                f.write_all(&sample.data).map_err(UsmError::IoFailure)?;
            }
        }
    }
    Ok(())
}

fn run_extract(args: ExtractArgs) -> anyhow::Result<()> {
    let enc = usm::encoding::resolve(&args.encoding);
    let files = find_usm(&args.input)?;
    if files.is_empty() {
        warn!(path = %args.input.display(), "no .usm files found");
        return Ok(());
    }
    let total = files.len();
    let queue = Arc::new(Mutex::new(files.into_iter().collect::<VecDeque<_>>()));
    let done = Arc::new(Mutex::new(0usize));
    let workers = args.workers.max(1);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        let output = args.output.clone();
        let key = args.key;
        let pages = args.pages;
        handles.push(thread::spawn(move || loop {
            let next = queue.lock().expect("queue mutex poisoned").pop_front();
            let Some(path) = next else { break };
            match extract_one(&path, &output, key, enc, pages) {
                Ok(()) => info!(file = %path.display(), "extracted"),
                Err(e) => warn!(file = %path.display(), error = %e, "extract failed"),
            }
            let mut done = done.lock().expect("progress mutex poisoned");
            *done += 1;
            print!("\x1b[2K\r{done}/{total}");
            std::io::stdout().flush().ok();
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
    println!();
    Ok(())
}

fn run_create(args: CreateArgs) -> anyhow::Result<()> {
    let enc = usm::encoding::resolve(&args.encoding);

    let mut video_prober = FfmpegVideoProber::new(args.video.to_string_lossy().into_owned());
    let probed_video = video_prober.probe_video()?;
    info!(frames = probed_video.frames.len(), width = probed_video.width, height = probed_video.height, "probed video");
    let video_stream = VideoStream::from_probe(probed_video, 0);

    let mut audio_streams = Vec::new();
    if let Some(audio_path) = &args.audio {
        let mut audio_prober = FfmpegAudioProber::new(audio_path.to_string_lossy().into_owned());
        let probed_audio = audio_prober.probe_audio()?;
        info!(blocks = probed_audio.blocks.len(), sample_rate = probed_audio.sample_rate, "probed audio");
        audio_streams.push(AudioStream::from_probe(probed_audio, 0));
    }

    let mut container = UsmContainer::from_streams(vec![video_stream], audio_streams)?;
    let mode = if let Some(key) = args.key {
        container.set_video_key(key);
        container.set_audio_key(key);
        OpMode::Encrypt
    } else {
        OpMode::None
    };

    let written = write_stream(&args.output, container.stream_with_encoding(mode, enc)?)?;
    info!(bytes = written, path = %args.output.display(), "wrote usm container");
    Ok(())
}

/// Drains a lazy chunk cursor straight to a file, one buffer at a time, and
/// returns the total byte count for logging.
fn write_stream(path: &Path, stream: usm::UsmByteStream<'_>) -> anyhow::Result<u64> {
    let mut f = fs::File::create(path)?;
    let mut written = 0u64;
    for chunk in stream {
        let chunk = chunk?;
        f.write_all(&chunk)?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

#[derive(Deserialize, Default)]
struct FfprobePacket {
    dts: Option<i64>,
    pts_time: Option<String>,
    pos: Option<String>,
    flags: Option<String>,
}

#[derive(Deserialize, Default)]
struct FfprobeOutput {
    #[serde(default)]
    packets: Vec<FfprobePacket>,
}

fn probe_stream(ffprobe: &str, stem: &str, kind: &str, idx: usize, data: &[u8]) -> anyhow::Result<()> {
    let mut tmp = std::env::temp_dir();
    tmp.push(format!("{stem}_{kind}{idx}.bin"));
    fs::write(&tmp, data)?;

    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_entries", "packet=dts,pts_time,pos,flags"])
        .arg(&tmp)
        .output();
    fs::remove_file(&tmp).ok();
    let output = output?;

    if !output.status.success() {
        anyhow::bail!("ffprobe exited with {}", output.status);
    }
    let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
    for (i, packet) in parsed.packets.iter().enumerate() {
        info!(
            stream = kind,
            index = idx,
            packet = i,
            dts = ?packet.dts,
            pts_time = ?packet.pts_time.as_deref(),
            pos = ?packet.pos.as_deref(),
            flags = ?packet.flags.as_deref(),
            "packet"
        );
    }
    Ok(())
}

fn run_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let enc = usm::encoding::resolve(&args.encoding);
    let files = find_usm(&args.input)?;
    fs::create_dir_all(&args.output)?;

    for path in files {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("usm").to_string();
        let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(3).map(char::from).collect();
        let log_path = args.output.join(format!("{stem}_{suffix}.log"));
        let log_file = fs::File::create(&log_path)?;

        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(Mutex::new(log_file));
        let subscriber = tracing_subscriber::registry().with(json_layer);

        let result = tracing::subscriber::with_default(subscriber, || -> anyhow::Result<()> {
            let data = fs::read(&path)?;
            let container = UsmContainer::open_with_encoding(&data, None, enc)?;
            let (video, audio) = container.demux();
            for (idx, bytes) in video.iter().enumerate() {
                probe_stream(&args.ffprobe, &stem, "video", idx, bytes)?;
            }
            for (idx, bytes) in audio.iter().enumerate() {
                probe_stream(&args.ffprobe, &stem, "audio", idx, bytes)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => println!("{}: wrote {}", path.display(), log_path.display()),
            Err(e) => warn!(file = %path.display(), error = %e, "probe failed"),
        }
    }
    Ok(())
}

fn run_encrypt(args: EncryptArgs) -> anyhow::Result<()> {
    let enc = usm::encoding::resolve(&args.encoding);
    let data = fs::read(&args.input)?;

    let mut container = match UsmContainer::open_with_encoding(&data, None, enc) {
        Err(UsmError::DecryptionRequired) => UsmContainer::open_with_encoding(&data, Some(args.key), enc)?,
        other => other?,
    };
    container.set_video_key(args.key);
    container.set_audio_key(args.key);

    let output_path = args.output.clone().unwrap_or_else(|| {
        let name = args.input.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("out.usm"));
        dir_or_parent_dir(&args.input).join(name)
    });
    let written = write_stream(&output_path, container.stream_with_encoding(OpMode::Encrypt, enc)?)?;
    info!(bytes = written, path = %output_path.display(), "wrote encrypted usm");
    Ok(())
}
