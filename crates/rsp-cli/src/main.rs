#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rsp_block::FileSectorDevice;
use rsp_core::{PartialFile, render_progress_bar};
use rsp_fat::{FatVolume, FormatOptions, format_volume};
use rsp_types::{LunNbr, MediumId, TransferState};
use serde::Serialize;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "rawspool", about = "RawSpool — raw-sector transfer spooler for FAT32 media")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a FAT32 image.
    Format {
        /// Path to the image file.
        image: PathBuf,
        /// Image size in MiB (required unless the file already exists).
        #[arg(long)]
        size_mib: Option<u64>,
        /// Volume label (up to 11 characters).
        #[arg(long, default_value = "RAWSPOOL")]
        label: String,
    },
    /// Stream a payload into a contiguously allocated file on the image.
    Spool {
        /// Path to the image file.
        image: PathBuf,
        /// Destination path on the volume (8.3 components).
        dest: String,
        /// Local payload file.
        payload: PathBuf,
        /// Progress-state sidecar; enables resume across invocations.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Bytes per write call.
        #[arg(long, default_value_t = 64 * 1024)]
        chunk: usize,
        /// Start streaming at this payload offset instead of the valid
        /// head's end; useful to lay down the tail of a file first.
        #[arg(long)]
        offset: Option<u64>,
    },
    /// Show a file's extent and validity.
    Inspect {
        /// Path to the image file.
        image: PathBuf,
        /// Path on the volume.
        path: String,
        /// Progress-state sidecar to report validity from.
        #[arg(long)]
        state: Option<PathBuf>,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    path: String,
    size_bytes: u64,
    first_lba: u32,
    contiguous: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    percent_valid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<String>,
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn open_device(image: &Path) -> Result<Arc<FileSectorDevice>> {
    let meta = fs::metadata(image)
        .with_context(|| format!("cannot stat image {}", image.display()))?;
    // Image files do not hot-unplug; dev/ino still gives each image a
    // stable, distinct identity.
    let medium = MediumId((meta.dev() << 32) ^ meta.ino());
    let device = FileSectorDevice::open(image, medium)
        .with_context(|| format!("cannot open image {}", image.display()))?;
    Ok(Arc::new(device))
}

fn load_state(path: &Path) -> Result<Option<TransferState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read state {}", path.display()))?;
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("cannot parse state {}", path.display()))?;
    Ok(Some(state))
}

fn save_state(path: &Path, state: &TransferState) -> Result<()> {
    let raw = serde_json::to_string_pretty(state)?;
    fs::write(path, raw).with_context(|| format!("cannot write state {}", path.display()))
}

fn encode_label(label: &str) -> Result<[u8; 11]> {
    if label.len() > 11 || !label.is_ascii() {
        bail!("volume label must be at most 11 ASCII characters");
    }
    let mut padded = [b' '; 11];
    for (dst, ch) in padded.iter_mut().zip(label.bytes()) {
        *dst = ch.to_ascii_uppercase();
    }
    Ok(padded)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_format(image: &Path, size_mib: Option<u64>, label: &str) -> Result<()> {
    if let Some(size_mib) = size_mib {
        if size_mib == 0 {
            bail!("image size must be at least 1 MiB");
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(image)
            .with_context(|| format!("cannot create image {}", image.display()))?;
        file.set_len(size_mib * 1024 * 1024)?;
    } else if !image.exists() {
        bail!("image does not exist; pass --size-mib to create it");
    }

    let device = open_device(image)?;
    format_volume(
        device.as_ref(),
        LunNbr(0),
        FormatOptions {
            volume_label: encode_label(label)?,
            ..FormatOptions::default()
        },
    )?;
    device.flush()?;
    println!("formatted {}", image.display());
    Ok(())
}

fn cmd_spool(
    image: &Path,
    dest: &str,
    payload: &Path,
    state_path: Option<&Path>,
    chunk: usize,
    offset: Option<u64>,
) -> Result<()> {
    if chunk == 0 {
        bail!("chunk size must be nonzero");
    }
    let payload_len = fs::metadata(payload)
        .with_context(|| format!("cannot stat payload {}", payload.display()))?
        .len();

    let device = open_device(image)?;
    let volume = FatVolume::mount(Arc::clone(&device), LunNbr(0))?;

    let resume_state = match state_path {
        Some(path) => load_state(path)?,
        None => None,
    };
    let mut file = match resume_state {
        Some(state) => {
            PartialFile::open(&volume, Arc::clone(&device), dest, state)
                .with_context(|| format!("cannot resume {dest}"))?
        }
        None => PartialFile::create(&volume, Arc::clone(&device), dest, payload_len)
            .with_context(|| format!("cannot create {dest}"))?,
    };
    if file.total_size() != payload_len {
        bail!(
            "payload is {payload_len} bytes but the allocated extent holds {}",
            file.total_size()
        );
    }

    // Stream the gap between the valid head and the valid tail, unless the
    // caller pinned the starting offset.
    let start = match offset {
        Some(offset) => {
            if offset > payload_len {
                bail!("offset {offset} exceeds the payload length {payload_len}");
            }
            offset
        }
        None => file.state().valid_head.map_or(0, |p| p.end),
    };
    let end = file.state().valid_tail.map_or(payload_len, |p| p.start);
    let mut reader = fs::File::open(payload)?;
    reader.seek(SeekFrom::Start(start))?;
    file.seek(start);

    let mut buf = vec![0_u8; chunk];
    let mut remaining = end.saturating_sub(start);
    while remaining > 0 {
        let step = usize::try_from(remaining).unwrap_or(chunk).min(chunk);
        reader.read_exact(&mut buf[..step])?;
        file.write(&buf[..step])
            .with_context(|| format!("write failed at offset {}", file.current_offset()))?;
        remaining -= step as u64;
    }
    file.sync().context("sync failed")?;
    device.flush()?;

    let state = file.state();
    if let Some(path) = state_path {
        save_state(path, &state)?;
    }
    println!("{}  {}%", render_progress_bar(&state), state.percent_valid());
    Ok(())
}

fn cmd_inspect(image: &Path, path: &str, state_path: Option<&Path>, json: bool) -> Result<()> {
    let device = open_device(image)?;
    let volume = FatVolume::mount(Arc::clone(&device), LunNbr(0))?;
    let desc = volume.lookup(path)?;
    let contiguous = volume.is_chain_contiguous(desc.first_cluster())?;
    let extent = volume.file_extent(&desc)?;

    let state = match state_path {
        Some(state_path) => load_state(state_path)?,
        None => None,
    };
    let output = InspectOutput {
        path: path.to_owned(),
        size_bytes: extent.size_bytes,
        first_lba: extent.first_sector.0,
        contiguous,
        percent_valid: state.as_ref().map(TransferState::percent_valid),
        progress: state.as_ref().map(render_progress_bar),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("path:        {}", output.path);
        println!("size:        {} bytes", output.size_bytes);
        println!("first LBA:   {}", output.first_lba);
        println!("contiguous:  {}", output.contiguous);
        if let (Some(percent), Some(progress)) = (output.percent_valid, &output.progress) {
            println!("valid:       {progress}  {percent}%");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Format {
            image,
            size_mib,
            label,
        } => cmd_format(&image, size_mib, &label),
        Command::Spool {
            image,
            dest,
            payload,
            state,
            chunk,
            offset,
        } => cmd_spool(&image, &dest, &payload, state.as_deref(), chunk, offset),
        Command::Inspect {
            image,
            path,
            state,
            json,
        } => cmd_inspect(&image, &path, state.as_deref(), json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_encoding_pads_and_uppercases() {
        assert_eq!(&encode_label("usb").unwrap(), b"USB        ");
        assert!(encode_label("twelve chars").is_err());
    }

    #[test]
    fn spool_then_resume_via_state_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("usb.img");
        let payload = dir.path().join("job.bin");
        let state = dir.path().join("job.state.json");

        let bytes: Vec<u8> = (0..8192_u32).map(|i| (i % 253) as u8).collect();
        fs::write(&payload, &bytes).unwrap();

        cmd_format(&image, Some(1), "test").unwrap();
        cmd_spool(&image, "job.bin", &payload, Some(&state), 1000, None).unwrap();

        let saved: TransferState =
            serde_json::from_str(&fs::read_to_string(&state).unwrap()).unwrap();
        assert_eq!(saved.percent_valid(), 100);
        assert!(saved.has_valid_head(8192));

        // A second run resumes from the sidecar and has nothing to write.
        cmd_spool(&image, "job.bin", &payload, Some(&state), 1000, None).unwrap();

        cmd_inspect(&image, "job.bin", Some(&state), true).unwrap();
    }

    #[test]
    fn spool_with_offset_lays_down_the_tail_first() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("usb.img");
        let payload = dir.path().join("job.bin");
        let state = dir.path().join("job.state.json");

        let bytes: Vec<u8> = (0..8192_u32).map(|i| (i % 249) as u8).collect();
        fs::write(&payload, &bytes).unwrap();

        cmd_format(&image, Some(1), "test").unwrap();
        cmd_spool(&image, "job.bin", &payload, Some(&state), 1000, Some(4096)).unwrap();

        let saved: TransferState =
            serde_json::from_str(&fs::read_to_string(&state).unwrap()).unwrap();
        assert_eq!(saved.percent_valid(), 50);
        assert!(saved.has_valid_tail(4096));
        assert!(!saved.has_valid_head(1));

        // The follow-up run fills the head gap and completes the file.
        cmd_spool(&image, "job.bin", &payload, Some(&state), 1000, None).unwrap();
        let saved: TransferState =
            serde_json::from_str(&fs::read_to_string(&state).unwrap()).unwrap();
        assert_eq!(saved.percent_valid(), 100);
        assert!(saved.has_valid_head(8192));

        // An offset past the payload is refused outright.
        assert!(
            cmd_spool(&image, "job.bin", &payload, Some(&state), 1000, Some(9000)).is_err()
        );
    }
}
